//! Chip identification and geometry detection.

use crate::frame::MAX_ADDRESS;
use crate::status::BusyCheck;
use crate::utils::HexSlice;
use alloc::vec::Vec;
use core::fmt;

/// Length of a program page in bytes. Identical for all supported families.
pub const PAGE_LEN: u32 = 256;

/// JEDEC continuation code preceding manufacturer IDs from later banks.
const CONTINUATION_CODE: u8 = 0x7F;

/// JEDEC manufacturer and device identification.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Identification {
    /// Manufacturer ID, memory type and memory capacity code.
    bytes: [u8; 3],

    /// Whatever the chip sent after the capacity code.
    unique_id: Vec<u8>,

    /// The number of continuations that precede the main manufacturer ID
    continuations: u8,
}

impl Identification {
    /// Build an Identification from the bytes following the read-ID opcode.
    ///
    /// Missing bytes are treated as zero.
    pub fn from_jedec_id(buf: &[u8]) -> Identification {
        // Some manufacturers are prefixed by continuation codes, eg. Cypress:
        // 7F 7F 7F 7F 7F 7F C2 22 08
        let start = buf
            .iter()
            .position(|&b| b != CONTINUATION_CODE)
            .unwrap_or(0);
        let byte = |i: usize| buf.get(start + i).copied().unwrap_or(0);

        Self {
            bytes: [byte(0), byte(1), byte(2)],
            unique_id: buf.get(start + 3..).unwrap_or(&[]).to_vec(),
            continuations: start as u8,
        }
    }

    /// The JEDEC manufacturer code for this chip.
    pub fn manufacturer_id(&self) -> u8 {
        self.bytes[0]
    }

    pub fn memory_type(&self) -> u8 {
        self.bytes[1]
    }

    /// The memory capacity code; the chip holds `2^(code + 3)` bits.
    pub fn capacity_code(&self) -> u8 {
        self.bytes[2]
    }

    /// Bytes following the capacity code (unique ID / extended device data).
    pub fn unique_id(&self) -> &[u8] {
        &self.unique_id
    }

    /// Number of continuation codes in this chip ID.
    pub fn continuation_count(&self) -> u8 {
        self.continuations
    }

    /// Whether the response looks like a floating or shorted bus.
    pub fn is_blank(&self) -> bool {
        self.manufacturer_id() == 0x00 || self.manufacturer_id() == 0xFF
    }
}

impl fmt::Debug for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identification")
            .field("manufacturer_id", &format_args!("0x{:02x}", self.bytes[0]))
            .field("memory_type", &format_args!("0x{:02x}", self.bytes[1]))
            .field("capacity_code", &format_args!("0x{:02x}", self.bytes[2]))
            .field("unique_id", &HexSlice(&self.unique_id))
            .finish()
    }
}

/// Supported flash families.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Micron/ST M25P series.
    M25P,
    /// Micron N25Q series.
    N25Q,
    /// ISSI IS25LP/IS25WP series.
    IS25L,
    /// Unrecognized chip, driven with conservative defaults.
    Unknown,
}

impl Family {
    /// Fixed erase geometry and busy check of the family.
    fn params(self) -> FamilyParams {
        match self {
            // M25P10A: 256 Kbit sectors
            Family::M25P => FamilyParams {
                sector_len: 32 * 1024,
                subsector_len: None,
                busy_check: BusyCheck::Status,
            },
            Family::N25Q => FamilyParams {
                sector_len: 64 * 1024,
                subsector_len: Some(4 * 1024),
                busy_check: BusyCheck::FlagStatus,
            },
            Family::IS25L => FamilyParams {
                sector_len: 4 * 1024,
                subsector_len: None,
                busy_check: BusyCheck::Status,
            },
            Family::Unknown => FamilyParams {
                sector_len: LARGEST_SECTOR_LEN,
                subsector_len: None,
                busy_check: BusyCheck::Status,
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::M25P => "M25P",
            Family::N25Q => "N25Q",
            Family::IS25L => "IS25L",
            Family::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct FamilyParams {
    sector_len: u32,
    subsector_len: Option<u32>,
    busy_check: BusyCheck,
}

/// Largest sector of all known families.
const LARGEST_SECTOR_LEN: u32 = 64 * 1024;

/// Known chips, keyed on manufacturer ID and memory type. `None` matches any
/// memory type of that manufacturer.
const FAMILIES: &[(u8, Option<u8>, Family)] = &[
    (0x20, Some(0x20), Family::M25P),
    (0x20, Some(0xBA), Family::N25Q),
    (0x9D, None, Family::IS25L),
];

/// Geometry of a detected chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    family: Family,
    page_len: u32,
    sector_len: u32,
    subsector_len: Option<u32>,
    capacity_bits: u64,
    busy_check: BusyCheck,
}

impl Geometry {
    fn new(family: Family, capacity_bits: u64) -> Self {
        let params = family.params();
        debug_assert_eq!(params.sector_len % PAGE_LEN, 0);
        Self {
            family,
            page_len: PAGE_LEN,
            sector_len: params.sector_len,
            subsector_len: params.subsector_len,
            capacity_bits,
            busy_check: params.busy_check,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn page_len(&self) -> u32 {
        self.page_len
    }

    /// Size of the region erased by a sector erase.
    pub fn sector_len(&self) -> u32 {
        self.sector_len
    }

    /// Size of the region erased by a subsector erase, if the family has one.
    pub fn subsector_len(&self) -> Option<u32> {
        self.subsector_len
    }

    pub fn capacity_bits(&self) -> u64 {
        self.capacity_bits
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bits / 8
    }

    /// Number of bytes reachable through the 3-byte address field.
    pub fn addressable_bytes(&self) -> u32 {
        self.capacity_bytes().min(u64::from(MAX_ADDRESS) + 1) as u32
    }

    pub fn busy_check(&self) -> BusyCheck {
        self.busy_check
    }

    /// Whether the family has a flag status register.
    pub fn has_flag_status(&self) -> bool {
        self.family == Family::N25Q
    }
}

impl Default for Geometry {
    /// Geometry used before a chip has been identified.
    fn default() -> Self {
        Geometry::new(Family::Unknown, capacity_bits(0x15))
    }
}

/// Capacity in bits encoded by the capacity code of the identification.
fn capacity_bits(code: u8) -> u64 {
    match 1u64.checked_shl(u32::from(code) + 3) {
        Some(bits) => bits,
        None => {
            warn!(
                "implausible capacity code 0x{:02x}, assuming the full 24-bit address space",
                code
            );
            (u64::from(MAX_ADDRESS) + 1) * 8
        }
    }
}

/// Determines the chip geometry from its identification.
///
/// Unrecognized chips are not an error: they get the largest known sector
/// size, which is enough to erase and program them correctly.
pub fn resolve(id: &Identification) -> Geometry {
    let mfr = id.manufacturer_id();
    let memory_type = id.memory_type();

    let family = FAMILIES
        .iter()
        .find(|(m, t, _)| *m == mfr && t.map_or(true, |t| t == memory_type))
        .map(|(_, _, family)| *family);

    let family = match family {
        Some(family) => family,
        None if FAMILIES.iter().any(|(m, _, _)| *m == mfr) => {
            warn!(
                "unknown memory type 0x{:02x} for manufacturer ID 0x{:02x}",
                memory_type, mfr
            );
            Family::Unknown
        }
        None => {
            warn!("unknown flash type: manufacturer ID 0x{:02x}", mfr);
            Family::Unknown
        }
    };

    let geometry = Geometry::new(family, capacity_bits(id.capacity_code()));
    info!(
        "detected {} flash with a capacity of {} Mbit ({} KiB)",
        family,
        geometry.capacity_bits() / (1024 * 1024),
        geometry.capacity_bytes() / 1024
    );
    geometry
}
