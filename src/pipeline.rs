//! Whole-image operations: program, verify and dump.

use crate::config::EraseStrategy;
use crate::flash::Flash;
use crate::utils::{window, HexSlice};
use crate::{Error, Read};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// First differing byte found by a verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    offset: usize,
    expected: Vec<u8>,
    actual: Vec<u8>,
}

impl Mismatch {
    /// Offset of the first differing byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reference bytes starting at the mismatch.
    pub fn expected(&self) -> &[u8] {
        &self.expected
    }

    /// Flash bytes starting at the mismatch.
    pub fn actual(&self) -> &[u8] {
        &self.actual
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "first error at position {}", self.offset)?;
        writeln!(f, "expected: {}", HexSlice(&self.expected))?;
        write!(f, "flash:    {}", HexSlice(&self.actual))
    }
}

/// Outcome of a verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    mismatch: Option<Mismatch>,
}

impl VerifyResult {
    /// Compares `actual` against `expected` byte by byte.
    ///
    /// If one buffer is a prefix of the other, the mismatch is at the end of
    /// the shorter one.
    pub fn compare(expected: &[u8], actual: &[u8]) -> Self {
        let offset = expected
            .iter()
            .zip(actual)
            .position(|(e, a)| e != a)
            .or_else(|| {
                if expected.len() == actual.len() {
                    None
                } else {
                    Some(expected.len().min(actual.len()))
                }
            });

        VerifyResult {
            mismatch: offset.map(|offset| Mismatch {
                offset,
                expected: window(expected, offset).to_vec(),
                actual: window(actual, offset).to_vec(),
            }),
        }
    }

    pub fn matched(&self) -> bool {
        self.mismatch.is_none()
    }

    pub fn first_mismatch_offset(&self) -> Option<usize> {
        self.mismatch.as_ref().map(Mismatch::offset)
    }

    pub fn mismatch(&self) -> Option<&Mismatch> {
        self.mismatch.as_ref()
    }
}

impl<SPI, CS, D> Flash<SPI, CS, D>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    D: DelayMs<u32>,
{
    /// Erases the chip as far as needed and programs `data` from address 0.
    ///
    /// Returns once the chip has finished the last page program. A transport
    /// error aborts the sequence and leaves the chip partially programmed.
    pub fn program(&mut self, data: &[u8]) -> Result<(), Error<SPI, CS>> {
        self.check_write_range(0, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        self.erase_for(data.len())?;

        let page_len = self.geometry().page_len() as usize;
        info!("Writing {} pages to flash", data.len().div_ceil(page_len));
        for (c, chunk) in data.chunks(page_len).enumerate() {
            self.page_program((c * page_len) as u32, chunk)?;
        }
        self.wait_idle()
    }

    /// Erases every byte of `[0, len)` using the configured strategy.
    fn erase_for(&mut self, len: usize) -> Result<(), Error<SPI, CS>> {
        let geometry = *self.geometry();
        let unit = match self.config().erase_strategy() {
            EraseStrategy::Bulk => {
                info!("Erasing the whole chip");
                return self.bulk_erase();
            }
            EraseStrategy::Subsectors => match geometry.subsector_len() {
                Some(len) => Some(len),
                None => {
                    warn!(
                        "{} has no subsector erase, erasing sectors instead",
                        geometry.family()
                    );
                    None
                }
            },
            EraseStrategy::Sectors => None,
        };

        match unit {
            Some(subsector_len) => {
                let count = len.div_ceil(subsector_len as usize);
                info!("Erasing {} subsectors of {} bytes", count, subsector_len);
                for c in 0..count {
                    self.subsector_erase(c as u32 * subsector_len)?;
                }
                Ok(())
            }
            None => {
                let sector_len = geometry.sector_len();
                let count = len.div_ceil(sector_len as usize);
                info!("Erasing {} sectors of {} bytes", count, sector_len);
                for c in 0..count {
                    self.sector_erase(c as u32 * sector_len)?;
                }
                Ok(())
            }
        }
    }

    /// Reads back `reference.len()` bytes from address 0 and compares them to
    /// `reference`.
    ///
    /// A mismatch is reported in the result, not as an error.
    pub fn verify(&mut self, reference: &[u8]) -> Result<VerifyResult, Error<SPI, CS>> {
        let mut actual = vec![0; reference.len()];
        self.read(0, &mut actual)?;

        let result = VerifyResult::compare(reference, &actual);
        match result.mismatch() {
            None => info!("Verify: PASS ({} bytes)", reference.len()),
            Some(mismatch) => warn!("Verify: ERROR, {}", mismatch),
        }
        Ok(result)
    }

    /// Reads the whole chip, up to the 16 MiB reachable with 3-byte
    /// addresses.
    pub fn dump(&mut self) -> Result<Vec<u8>, Error<SPI, CS>> {
        let len = self.geometry().addressable_bytes() as usize;
        info!("Reading {} bytes", len);
        self.read_to_vec(0, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sim::{SimChip, SimCommand, SimCs, SimDelay, SimHandle, SimSpi};

    fn open(chip: &SimHandle, config: Config) -> Flash<SimSpi, SimCs, SimDelay> {
        Flash::init(chip.spi(), chip.cs(), SimDelay::default(), config).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + i / 256) as u8).collect()
    }

    fn page_programs(chip: &SimHandle) -> Vec<(u32, usize)> {
        chip.commands()
            .into_iter()
            .filter_map(|c| match c {
                SimCommand::PageProgram { address, len } => Some((address, len)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn partial_last_page_is_not_padded() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        flash.program(&pattern(300)).unwrap();
        assert_eq!(page_programs(&chip), [(0, 256), (256, 44)]);
    }

    #[test]
    fn program_then_verify_matches() {
        for chip in &[SimChip::n25q032(), SimChip::m25p10(), SimChip::is25lp064()] {
            // Leftovers from a previous image must be erased first.
            chip.load(0, &vec![0x00; 40_000]);
            let mut flash = open(chip, Config::default());
            let data = pattern(70_001);
            flash.program(&data).unwrap();

            let result = flash.verify(&data).unwrap();
            assert!(result.matched());
            assert_eq!(result.first_mismatch_offset(), None);
            assert!(chip.violations().is_empty());
        }
    }

    #[test]
    fn erase_precedes_program() {
        let chip = SimChip::m25p10();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        flash.program(&pattern(40_000)).unwrap();

        let writes: Vec<_> = chip
            .commands()
            .into_iter()
            .filter(|c| !c.is_poll())
            .collect();
        // Two 32 KiB sectors, then 157 pages, each with its own write enable.
        assert_eq!(writes[0], SimCommand::WriteEnable);
        assert_eq!(writes[1], SimCommand::SectorErase { address: 0 });
        assert_eq!(writes[2], SimCommand::WriteEnable);
        assert_eq!(writes[3], SimCommand::SectorErase { address: 0x8000 });
        assert_eq!(writes.len(), 4 + 2 * 157);
        for pair in writes[4..].chunks(2) {
            assert_eq!(pair[0], SimCommand::WriteEnable);
            assert!(matches!(pair[1], SimCommand::PageProgram { .. }));
        }

        // Every write was preceded by an idle poll.
        let commands = chip.commands();
        for (i, command) in commands.iter().enumerate() {
            if *command == SimCommand::WriteEnable {
                assert_eq!(commands[i - 1], SimCommand::ReadStatus);
            }
        }
        assert!(chip.violations().is_empty());
    }

    #[test]
    fn subsector_strategy() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default().erase(EraseStrategy::Subsectors));
        chip.clear_commands();
        flash.program(&pattern(9000)).unwrap();

        let erases: Vec<_> = chip
            .commands()
            .into_iter()
            .filter(|c| !c.is_poll() && *c != SimCommand::WriteEnable)
            .take_while(|c| !matches!(c, SimCommand::PageProgram { .. }))
            .collect();
        assert_eq!(
            erases,
            [
                SimCommand::SubsectorErase { address: 0 },
                SimCommand::SubsectorErase { address: 0x1000 },
                SimCommand::SubsectorErase { address: 0x2000 },
            ]
        );
    }

    #[test]
    fn subsector_strategy_falls_back_to_sectors() {
        let chip = SimChip::m25p10();
        let mut flash = open(&chip, Config::default().erase(EraseStrategy::Subsectors));
        chip.clear_commands();
        flash.program(&pattern(100)).unwrap();
        assert!(chip
            .commands()
            .contains(&SimCommand::SectorErase { address: 0 }));
        assert!(flash.verify(&pattern(100)).unwrap().matched());
    }

    #[test]
    fn bulk_strategy() {
        let chip = SimChip::n25q032();
        chip.load(0x30_0000, &[0u8; 16]);
        let mut flash = open(&chip, Config::default().erase(EraseStrategy::Bulk));
        chip.clear_commands();
        flash.program(&pattern(1000)).unwrap();

        let commands = chip.commands();
        assert_eq!(
            commands
                .iter()
                .filter(|c| **c == SimCommand::BulkErase)
                .count(),
            1
        );
        assert!(!commands
            .iter()
            .any(|c| matches!(c, SimCommand::SectorErase { .. })));
        assert_eq!(chip.memory()[0x30_0000], 0xFF);
        assert!(chip.violations().is_empty());
    }

    #[test]
    fn mismatch_is_reported() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        let data = pattern(64);
        flash.program(&data).unwrap();

        let mut reference = data.clone();
        reference[10] ^= 0xFF;
        let result = flash.verify(&reference).unwrap();
        assert!(!result.matched());
        assert_eq!(result.first_mismatch_offset(), Some(10));

        let mismatch = result.mismatch().unwrap();
        assert_eq!(mismatch.expected(), &reference[10..26]);
        assert_eq!(mismatch.actual(), &data[10..26]);
    }

    #[test]
    fn compare_handles_length_difference() {
        assert!(VerifyResult::compare(&[1, 2, 3], &[1, 2, 3]).matched());
        assert!(VerifyResult::compare(&[], &[]).matched());
        assert_eq!(
            VerifyResult::compare(&[1, 2, 3], &[1, 2]).first_mismatch_offset(),
            Some(2)
        );
        assert_eq!(
            VerifyResult::compare(&[0, 2, 3], &[1, 2, 3]).first_mismatch_offset(),
            Some(0)
        );
    }

    #[test]
    fn mismatch_display() {
        let result = VerifyResult::compare(&[0xAA, 0xBB], &[0xAA, 0xBC]);
        assert_eq!(
            result.mismatch().unwrap().to_string(),
            "first error at position 1\nexpected: bb\nflash:    bc"
        );
    }

    #[test]
    fn oversized_image_is_rejected() {
        let chip = SimChip::m25p10();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        match flash.program(&vec![0; 128 * 1024 + 1]) {
            Err(Error::InvalidLength { address, length }) => {
                assert_eq!((address, length), (0, 128 * 1024 + 1))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(chip.commands().is_empty());
    }

    #[test]
    fn empty_image_is_a_no_op() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        flash.program(&[]).unwrap();
        assert!(flash.verify(&[]).unwrap().matched());
        assert!(chip.commands().is_empty());
    }

    #[test]
    fn dump_reads_whole_chip() {
        let chip = SimChip::m25p10();
        let mut flash = open(&chip, Config::default());
        let data = pattern(5000);
        flash.program(&data).unwrap();

        let image = flash.dump().unwrap();
        assert_eq!(image.len(), 128 * 1024);
        assert_eq!(image[..5000], data[..]);
        assert!(image[5000..].iter().all(|&b| b == 0xFF));
        assert_eq!(image, chip.memory());
    }
}
