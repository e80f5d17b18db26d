//! Command frames of the 25-series protocol.
//!
//! A frame is an opcode byte, optionally followed by a 3-byte address (least
//! significant byte first) and a payload. Since the bus is full-duplex, the
//! response arrives in the same transfer; the bytes clocked in while the
//! header was sent carry no data and are dropped by [`decode`].

use alloc::vec::Vec;

/// Highest address that fits into the 3-byte address field.
pub const MAX_ADDRESS: u32 = 0x00FF_FFFF;

/// Number of address bytes following the opcode.
pub const ADDRESS_LEN: usize = 3;

/// Command opcodes understood by the supported chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Read manufacturer ID, memory type, capacity code and unique ID.
    ReadJedecId = 0x9F,
    /// Read the 8-bit status register.
    ReadStatus = 0x05,
    /// Read the 8-bit flag status register (N25Q).
    ReadFlagStatus = 0x70,
    /// Set the write enable latch.
    WriteEnable = 0x06,
    PageProg = 0x02,
    SectorErase = 0xD8,
    SubsectorErase = 0x20,
    BulkErase = 0xC7,
    Read = 0x03,
}

/// An address did not fit into the 3-byte address field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressOutOfRange(pub u32);

/// Encodes `addr` as the 3-byte address field.
pub fn encode_address(addr: u32) -> Result<[u8; ADDRESS_LEN], AddressOutOfRange> {
    if addr > MAX_ADDRESS {
        return Err(AddressOutOfRange(addr));
    }
    let bytes = addr.to_le_bytes();
    Ok([bytes[0], bytes[1], bytes[2]])
}

/// Decodes a 3-byte address field.
pub fn decode_address(bytes: [u8; ADDRESS_LEN]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame<'a> {
    opcode: Opcode,
    address: Option<[u8; ADDRESS_LEN]>,
    payload: &'a [u8],
    /// Zero bytes clocked out after the payload to receive response data.
    filler: usize,
}

impl<'a> CommandFrame<'a> {
    /// Creates a frame consisting of just `opcode`.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            address: None,
            payload: &[],
            filler: 0,
        }
    }

    /// Adds an address to the frame.
    pub fn address(mut self, addr: u32) -> Result<Self, AddressOutOfRange> {
        self.address = Some(encode_address(addr)?);
        Ok(self)
    }

    /// Adds a payload to the frame.
    pub fn payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }

    /// Clocks out `len` extra zero bytes so that `len` response bytes can be
    /// received.
    pub fn response(mut self, len: usize) -> Self {
        self.filler = len;
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Length of the opcode and address, ie. the number of bytes to skip in
    /// the response.
    pub fn header_len(&self) -> usize {
        1 + self.address.map_or(0, |a| a.len())
    }

    /// Total number of bytes on the wire.
    pub fn wire_len(&self) -> usize {
        self.header_len() + self.payload.len() + self.filler
    }

    /// Serializes the frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.wire_len());
        bytes.push(self.opcode as u8);
        if let Some(address) = &self.address {
            bytes.extend_from_slice(address);
        }
        bytes.extend_from_slice(self.payload);
        bytes.resize(bytes.len() + self.filler, 0);
        bytes
    }
}

/// Builds the raw bytes for `opcode` with an optional address and payload.
pub fn encode(
    opcode: Opcode,
    address: Option<u32>,
    payload: &[u8],
) -> Result<Vec<u8>, AddressOutOfRange> {
    let mut frame = CommandFrame::new(opcode).payload(payload);
    if let Some(addr) = address {
        frame = frame.address(addr)?;
    }
    Ok(frame.encode())
}

/// Returns the response bytes following the first `skip` bytes of `raw`.
pub fn decode(raw: &[u8], skip: usize) -> &[u8] {
    raw.get(skip..).unwrap_or(&[])
}
