//! In-memory 25-series flash chip.
//!
//! [`SimChip`] emulates enough of a real chip to exercise the driver without
//! hardware: identification, status and flag status polling, the write enable
//! latch, page program with in-page wrap-around, sector/subsector/bulk erase
//! and reads. A write or erase keeps the chip busy for a configurable number
//! of polls, during which it ignores every command except register reads,
//! just like the real thing.
//!
//! The bus and chip select halves share the chip, so a test can keep a
//! [`SimHandle`] to inspect the command log after handing the bus to the
//! driver.

use crate::frame::{decode_address, Opcode, ADDRESS_LEN};
use crate::status::{FlagStatus, Status};
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::convert::Infallible;
use core::fmt;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// Busy polls after a write or erase unless configured otherwise.
const DEFAULT_BUSY_POLLS: u32 = 2;

/// A decoded command as seen by the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    ReadJedecId,
    ReadStatus,
    ReadFlagStatus,
    WriteEnable,
    PageProgram { address: u32, len: usize },
    SectorErase { address: u32 },
    SubsectorErase { address: u32 },
    BulkErase,
    Read { address: u32, len: usize },
    Unknown(u8),
}

impl SimCommand {
    /// Whether this is a busy poll.
    pub fn is_poll(&self) -> bool {
        matches!(self, SimCommand::ReadStatus | SimCommand::ReadFlagStatus)
    }
}

/// A protocol violation by the driver. The offending command was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Command sent while a write or erase was in progress.
    WhileBusy(SimCommand),
    /// Write or erase sent without setting the write enable latch first.
    WriteNotEnabled(SimCommand),
    /// Transfer without the chip being selected.
    NotSelected,
}

/// Transfer errors of the simulated bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// Injected with [`SimHandle::fail_after`].
    Fault,
    /// The chip select was not asserted.
    NotSelected,
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Fault => f.write_str("simulated bus fault"),
            SimError::NotSelected => f.write_str("transfer without chip select"),
        }
    }
}

/// State of the emulated chip.
#[derive(Debug)]
pub struct SimChip {
    id: Vec<u8>,
    memory: Vec<u8>,
    sector_len: usize,
    subsector_len: Option<usize>,
    flag_status: bool,
    write_enabled: bool,
    busy_polls: u32,
    busy_left: u32,
    stuck: bool,
    selected: bool,
    fail_after: Option<usize>,
    commands: Vec<SimCommand>,
    violations: Vec<Violation>,
}

impl SimChip {
    /// Creates a blank (all 0xFF) chip answering the read-ID command with
    /// `id`. It has 64 KiB sectors, no subsectors and no flag status register.
    pub fn new(id: [u8; 3], size: usize) -> SimHandle {
        Self::build(id, size, 64 * 1024, None, false)
    }

    /// Micron N25Q032: 4 MiB, 64 KiB sectors, 4 KiB subsectors, flag status.
    pub fn n25q032() -> SimHandle {
        Self::build(
            [0x20, 0xBA, 0x16],
            4 * 1024 * 1024,
            64 * 1024,
            Some(4 * 1024),
            true,
        )
    }

    /// Micron M25P10-A: 128 KiB, 32 KiB sectors.
    pub fn m25p10() -> SimHandle {
        Self::build([0x20, 0x20, 0x11], 128 * 1024, 32 * 1024, None, false)
    }

    /// ISSI IS25LP064: 8 MiB, 4 KiB sectors.
    pub fn is25lp064() -> SimHandle {
        Self::build([0x9D, 0x60, 0x17], 8 * 1024 * 1024, 4 * 1024, None, false)
    }

    fn build(
        id: [u8; 3],
        size: usize,
        sector_len: usize,
        subsector_len: Option<usize>,
        flag_status: bool,
    ) -> SimHandle {
        let mut id = id.to_vec();
        // Extended device data / unique ID.
        id.extend_from_slice(&[0x10, 0x00, 0x12, 0x34]);
        SimHandle(Rc::new(RefCell::new(SimChip {
            id,
            memory: vec![0xFF; size],
            sector_len,
            subsector_len,
            flag_status,
            write_enabled: false,
            busy_polls: DEFAULT_BUSY_POLLS,
            busy_left: 0,
            stuck: false,
            selected: false,
            fail_after: None,
            commands: Vec::new(),
            violations: Vec::new(),
        })))
    }

    fn is_busy(&self) -> bool {
        self.stuck || self.busy_left > 0
    }

    fn status(&self) -> u8 {
        let mut status = Status::empty();
        status.set(Status::BUSY, self.is_busy());
        status.set(Status::WEL, self.write_enabled);
        status.bits()
    }

    fn flag_status(&self) -> u8 {
        if !self.flag_status {
            // Not implemented by the chip, MISO stays low.
            return 0;
        }
        let mut flags = FlagStatus::empty();
        flags.set(FlagStatus::READY, !self.is_busy());
        flags.bits()
    }

    /// Counts a busy poll.
    fn poll(&mut self) {
        self.busy_left = self.busy_left.saturating_sub(1);
    }

    fn address(bytes: &[u8]) -> u32 {
        let mut addr = [0; ADDRESS_LEN];
        for (dst, src) in addr.iter_mut().zip(bytes.iter().skip(1)) {
            *dst = *src;
        }
        decode_address(addr)
    }

    fn parse(bytes: &[u8]) -> SimCommand {
        let data_len = bytes.len().saturating_sub(1 + ADDRESS_LEN);
        match bytes[0] {
            op if op == Opcode::ReadJedecId as u8 => SimCommand::ReadJedecId,
            op if op == Opcode::ReadStatus as u8 => SimCommand::ReadStatus,
            op if op == Opcode::ReadFlagStatus as u8 => SimCommand::ReadFlagStatus,
            op if op == Opcode::WriteEnable as u8 => SimCommand::WriteEnable,
            op if op == Opcode::PageProg as u8 => SimCommand::PageProgram {
                address: Self::address(bytes),
                len: data_len,
            },
            op if op == Opcode::SectorErase as u8 => SimCommand::SectorErase {
                address: Self::address(bytes),
            },
            op if op == Opcode::SubsectorErase as u8 => SimCommand::SubsectorErase {
                address: Self::address(bytes),
            },
            op if op == Opcode::BulkErase as u8 => SimCommand::BulkErase,
            op if op == Opcode::Read as u8 => SimCommand::Read {
                address: Self::address(bytes),
                len: data_len,
            },
            op => SimCommand::Unknown(op),
        }
    }

    fn erase(&mut self, address: u32, len: usize) {
        let start = address as usize % self.memory.len() / len * len;
        for byte in &mut self.memory[start..start + len] {
            *byte = 0xFF;
        }
    }

    fn start_write(&mut self) {
        self.write_enabled = false;
        self.busy_left = self.busy_polls;
    }

    /// Executes one chip-select-framed command, replacing `bytes` with what
    /// the chip sends back.
    fn execute(&mut self, bytes: &mut [u8]) {
        if bytes.is_empty() {
            return;
        }
        let command = Self::parse(bytes);
        self.commands.push(command);

        let request = bytes.to_vec();
        for byte in bytes.iter_mut() {
            *byte = 0;
        }

        if self.is_busy() && !command.is_poll() {
            self.violations.push(Violation::WhileBusy(command));
            return;
        }

        let response = &mut bytes[1..];
        match command {
            SimCommand::ReadJedecId => {
                for (dst, src) in response.iter_mut().zip(self.id.iter()) {
                    *dst = *src;
                }
            }
            SimCommand::ReadStatus => {
                let status = self.status();
                response.iter_mut().for_each(|b| *b = status);
                self.poll();
            }
            SimCommand::ReadFlagStatus => {
                let flags = self.flag_status();
                response.iter_mut().for_each(|b| *b = flags);
                self.poll();
            }
            SimCommand::WriteEnable => self.write_enabled = true,
            SimCommand::Read { address, .. } => {
                let size = self.memory.len();
                let data = bytes.get_mut(1 + ADDRESS_LEN..).unwrap_or_default();
                for (i, dst) in data.iter_mut().enumerate() {
                    *dst = self.memory[(address as usize + i) % size];
                }
            }
            SimCommand::PageProgram { .. }
            | SimCommand::SectorErase { .. }
            | SimCommand::SubsectorErase { .. }
            | SimCommand::BulkErase
                if !self.write_enabled =>
            {
                self.violations.push(Violation::WriteNotEnabled(command));
            }
            SimCommand::PageProgram { address, .. } => {
                let size = self.memory.len();
                let page = address as usize % size / 256 * 256;
                let offset = address as usize % 256;
                let data = request.get(1 + ADDRESS_LEN..).unwrap_or(&[]);
                for (i, byte) in data.iter().enumerate() {
                    // Programming can only clear bits, and wraps within the page.
                    self.memory[page + (offset + i) % 256] &= *byte;
                }
                self.start_write();
            }
            SimCommand::SectorErase { address } => {
                let len = self.sector_len;
                self.erase(address, len);
                self.start_write();
            }
            SimCommand::SubsectorErase { address } => match self.subsector_len {
                Some(len) => {
                    self.erase(address, len);
                    self.start_write();
                }
                None => self.write_enabled = false,
            },
            SimCommand::BulkErase => {
                for byte in &mut self.memory {
                    *byte = 0xFF;
                }
                self.start_write();
            }
            SimCommand::Unknown(_) => {}
        }
    }
}

/// Shared access to a [`SimChip`].
#[derive(Debug, Clone)]
pub struct SimHandle(Rc<RefCell<SimChip>>);

impl SimHandle {
    /// The bus half, to be handed to the driver.
    pub fn spi(&self) -> SimSpi {
        SimSpi(self.clone())
    }

    /// The chip select half, to be handed to the driver.
    pub fn cs(&self) -> SimCs {
        SimCs(self.clone())
    }

    /// Overwrites memory contents, bypassing the command interface.
    pub fn load(&self, address: usize, data: &[u8]) {
        self.0.borrow_mut().memory[address..address + data.len()].copy_from_slice(data);
    }

    /// A copy of the memory contents.
    pub fn memory(&self) -> Vec<u8> {
        self.0.borrow().memory.clone()
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<SimCommand> {
        self.0.borrow().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.0.borrow_mut().commands.clear();
    }

    /// Commands that were ignored because they broke the protocol.
    pub fn violations(&self) -> Vec<Violation> {
        self.0.borrow().violations.clone()
    }

    /// Sets how many busy polls each write or erase lasts.
    pub fn set_busy_polls(&self, polls: u32) {
        self.0.borrow_mut().busy_polls = polls;
    }

    /// Makes the chip report busy forever.
    pub fn set_stuck(&self, stuck: bool) {
        self.0.borrow_mut().stuck = stuck;
    }

    /// Lets `transfers` more transfers succeed, then fails all following ones.
    pub fn fail_after(&self, transfers: usize) {
        self.0.borrow_mut().fail_after = Some(transfers);
    }

    pub fn is_selected(&self) -> bool {
        self.0.borrow().selected
    }
}

/// SPI bus connected to a [`SimChip`].
#[derive(Debug)]
pub struct SimSpi(SimHandle);

impl Transfer<u8> for SimSpi {
    type Error = SimError;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], SimError> {
        let mut chip = (self.0).0.borrow_mut();
        if let Some(left) = chip.fail_after.as_mut() {
            if *left == 0 {
                return Err(SimError::Fault);
            }
            *left -= 1;
        }
        if !chip.selected {
            chip.violations.push(Violation::NotSelected);
            return Err(SimError::NotSelected);
        }
        chip.execute(words);
        Ok(words)
    }
}

/// Chip select line of a [`SimChip`]. Active low.
#[derive(Debug)]
pub struct SimCs(SimHandle);

impl OutputPin for SimCs {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        (self.0).0.borrow_mut().selected = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        (self.0).0.borrow_mut().selected = false;
        Ok(())
    }
}

/// Delay that only keeps track of the time that would have passed.
#[derive(Debug, Default)]
pub struct SimDelay {
    elapsed_ms: u64,
}

impl SimDelay {
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }
}

impl DelayMs<u32> for SimDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += u64::from(ms);
    }
}
