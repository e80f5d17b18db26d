//! An [`embedded-hal`]-based programmer for SPI NOR flash chips.
//!
//! This crate identifies a 25-series flash chip, derives its erase geometry
//! and busy signalling from the identification, and sequences erase, program,
//! read and verify operations in the order the chips require:
//!
//! * every write or erase command is preceded by polling the chip until it is
//!   idle, then by a write enable,
//! * the region to be programmed is erased before the first page program,
//! * large reads are split into chunks the bus can move in one transfer.
//!
//! Supported families are Micron M25P and N25Q and ISSI IS25L. Other chips are
//! driven with conservative defaults.
//!
//! The bus is any [`Transfer<u8>`] implementation, the chip select any
//! [`OutputPin`]. The [`sim`] module provides an in-memory chip implementing
//! both, for testing without hardware.
//!
//! [`embedded-hal`]: https://docs.rs/embedded-hal/
//! [`Transfer<u8>`]: embedded_hal::blocking::spi::Transfer
//! [`OutputPin`]: embedded_hal::digital::v2::OutputPin

#![doc(html_root_url = "https://docs.rs/flashcomm/0.1.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod log;
mod config;
mod error;
pub mod flash;
pub mod frame;
pub mod geometry;
pub mod pipeline;
pub mod prelude;
pub mod sim;
pub mod status;
mod utils;

pub use crate::config::{Config, EraseStrategy};
pub use crate::error::Error;
pub use crate::flash::Flash;
pub use crate::pipeline::{Mismatch, VerifyResult};
pub use crate::utils::HexSlice;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// A trait for reading operations from a memory chip.
pub trait Read<Addr, SPI: Transfer<u8>, CS: OutputPin> {
    /// Reads bytes from a memory chip.
    ///
    /// # Parameters
    /// * `addr`: The address to start reading at.
    /// * `buf`: The buffer to read `buf.len()` bytes into.
    fn read(&mut self, addr: Addr, buf: &mut [u8]) -> Result<(), Error<SPI, CS>>;
}

/// A trait for writing and erasing operations on a memory chip.
pub trait BlockDevice<Addr, SPI: Transfer<u8>, CS: OutputPin> {
    /// Erases sectors from the memory chip.
    ///
    /// # Parameters
    /// * `addr`: The address to start erasing at. If the address is not on a sector boundary,
    ///   the lower bits are ignored in order to make it fit.
    /// * `amount`: The number of sectors to erase.
    fn erase_sectors(&mut self, addr: Addr, amount: usize) -> Result<(), Error<SPI, CS>>;

    /// Erases the memory chip fully.
    ///
    /// Warning: Full erase operations can take a significant amount of time.
    /// Check your device's datasheet for precise numbers.
    fn erase_all(&mut self) -> Result<(), Error<SPI, CS>>;

    /// Writes bytes onto the memory chip. This method is supposed to assume that the sectors
    /// it is writing to have already been erased and should not do any erasing themselves.
    ///
    /// # Parameters
    /// * `addr`: The address to write to.
    /// * `data`: The bytes to write to `addr`.
    fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<(), Error<SPI, CS>>;
}
