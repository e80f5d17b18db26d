//! Device session for 25-series SPI NOR flash chips.

use crate::config::Config;
use crate::frame::{self, CommandFrame, Opcode, MAX_ADDRESS};
use crate::geometry::{self, Geometry, Identification};
use crate::status::{FlagStatus, Status, WriteState};
use crate::utils::{window, HexSlice};
use crate::{BlockDevice, Error, Read};
use alloc::vec;
use alloc::vec::Vec;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

/// Bytes requested by the read-ID command. Enough for the unique ID of every
/// supported chip; chips that send less just clock out 0xFF or 0x00.
const JEDEC_ID_LEN: usize = 20;

/// Driver for 25-series SPI NOR flash chips.
///
/// Owns the bus for its whole lifetime. The geometry of the chip is detected
/// once, when the session is created.
///
/// # Type Parameters
///
/// * **`SPI`**: The SPI master to which the flash chip is attached.
/// * **`CS`**: The **C**hip-**S**elect line attached to the `\CS`/`\CE` pin of
///   the flash chip.
/// * **`D`**: Delay source used between busy polls.
#[derive(Debug)]
pub struct Flash<SPI: Transfer<u8>, CS: OutputPin, D> {
    spi: SPI,
    cs: CS,
    delay: D,
    config: Config,
    id: Identification,
    geometry: Geometry,
    state: WriteState,
}

impl<SPI, CS, D> Flash<SPI, CS, D>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    D: DelayMs<u32>,
{
    /// Opens a session and detects the chip geometry.
    ///
    /// # Parameters
    ///
    /// * **`spi`**: An SPI master. Must be configured to operate in the correct
    ///   mode for the device.
    /// * **`cs`**: The **C**hip-**S**elect Pin connected to the `\CS`/`\CE` pin
    ///   of the flash chip. Will be driven low when accessing the device.
    /// * **`delay`**: Used to sleep between busy polls.
    /// * **`config`**: Session parameters.
    ///
    /// An unrecognized chip is not an error; see [`geometry::resolve`].
    pub fn init(spi: SPI, cs: CS, delay: D, config: Config) -> Result<Self, Error<SPI, CS>> {
        let mut this = Self {
            spi,
            cs,
            delay,
            config,
            id: Identification::default(),
            geometry: Geometry::default(),
            state: WriteState::Unknown,
        };

        let id = this.read_jedec_id()?;
        info!("Flash::init: id = {:?}", id);
        this.geometry = geometry::resolve(&id);
        this.id = id;
        Ok(this)
    }

    /// Ends the session and returns the bus resources.
    pub fn free(self) -> (SPI, CS, D) {
        (self.spi, self.cs, self.delay)
    }

    pub fn identification(&self) -> &Identification {
        &self.id
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The write state as of the last poll.
    pub fn state(&self) -> WriteState {
        self.state
    }

    fn command(&mut self, bytes: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        if self.config.trace_frames {
            trace!("send: {:?}", HexSlice(window(bytes, 0)));
        }

        // If the SPI transfer fails, make sure to disable CS anyways
        self.cs.set_low().map_err(Error::Gpio)?;
        let spi_result = self.spi.transfer(bytes).map(|_| ()).map_err(Error::Spi);
        let cs_result = self.cs.set_high().map_err(Error::Gpio);
        spi_result?;
        cs_result?;

        if self.config.trace_frames {
            trace!("  -> {:?}", HexSlice(window(bytes, 0)));
        }
        Ok(())
    }

    /// Sends `frame` and returns the raw response, header bytes included.
    fn transact(&mut self, frame: &CommandFrame<'_>) -> Result<Vec<u8>, Error<SPI, CS>> {
        let mut bytes = frame.encode();
        self.command(&mut bytes)?;
        Ok(bytes)
    }

    fn read_register(&mut self, opcode: Opcode) -> Result<u8, Error<SPI, CS>> {
        let frame = CommandFrame::new(opcode).response(1);
        let raw = self.transact(&frame)?;
        Ok(frame::decode(&raw, frame.header_len())[0])
    }

    /// Reads the JEDEC manufacturer/device identification.
    pub fn read_jedec_id(&mut self) -> Result<Identification, Error<SPI, CS>> {
        let frame = CommandFrame::new(Opcode::ReadJedecId).response(JEDEC_ID_LEN);
        let raw = self.transact(&frame)?;
        Ok(Identification::from_jedec_id(frame::decode(
            &raw,
            frame.header_len(),
        )))
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> Result<Status, Error<SPI, CS>> {
        let raw = self.read_register(Opcode::ReadStatus)?;
        Ok(Status::from_bits_truncate(raw))
    }

    /// Reads the flag status register.
    ///
    /// Returns `None` without touching the bus if the chip has no such
    /// register.
    pub fn read_flag_status(&mut self) -> Result<Option<FlagStatus>, Error<SPI, CS>> {
        if !self.geometry.has_flag_status() {
            return Ok(None);
        }
        let raw = self.read_register(Opcode::ReadFlagStatus)?;
        Ok(Some(FlagStatus::from_bits_truncate(raw)))
    }

    /// Polls the busy indication of the chip family once.
    pub fn check_busy(&mut self) -> Result<WriteState, Error<SPI, CS>> {
        let check = self.geometry.busy_check();
        let raw = self.read_register(check.opcode())?;
        self.state = check.state(raw);
        Ok(self.state)
    }

    /// Polls until the chip reports that no write or erase is in progress.
    ///
    /// Always polls at least once. Gives up with [`Error::Unresponsive`]
    /// after the configured number of busy polls.
    pub fn wait_idle(&mut self) -> Result<(), Error<SPI, CS>> {
        let mut polls: u32 = 0;
        while self.check_busy()? == WriteState::Busy {
            polls = polls.saturating_add(1);
            if let Some(max) = self.config.max_polls {
                if polls >= max {
                    return Err(Error::Unresponsive { polls });
                }
            }
            self.delay.delay_ms(self.config.poll_interval_ms);
        }
        if polls > 0 {
            debug!(
                "wait_idle: chip busy for {} polls ({} ms interval)",
                polls, self.config.poll_interval_ms
            );
        }
        Ok(())
    }

    /// Waits for a pending write to finish unless the last poll saw the chip
    /// idle and nothing was written since.
    fn ensure_idle(&mut self) -> Result<(), Error<SPI, CS>> {
        if self.state != WriteState::Idle {
            self.wait_idle()?;
        }
        Ok(())
    }

    fn write_enable(&mut self) -> Result<(), Error<SPI, CS>> {
        let mut cmd_buf = [Opcode::WriteEnable as u8];
        self.command(&mut cmd_buf)?;
        Ok(())
    }

    /// Issues a write or erase command.
    ///
    /// Write enable is ignored by busy chips, so the chip is polled until idle
    /// first, and write enable is sent right before the command itself.
    fn write_command(&mut self, frame: &CommandFrame<'_>) -> Result<(), Error<SPI, CS>> {
        self.wait_idle()?;
        self.write_enable()?;
        self.transact(frame)?;
        self.state = WriteState::Unknown;
        Ok(())
    }

    /// Erases the sector containing `addr`.
    pub fn sector_erase(&mut self, addr: u32) -> Result<(), Error<SPI, CS>> {
        debug!("sector erase at 0x{:06x}", addr);
        let frame = CommandFrame::new(Opcode::SectorErase).address(addr)?;
        self.write_command(&frame)
    }

    /// Erases the subsector containing `addr`.
    pub fn subsector_erase(&mut self, addr: u32) -> Result<(), Error<SPI, CS>> {
        if self.geometry.subsector_len().is_none() {
            return Err(Error::Unsupported(Opcode::SubsectorErase));
        }
        debug!("subsector erase at 0x{:06x}", addr);
        let frame = CommandFrame::new(Opcode::SubsectorErase).address(addr)?;
        self.write_command(&frame)
    }

    /// Erases the whole chip.
    ///
    /// Warning: this can take a significant amount of time, make sure the
    /// configured poll bound allows for it.
    pub fn bulk_erase(&mut self) -> Result<(), Error<SPI, CS>> {
        debug!("bulk erase");
        self.write_command(&CommandFrame::new(Opcode::BulkErase))
    }

    /// Programs `data` into the page containing `addr`.
    ///
    /// The target must have been erased. `data` must not extend past the end
    /// of the page; the chip would wrap around to the start of the page.
    pub fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<SPI, CS>> {
        let page_len = self.geometry.page_len() as usize;
        let offset = addr as usize % page_len;
        if offset + data.len() > page_len {
            return Err(Error::InvalidLength {
                address: addr,
                length: data.len(),
            });
        }
        let frame = CommandFrame::new(Opcode::PageProg)
            .address(addr)?
            .payload(data);
        self.write_command(&frame)
    }

    /// Rejects ranges that do not fit into `limit` bytes from address 0.
    fn check_range(&self, addr: u32, len: usize, limit: u32) -> Result<(), Error<SPI, CS>> {
        if addr > MAX_ADDRESS {
            return Err(Error::InvalidAddress(addr));
        }
        if u64::from(addr) + len as u64 > u64::from(limit) {
            return Err(Error::InvalidLength {
                address: addr,
                length: len,
            });
        }
        Ok(())
    }

    /// Checks a range that is about to be erased or written.
    pub(crate) fn check_write_range(&self, addr: u32, len: usize) -> Result<(), Error<SPI, CS>> {
        self.check_range(addr, len, self.geometry.addressable_bytes())
    }

    /// Reads `len` bytes starting at `addr`.
    pub fn read_to_vec(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error<SPI, CS>> {
        self.check_range(addr, len, MAX_ADDRESS + 1)?;
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }
}

impl<SPI, CS, D> Read<u32, SPI, CS> for Flash<SPI, CS, D>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    D: DelayMs<u32>,
{
    /// Reads flash contents into `buf`, starting at `addr`.
    ///
    /// Large reads are split into several read commands of at most the
    /// configured chunk size.
    ///
    /// Note that flash chips typically only look at the lowest `N` bits needed
    /// to encode their size, so the contents are "mirrored" to addresses that
    /// are a multiple of the flash size. The range must fit into the 24-bit
    /// address space.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<SPI, CS>> {
        self.check_range(addr, buf.len(), MAX_ADDRESS + 1)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.ensure_idle()?;

        let chunk_len = self.config.read_chunk;
        debug!("read: addr = 0x{:06x}, len = {}", addr, buf.len());
        for (c, chunk) in buf.chunks_mut(chunk_len).enumerate() {
            let current_addr = addr + (c * chunk_len) as u32;
            let frame = CommandFrame::new(Opcode::Read)
                .address(current_addr)?
                .response(chunk.len());
            let raw = self.transact(&frame)?;
            chunk.copy_from_slice(frame::decode(&raw, frame.header_len()));
        }
        Ok(())
    }
}

impl<SPI, CS, D> BlockDevice<u32, SPI, CS> for Flash<SPI, CS, D>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    D: DelayMs<u32>,
{
    fn erase_sectors(&mut self, addr: u32, amount: usize) -> Result<(), Error<SPI, CS>> {
        let sector_len = self.geometry.sector_len();
        let start = addr - addr % sector_len;
        let len = amount
            .checked_mul(sector_len as usize)
            .ok_or(Error::InvalidLength {
                address: start,
                length: usize::MAX,
            })?;
        self.check_write_range(start, len)?;

        for c in 0..amount {
            self.sector_erase(start + c as u32 * sector_len)?;
        }
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), Error<SPI, CS>> {
        self.bulk_erase()?;
        self.wait_idle()
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<SPI, CS>> {
        self.check_write_range(addr, data.len())?;

        let page_len = self.geometry.page_len() as usize;
        let mut current_addr = addr;
        let mut rest = data;
        while !rest.is_empty() {
            // The first chunk only runs up to the next page boundary.
            let room = page_len - current_addr as usize % page_len;
            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            self.page_program(current_addr, chunk)?;
            current_addr += chunk.len() as u32;
            rest = tail;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Family;
    use crate::sim::{SimChip, SimCommand, SimDelay, SimError, SimHandle};

    type SimFlash = Flash<crate::sim::SimSpi, crate::sim::SimCs, SimDelay>;

    fn open(chip: &SimHandle, config: Config) -> SimFlash {
        Flash::init(chip.spi(), chip.cs(), SimDelay::default(), config).unwrap()
    }

    #[test]
    fn init_detects_geometry() {
        let chip = SimChip::n25q032();
        let flash = open(&chip, Config::default());
        assert_eq!(flash.geometry().family(), Family::N25Q);
        assert_eq!(flash.identification().manufacturer_id(), 0x20);
        assert_eq!(flash.state(), WriteState::Unknown);
        assert_eq!(chip.commands(), [SimCommand::ReadJedecId]);
    }

    #[test]
    fn init_accepts_unknown_chips() {
        let chip = SimChip::new([0xEF, 0x40, 0x15], 2 * 1024 * 1024);
        let flash = open(&chip, Config::default());
        assert_eq!(flash.geometry().family(), Family::Unknown);
        assert_eq!(flash.geometry().sector_len(), 64 * 1024);
    }

    #[test]
    fn flag_family_polls_flag_register() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        chip.set_busy_polls(3);
        chip.clear_commands();
        flash.bulk_erase().unwrap();
        flash.wait_idle().unwrap();

        let polls = chip
            .commands()
            .iter()
            .filter(|c| **c == SimCommand::ReadFlagStatus)
            .count();
        // One poll before the erase, three busy ones and the final idle one.
        assert_eq!(polls, 5);
        assert!(!chip.commands().contains(&SimCommand::ReadStatus));
        assert_eq!(flash.state(), WriteState::Idle);
        assert!(chip.violations().is_empty());
    }

    #[test]
    fn status_family_polls_status_register() {
        let chip = SimChip::m25p10();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        flash.sector_erase(0).unwrap();
        flash.wait_idle().unwrap();
        assert!(chip.commands().contains(&SimCommand::ReadStatus));
        assert!(!chip.commands().contains(&SimCommand::ReadFlagStatus));
        assert_eq!(flash.read_flag_status().unwrap(), None);
    }

    #[test]
    fn wait_idle_sleeps_between_polls() {
        let chip = SimChip::m25p10();
        let mut flash = open(&chip, Config::default().poll_interval_ms(5));
        chip.set_busy_polls(4);
        flash.sector_erase(0).unwrap();
        flash.wait_idle().unwrap();
        let (_, _, delay) = flash.free();
        assert_eq!(delay.elapsed_ms(), 4 * 5);
    }

    #[test]
    fn unresponsive_chip_times_out() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default().max_polls(Some(10)));
        chip.set_stuck(true);
        match flash.wait_idle() {
            Err(Error::Unresponsive { polls }) => assert_eq!(polls, 10),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(flash.state(), WriteState::Busy);
    }

    #[test]
    fn write_enable_precedes_every_write() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        flash.sector_erase(0x1_0000).unwrap();
        flash.page_program(0x1_0000, &[1, 2, 3]).unwrap();

        let writes: Vec<_> = chip
            .commands()
            .into_iter()
            .filter(|c| !c.is_poll())
            .collect();
        assert_eq!(
            writes,
            [
                SimCommand::WriteEnable,
                SimCommand::SectorErase { address: 0x1_0000 },
                SimCommand::WriteEnable,
                SimCommand::PageProgram {
                    address: 0x1_0000,
                    len: 3
                },
            ]
        );
        assert!(chip.violations().is_empty());
    }

    #[test]
    fn page_program_rejects_page_crossing() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        match flash.page_program(0xF0, &[0; 32]) {
            Err(Error::InvalidLength { address, length }) => {
                assert_eq!((address, length), (0xF0, 32))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(chip.commands().is_empty());
    }

    #[test]
    fn subsector_erase_needs_support() {
        let chip = SimChip::m25p10();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        match flash.subsector_erase(0) {
            Err(Error::Unsupported(Opcode::SubsectorErase)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(chip.commands().is_empty());
    }

    #[test]
    fn chunked_read_returns_exact_length() {
        let contents: Vec<u8> = (0..6000u32).map(|i| (i * 7) as u8).collect();
        let chip = SimChip::n25q032();
        chip.load(0, &contents);
        let mut flash = open(&chip, Config::default());

        for &len in &[0, 1, 2047, 2048, 2049, 5000] {
            let data = flash.read_to_vec(100, len).unwrap();
            assert_eq!(data.len(), len);
            assert_eq!(data[..], contents[100..100 + len]);
        }
    }

    #[test]
    fn chunked_read_issues_ascending_commands() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default().read_chunk(1000));
        flash.wait_idle().unwrap();
        chip.clear_commands();

        let mut buf = [0; 2500];
        flash.read(0x200, &mut buf).unwrap();
        assert_eq!(
            chip.commands(),
            [
                SimCommand::Read {
                    address: 0x200,
                    len: 1000
                },
                SimCommand::Read {
                    address: 0x200 + 1000,
                    len: 1000
                },
                SimCommand::Read {
                    address: 0x200 + 2000,
                    len: 500
                },
            ]
        );
    }

    #[test]
    fn invalid_ranges_are_rejected_before_bus_activity() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();

        match flash.read_to_vec(0x0100_0000, 1) {
            Err(Error::InvalidAddress(0x0100_0000)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match flash.read_to_vec(MAX_ADDRESS, 2) {
            Err(Error::InvalidLength { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match flash.sector_erase(0x0100_0000) {
            Err(Error::InvalidAddress(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        // Beyond the 4 MiB of the chip.
        match flash.write_bytes(4 * 1024 * 1024 - 1, &[0, 0]) {
            Err(Error::InvalidLength { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(chip.commands().is_empty());
    }

    #[test]
    fn huge_sector_count_is_rejected() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();

        match flash.erase_sectors(0, usize::MAX / 2) {
            Err(Error::InvalidLength {
                address: 0,
                length: usize::MAX,
            }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        match flash.erase_sectors(0, 65) {
            Err(Error::InvalidLength { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(chip.commands().is_empty());
    }

    #[test]
    fn transport_failure_is_propagated() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        chip.fail_after(2);
        match flash.write_bytes(0, &[0xAA; 600]) {
            Err(Error::Spi(SimError::Fault)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        // The chip select was released despite the failure.
        assert!(!chip.is_selected());
    }

    #[test]
    fn write_bytes_splits_on_page_boundaries() {
        let chip = SimChip::n25q032();
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        flash.write_bytes(0x1F0, &[0x55; 0x120]).unwrap();

        let programs: Vec<_> = chip
            .commands()
            .into_iter()
            .filter(|c| matches!(c, SimCommand::PageProgram { .. }))
            .collect();
        assert_eq!(
            programs,
            [
                SimCommand::PageProgram {
                    address: 0x1F0,
                    len: 0x10
                },
                SimCommand::PageProgram {
                    address: 0x200,
                    len: 0x100
                },
                SimCommand::PageProgram {
                    address: 0x300,
                    len: 0x10
                },
            ]
        );
        assert_eq!(flash.read_to_vec(0x1F0, 0x120).unwrap(), [0x55; 0x120]);
    }

    #[test]
    fn erase_sectors_aligns_start() {
        let chip = SimChip::m25p10();
        chip.load(0, &vec![0u8; 0x20000]);
        let mut flash = open(&chip, Config::default());
        chip.clear_commands();
        flash.erase_sectors(0x8123, 1).unwrap();
        flash.wait_idle().unwrap();

        assert!(chip
            .commands()
            .contains(&SimCommand::SectorErase { address: 0x8000 }));
        let data = flash.read_to_vec(0x7FFF, 0x8002).unwrap();
        assert_eq!(data[0], 0x00);
        assert!(data[1..0x8001].iter().all(|&b| b == 0xFF));
        assert_eq!(data[0x8001], 0x00);
    }
}
