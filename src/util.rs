use log::{error, info, warn};

use structopt::StructOpt;

pub use linux_embedded_hal::sysfs_gpio::{self, Direction};
pub use linux_embedded_hal::{spidev, spidev::SpiModeFlags, Delay, Pin as Pindev, Spidev};

use simplelog::{LevelFilter, TermLogger, TerminalMode};

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::{fs, process, thread, time::Duration};

use flashcomm::{Config, EraseStrategy, Flash};

type Error = Box<dyn std::error::Error>;
type Result<T> = std::result::Result<T, Error>;

/// Program and read data from SPI flash chips.
///
/// Operations are run in the order getid, getstatus, getflags, program,
/// verify, save. A failed verification does not stop the following
/// operations, but makes the exit status non-zero.
#[derive(Debug, StructOpt)]
#[structopt(name = "flashcomm-util")]
struct Options {
    /// SPI device
    #[structopt(long, default_value = "/dev/spidev0.0", env = "SPI_DEV")]
    spi_dev: String,

    /// SPI clock rate in Hz
    #[structopt(long, default_value = "100000", env = "SPI_BAUD")]
    spi_baud: u32,

    /// Chip Select (output) pin
    #[structopt(long, default_value = "8", env = "CS_PIN")]
    cs_pin: u64,

    /// GPIO pin driven high before the chip is accessed
    #[structopt(long, env = "SET_HIGH_PIN")]
    set_high: Option<u64>,

    /// GPIO pin driven low before the chip is accessed
    #[structopt(long, env = "SET_LOW_PIN")]
    set_low: Option<u64>,

    /// Configure log level
    #[structopt(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,

    /// Log individual erase/program steps and busy waits
    #[structopt(long)]
    verbose: bool,

    /// Log every SPI frame
    #[structopt(long)]
    debug: bool,

    /// Delay between busy polls in milliseconds
    #[structopt(long, default_value = "2")]
    poll_ms: u32,

    /// Busy polls before giving up on the chip (0 waits forever)
    #[structopt(long, default_value = "150000")]
    max_polls: u32,

    /// Largest number of bytes read by a single command
    #[structopt(long, default_value = "2048", parse(try_from_str = parse_chunk))]
    read_chunk: usize,

    /// Erase strategy used before programming: sectors, subsectors or bulk
    #[structopt(long, default_value = "sectors", parse(try_from_str = parse_erase))]
    erase: EraseStrategy,

    /// Print the identification of the chip
    #[structopt(long)]
    getid: bool,

    /// Print the status register
    #[structopt(long)]
    getstatus: bool,

    /// Print the flag status register
    #[structopt(long)]
    getflags: bool,

    /// Program the chip with the contents of a binary file, then verify it
    #[structopt(long, parse(from_os_str))]
    program: Option<PathBuf>,

    /// Skip the verification after programming
    #[structopt(long)]
    no_verify: bool,

    /// Compare the chip contents with a binary file
    #[structopt(long, parse(from_os_str))]
    verify: Option<PathBuf>,

    /// Save the whole chip contents to a binary file
    #[structopt(long, parse(from_os_str))]
    save: Option<PathBuf>,
}

fn parse_erase(s: &str) -> std::result::Result<EraseStrategy, String> {
    match s {
        "sectors" => Ok(EraseStrategy::Sectors),
        "subsectors" => Ok(EraseStrategy::Subsectors),
        "bulk" => Ok(EraseStrategy::Bulk),
        _ => Err(format!(
            "unknown erase strategy '{}' (expected sectors, subsectors or bulk)",
            s
        )),
    }
}

fn parse_chunk(s: &str) -> std::result::Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("read chunk size must be at least 1".into()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Exported GPIOs, unexported again when dropped.
struct ExportedPins(Vec<u64>);

impl ExportedPins {
    fn export(&mut self, pin: u64, direction: Direction) -> Result<()> {
        let gpio = sysfs_gpio::Pin::new(pin);
        gpio.export()?;
        self.0.push(pin);
        gpio.set_direction(direction)?;
        Ok(())
    }
}

impl Drop for ExportedPins {
    fn drop(&mut self) {
        for &pin in &self.0 {
            if let Err(e) = sysfs_gpio::Pin::new(pin).unexport() {
                warn!("failed to unexport GPIO {}: {}", pin, e);
            }
        }
    }
}

fn main() {
    // Load options
    let opts = Options::from_args();

    // Setup logging
    let level = if opts.debug {
        LevelFilter::Trace
    } else if opts.verbose {
        opts.log_level.max(LevelFilter::Debug)
    } else {
        opts.log_level
    };
    if let Err(e) = TermLogger::init(level, simplelog::Config::default(), TerminalMode::Mixed) {
        eprintln!("Error: failed to set up logging: {}", e);
        process::exit(1);
    }

    match run(&opts) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

/// Runs the requested operations. Returns whether all verifications passed.
fn run(opts: &Options) -> Result<bool> {
    let mut pins = ExportedPins(Vec::new());

    // Auxiliary signals, eg. to hold a host processor in reset
    if let Some(pin) = opts.set_high {
        info!("Driving GPIO {} high", pin);
        pins.export(pin, Direction::High)?;
        thread::sleep(Duration::from_millis(100));
    }
    if let Some(pin) = opts.set_low {
        info!("Driving GPIO {} low", pin);
        pins.export(pin, Direction::Low)?;
        thread::sleep(Duration::from_millis(100));
    }

    // Connect and configure the chip select pin, deasserted
    pins.export(opts.cs_pin, Direction::High)?;
    let cs_pin = Pindev::new(opts.cs_pin);

    // Connect and configure SPI device
    let mut spi = Spidev::open(&opts.spi_dev)?;
    let mut spi_config = spidev::SpidevOptions::new();
    spi_config.mode(SpiModeFlags::SPI_MODE_0 | SpiModeFlags::SPI_NO_CS);
    spi_config.max_speed_hz(opts.spi_baud);
    spi.configure(&spi_config)?;

    let config = Config::default()
        .poll_interval_ms(opts.poll_ms)
        .max_polls(if opts.max_polls == 0 {
            None
        } else {
            Some(opts.max_polls)
        })
        .read_chunk(opts.read_chunk)
        .erase(opts.erase)
        .trace_frames(opts.debug);

    // Instantiate SPI flash
    let mut flash = Flash::init(spi, cs_pin, Delay, config).dbg_err("flash init")?;

    // Check that something answered
    let id = flash.identification().clone();
    if id.is_blank() {
        return Err(format!("no flash chip detected (ID {:?})", id).into());
    }

    if opts.getid {
        println!("{:15}: {}", "ManufacturerID", hex::encode([id.manufacturer_id()]));
        println!("{:15}: {}", "MemoryType", hex::encode([id.memory_type()]));
        println!("{:15}: {}", "MemoryCapacity", hex::encode([id.capacity_code()]));
        println!("{:15}: {}", "UniqueID", hex::encode(id.unique_id()));
        let geometry = flash.geometry();
        println!(
            "{:15}: {}, {} bytes, {} byte sectors",
            "Geometry",
            geometry.family(),
            geometry.capacity_bytes(),
            geometry.sector_len()
        );
    }

    if opts.getstatus {
        let status = flash.read_status().dbg_err("read status register")?;
        println!("Status Register: {} ({:?})", hex::encode([status.bits()]), status);
    }

    if opts.getflags {
        match flash.read_flag_status().dbg_err("read flag status register")? {
            Some(flags) => println!(
                "Flag status Register: {} ({:?})",
                hex::encode([flags.bits()]),
                flags
            ),
            None => println!(
                "Flag status Register: not available on {} chips",
                flash.geometry().family()
            ),
        }
    }

    let mut verified = true;

    if let Some(file) = &opts.program {
        info!("Programming flash with data from {}", file.display());
        let data = fs::read(file)?;
        flash.program(&data).dbg_err("program")?;
        info!("Program complete");

        if !opts.no_verify {
            verified &= verify(&mut flash, file, &data)?;
        }
    }

    if let Some(file) = &opts.verify {
        let data = fs::read(file)?;
        verified &= verify(&mut flash, file, &data)?;
    }

    if let Some(file) = &opts.save {
        info!("Saving flash contents to {}", file.display());
        let image = flash.dump().dbg_err("read flash")?;
        fs::write(file, image)?;
        info!("Save complete");
    }

    Ok(verified)
}

fn verify(flash: &mut Flash<Spidev, Pindev, Delay>, file: &Path, data: &[u8]) -> Result<bool> {
    info!("Checking file: {}", file.display());
    let result = flash.verify(data).dbg_err("verify")?;
    match result.mismatch() {
        None => println!("Verify: PASS"),
        Some(mismatch) => println!("Verify: ERROR. {} bytes, {}", data.len(), mismatch),
    }
    Ok(result.matched())
}

trait ResultExt<T, E> {
    fn dbg_err(self, msg: &str) -> std::result::Result<T, Error>;
}

impl<T, E: Debug> ResultExt<T, E> for std::result::Result<T, E> {
    fn dbg_err(self, msg: &str) -> std::result::Result<T, Error> {
        self.map_err(|e| format!("{}: {:?}", msg, e).into())
    }
}
