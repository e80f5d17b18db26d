use crate::frame::{AddressOutOfRange, Opcode};
use core::fmt::{self, Debug, Display};
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

mod private {
    #[derive(Debug)]
    pub enum Private {}
}

/// The error type used by this library.
///
/// This can encapsulate an SPI or GPIO error, and adds its own protocol errors
/// on top of that.
pub enum Error<SPI: Transfer<u8>, CS: OutputPin> {
    /// An SPI transfer failed.
    ///
    /// Any erase or program sequence in progress is abandoned, which can leave
    /// the chip partially erased or programmed.
    Spi(SPI::Error),

    /// A GPIO could not be set.
    Gpio(CS::Error),

    /// The address does not fit into the 24-bit address field.
    InvalidAddress(u32),

    /// The requested range leaves the addressable area of the chip, or a page
    /// program would cross a page boundary.
    InvalidLength {
        /// First byte of the range.
        address: u32,
        /// Length of the range in bytes.
        length: usize,
    },

    /// The detected chip family does not support this command.
    Unsupported(Opcode),

    /// The chip still reported a write in progress after the maximum number
    /// of polls.
    Unresponsive {
        /// Number of polls that saw the chip busy.
        polls: u32,
    },

    #[doc(hidden)]
    __NonExhaustive(private::Private),
}

impl<SPI: Transfer<u8>, CS: OutputPin> From<AddressOutOfRange> for Error<SPI, CS> {
    fn from(err: AddressOutOfRange) -> Self {
        Error::InvalidAddress(err.0)
    }
}

impl<SPI: Transfer<u8>, CS: OutputPin> Debug for Error<SPI, CS>
where
    SPI::Error: Debug,
    CS::Error: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spi(spi) => write!(f, "Error::Spi({:?})", spi),
            Error::Gpio(gpio) => write!(f, "Error::Gpio({:?})", gpio),
            Error::InvalidAddress(addr) => write!(f, "Error::InvalidAddress(0x{:x})", addr),
            Error::InvalidLength { address, length } => write!(
                f,
                "Error::InvalidLength {{ address: 0x{:x}, length: {} }}",
                address, length
            ),
            Error::Unsupported(opcode) => write!(f, "Error::Unsupported({:?})", opcode),
            Error::Unresponsive { polls } => {
                write!(f, "Error::Unresponsive {{ polls: {} }}", polls)
            }
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}

impl<SPI: Transfer<u8>, CS: OutputPin> Display for Error<SPI, CS>
where
    SPI::Error: Display,
    CS::Error: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spi(spi) => write!(f, "SPI error: {}", spi),
            Error::Gpio(gpio) => write!(f, "GPIO error: {}", gpio),
            Error::InvalidAddress(addr) => {
                write!(f, "address 0x{:x} does not fit into 24 bits", addr)
            }
            Error::InvalidLength { address, length } => write!(
                f,
                "{} bytes at address 0x{:06x} exceed the addressable range",
                length, address
            ),
            Error::Unsupported(opcode) => write!(
                f,
                "command {:?} (0x{:02x}) is not supported by this chip",
                opcode, *opcode as u8
            ),
            Error::Unresponsive { polls } => write!(
                f,
                "device unresponsive: still busy after {} status polls",
                polls
            ),
            Error::__NonExhaustive(_) => unreachable!(),
        }
    }
}
