//! Status registers and the write-completion state.

use crate::frame::Opcode;
use bitflags::bitflags;

bitflags! {
    /// Status register bits.
    pub struct Status: u8 {
        /// Erase or write in progress.
        const BUSY = 1 << 0;
        /// Status of the **W**rite **E**nable **L**atch.
        const WEL = 1 << 1;
        /// The 3 protection region bits.
        const PROT = 0b00011100;
        /// **S**tatus **R**egister **W**rite **D**isable bit.
        const SRWD = 1 << 7;
    }
}

bitflags! {
    /// Flag status register bits (N25Q).
    pub struct FlagStatus: u8 {
        /// Program/erase controller ready. Note the inverted polarity
        /// compared to `Status::BUSY`.
        const READY = 1 << 7;
        const ERASE_SUSPEND = 1 << 6;
        const ERASE_ERROR = 1 << 5;
        const PROGRAM_ERROR = 1 << 4;
        const VPP_ERROR = 1 << 3;
        const PROGRAM_SUSPEND = 1 << 2;
        const PROTECTION_ERROR = 1 << 1;
        /// Set while in 4-byte address mode.
        const ADDRESSING = 1 << 0;
    }
}

/// How a family reports a write or erase in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyCheck {
    /// Status register bit 0 set means busy.
    Status,
    /// Flag status register bit 7 clear means busy.
    FlagStatus,
}

impl BusyCheck {
    /// Opcode reading the register this check looks at.
    pub fn opcode(self) -> Opcode {
        match self {
            BusyCheck::Status => Opcode::ReadStatus,
            BusyCheck::FlagStatus => Opcode::ReadFlagStatus,
        }
    }

    /// Interprets a raw register value.
    pub fn state(self, register: u8) -> WriteState {
        let busy = match self {
            BusyCheck::Status => Status::from_bits_truncate(register).contains(Status::BUSY),
            BusyCheck::FlagStatus => {
                !FlagStatus::from_bits_truncate(register).contains(FlagStatus::READY)
            }
        };
        if busy {
            WriteState::Busy
        } else {
            WriteState::Idle
        }
    }
}

/// What is known about the chip's write/erase controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Not polled since the session started or since the last write or erase
    /// command was issued.
    Unknown,
    Busy,
    Idle,
}
