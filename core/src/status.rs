//! SCSI status byte values, as returned in the STATUS phase.

use num_derive::{FromPrimitive, ToPrimitive};

/// One-byte status code sent to the initiator during the STATUS phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum StatusCode {
    Good = 0x00,
    CheckCondition = 0x02,
    ConditionMet = 0x04,
    Busy = 0x08,
    Intermediate = 0x10,
    IntermediateConditionMet = 0x14,
    ReservationConflict = 0x18,
    CommandTerminated = 0x22,
    QueueFull = 0x28,
}

impl StatusCode {
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// Linked commands report `Intermediate` instead of `Good` for every command but the last.
    pub const fn for_linked(self, linked: bool) -> Self {
        match self {
            Self::Good if linked => Self::Intermediate,
            other => other,
        }
    }
}
