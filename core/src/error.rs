//! The sense-exception replacement described in the crate's redesign notes:
//! device dispatch returns `Result<(), ScsiError>` instead of throwing, and
//! the controller's `Execute` step maps `Err` into sense data and a status.

use crate::sense::Asc;
use crate::sense::SenseKey;
use crate::status::StatusCode;

/// A command-level failure, raised by a [`crate::device::LogicalUnit`] dispatch
/// handler and caught by the controller at the `Execute` boundary.
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum ScsiError {
    /// A protocol or state error, recoverable by sense: the controller records
    /// `key`/`asc`/`ascq` on the addressed LUN and proceeds to STATUS with
    /// `status` (almost always `CheckCondition`).
    #[error("{key:?}/{asc:?} (ascq {ascq:#04x})")]
    Sense {
        key: SenseKey,
        asc: Asc,
        ascq: u8,
        status: StatusCode,
    },
}

impl ScsiError {
    pub const fn sense(key: SenseKey, asc: Asc) -> Self {
        Self::Sense {
            key,
            asc,
            ascq: 0,
            status: StatusCode::CheckCondition,
        }
    }

    pub const fn sense_ascq(key: SenseKey, asc: Asc, ascq: u8) -> Self {
        Self::Sense {
            key,
            asc,
            ascq,
            status: StatusCode::CheckCondition,
        }
    }

    /// A reservation conflict is signaled as a status byte with no sense data.
    pub const fn reservation_conflict() -> Self {
        Self::Sense {
            key: SenseKey::NoSense,
            asc: Asc::NoAdditionalSenseInformation,
            ascq: 0,
            status: StatusCode::ReservationConflict,
        }
    }
}
