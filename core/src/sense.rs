//! REQUEST SENSE data: sense keys, additional sense codes, and buffer assembly.

use num_derive::{FromPrimitive, ToPrimitive};

/// Sense key, the low nibble of sense byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0b,
}

/// Additional sense code (ASC), byte 12 of the extended sense buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Asc {
    NoAdditionalSenseInformation = 0x00,
    MediumNotPresent = 0x3a,
    InvalidCommandOperationCode = 0x20,
    LbaOutOfRange = 0x21,
    InvalidFieldInCdb = 0x24,
    LogicalUnitNotSupported = 0x25,
    WriteProtected = 0x27,
    NotReadyToReadyTransition = 0x28,
    PowerOnOrReset = 0x29,
    CommandPhaseError = 0x4a,
    DataPhaseError = 0x4b,
    InternalTargetFailure = 0x44,
}

/// Sense state owned by a logical unit, set by the last failing command and
/// cleared by `ResetStatus`/after a REQUEST SENSE read.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenseData {
    pub key: Option<SenseKey>,
    pub asc: Asc2,
    pub information: u32,
    pub valid: bool,
    pub filemark: bool,
    pub ili: bool,
    pub eom: bool,
}

/// `(Asc, Ascq)` pair kept together since almost every call site sets both at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asc2(pub Asc, pub u8);

impl Default for Asc2 {
    fn default() -> Self {
        Asc2(Asc::NoAdditionalSenseInformation, 0)
    }
}

impl SenseData {
    pub fn set(&mut self, key: SenseKey, asc: Asc, ascq: u8) {
        self.key = Some(key);
        self.asc = Asc2(asc, ascq);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Assemble the REQUEST SENSE response buffer.
    ///
    /// `extended` selects the SCSI-2, 18-byte format; when false the legacy
    /// SCSI-1 CCS 4-byte format is produced instead (see the crate's SCSI-1
    /// CCS REQUEST SENSE allocation-length default).
    pub fn to_bytes(&self, extended: bool) -> Vec<u8> {
        let key = self.key.unwrap_or(SenseKey::NoSense);

        if !extended {
            let mut buf = vec![0u8; 4];
            buf[0] = 0x70 | if self.valid { 0x80 } else { 0x00 };
            buf[0] |= key.to_byte() & 0x0f;
            return buf;
        }

        let mut buf = vec![0u8; 18];
        buf[0] = 0x70 | if self.valid { 0x80 } else { 0x00 };
        let info = self.information.to_be_bytes();
        buf[3..7].copy_from_slice(&info);
        buf[2] = key.to_byte() & 0x0f;
        if self.ili {
            buf[2] |= 0x20;
        }
        if self.eom {
            buf[2] |= 0x40;
        }
        if self.filemark {
            buf[2] |= 0x80;
        }
        buf[7] = 10;
        buf[12] = self.asc.0.to_byte();
        buf[13] = self.asc.1;
        buf
    }
}

impl SenseKey {
    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

impl Asc {
    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

/// The REQUEST SENSE response for a command addressed to a LUN that isn't
/// attached: status GOOD, sense reporting LOGICAL_UNIT_NOT_SUPPORTED.
pub fn missing_lun_sense() -> Vec<u8> {
    let mut sense = SenseData::default();
    sense.set(SenseKey::IllegalRequest, Asc::LogicalUnitNotSupported, 0);
    sense.to_bytes(true)
}
