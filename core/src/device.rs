//! The `LogicalUnit` capability set and the shared `PrimaryDevice` command
//! set every logical unit provides (TEST UNIT READY, INQUIRY, REQUEST SENSE,
//! REPORT LUNS, RESERVE/RELEASE(6), SEND DIAGNOSTIC).
//!
//! The original inheritance chain `Device -> PrimaryDevice -> concrete
//! device` is replaced by composition: [`DeviceBase`] holds the shared
//! identity/state fields, and concrete device types implement [`LogicalUnit`]
//! by embedding a `DeviceBase` and delegating the mandatory commands to its
//! default-provided methods.

use std::collections::HashMap;

use crate::error::ScsiError;
use crate::opcode;
use crate::sense::{Asc, SenseData, SenseKey};
use crate::status::StatusCode;

/// The opcode-set class of a logical unit, matching the device-type byte
/// returned in INQUIRY byte 0 (SCSI-2 peripheral device type codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// SCHD: fixed/removable direct-access hard disk.
    Schd,
    /// SCRM: removable direct-access disk.
    Scrm,
    /// SCCD: CD-ROM.
    Sccd,
    /// SCMO: magneto-optical disk.
    Scmo,
    /// SCTP: sequential-access tape.
    Sctp,
    /// SCLP: printer.
    Sclp,
    /// SCDP: DaynaPort network adapter.
    Scdp,
    /// SCHS: host services (vendor-specific processor device).
    Schs,
    /// SAHD: SASI hard disk (2 LUNs max).
    Sahd,
    /// SCSG: Linux SG pass-through.
    Scsg,
}

impl DeviceType {
    /// The INQUIRY byte-0 peripheral device type code.
    pub const fn peripheral_type(self) -> u8 {
        match self {
            Self::Schd | Self::Scrm | Self::Sahd => 0x00,
            Self::Sccd => 0x05,
            Self::Scmo => 0x07,
            Self::Sctp => 0x01,
            Self::Sclp => 0x02,
            Self::Scdp => 0x09,
            Self::Schs => 0x03,
            Self::Scsg => 0x1f,
        }
    }

    pub const fn is_sasi(self) -> bool {
        matches!(self, Self::Sahd)
    }

    /// The LUN ceiling for a controller hosting this device type: SASI
    /// controllers serve at most 2 LUNs, SCSI ones up to 32.
    pub const fn max_luns(self) -> u8 {
        if self.is_sasi() {
            2
        } else {
            32
        }
    }
}

/// SCSI compliance level, reported in INQUIRY byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScsiLevel {
    Scsi1Ccs = 1,
    Scsi2 = 2,
    Spc = 3,
    Spc2 = 4,
    Spc3 = 5,
    Spc4 = 6,
    Spc5 = 7,
    Spc6 = 8,
}

/// Vendor/product/revision strings as returned in INQUIRY bytes 8..36.
#[derive(Debug, Clone, Default)]
pub struct ProductData {
    vendor: String,
    product: String,
    revision: String,
}

impl ProductData {
    /// Sets vendor/product/revision, enforcing the INQUIRY field widths
    /// (8/16/4 characters). An empty string leaves the existing value
    /// untouched, matching the "force override only if non-empty" rule
    /// used when composing product data from multiple sources.
    pub fn set(&mut self, vendor: &str, product: &str, revision: &str) -> Result<(), String> {
        if vendor.len() > 8 {
            return Err(format!("vendor '{vendor}' is longer than 8 characters"));
        }
        if product.len() > 16 {
            return Err(format!("product '{product}' is longer than 16 characters"));
        }
        if revision.len() > 4 {
            return Err(format!("revision '{revision}' is longer than 4 characters"));
        }

        if !vendor.is_empty() {
            self.vendor = vendor.to_string();
        }
        if !product.is_empty() {
            self.product = product.to_string();
        }
        if !revision.is_empty() {
            self.revision = revision.to_string();
        }
        Ok(())
    }

    fn padded_bytes(&self) -> [u8; 28] {
        let mut buf = [b' '; 28];
        write_padded(&mut buf[0..8], &self.vendor);
        write_padded(&mut buf[8..24], &self.product);
        write_padded(&mut buf[24..28], &self.revision);
        buf
    }
}

fn write_padded(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// Shared state every logical unit carries, composed into concrete device
/// types rather than inherited.
#[derive(Debug, Clone)]
pub struct DeviceBase {
    pub device_type: DeviceType,
    pub lun: u8,
    pub scsi_level: ScsiLevel,
    pub response_data_format: u8,
    pub product_data: ProductData,

    pub ready: bool,
    pub reset: bool,
    pub attn: bool,

    pub protectable: bool,
    pub write_protected: bool,
    pub read_only: bool,

    pub removable: bool,
    pub removed: bool,
    pub locked: bool,
    pub stoppable: bool,
    pub stopped: bool,

    pub sense: SenseData,

    /// `None` means not reserved; `Some(id)` names the reserving initiator.
    pub reserving_initiator: Option<u8>,

    pub params: HashMap<String, String>,
}

impl DeviceBase {
    pub fn new(device_type: DeviceType, lun: u8) -> Self {
        Self {
            device_type,
            lun,
            scsi_level: ScsiLevel::Spc3,
            response_data_format: 2,
            product_data: ProductData::default(),
            ready: true,
            reset: false,
            attn: false,
            protectable: false,
            write_protected: false,
            read_only: false,
            removable: false,
            removed: false,
            locked: false,
            stoppable: false,
            stopped: false,
            sense: SenseData::default(),
            reserving_initiator: None,
            params: HashMap::new(),
        }
    }

    /// `write_protected ⇒ protectable ∧ ¬read_only`; a no-op otherwise.
    pub fn set_write_protected(&mut self, protected: bool) {
        if self.read_only {
            return;
        }
        self.write_protected = protected && self.protectable;
    }

    pub fn set_reset(&mut self, reset: bool) {
        self.reset = reset;
    }

    pub fn set_attn(&mut self, attn: bool) {
        self.attn = attn;
    }

    pub fn reset_status(&mut self) {
        self.sense.clear();
    }

    /// `CheckReady` from the PrimaryDevice base command set.
    pub fn check_ready(&mut self) -> Result<(), ScsiError> {
        if self.reset {
            self.reset = false;
            return Err(ScsiError::sense(SenseKey::UnitAttention, Asc::PowerOnOrReset));
        }
        if self.attn {
            self.attn = false;
            return Err(ScsiError::sense(
                SenseKey::UnitAttention,
                Asc::NotReadyToReadyTransition,
            ));
        }
        if !self.ready {
            return Err(ScsiError::sense(SenseKey::NotReady, Asc::MediumNotPresent));
        }
        Ok(())
    }

    /// `CheckReservation`: permits INQUIRY/REQUEST SENSE/RELEASE(6) and
    /// PREVENT ALLOW MEDIUM REMOVAL-with-prevent-clear regardless of who
    /// holds the reservation.
    pub fn check_reservation(&self, initiator_id: Option<u8>, opcode: u8, cdb: &[u8]) -> bool {
        let always_allowed = matches!(opcode, opcode::REQUEST_SENSE | opcode::INQUIRY | opcode::RELEASE_6)
            || (opcode == opcode::PREVENT_ALLOW_MEDIUM_REMOVAL && cdb.len() > 4 && cdb[4] & 1 == 0);

        match self.reserving_initiator {
            None => true,
            Some(_) if always_allowed => true,
            Some(holder) => initiator_id == Some(holder),
        }
    }

    pub fn discard_reservation(&mut self) {
        self.reserving_initiator = None;
    }
}

/// The context a controller hands to a logical unit's dispatch call: the
/// pieces of controller state a device needs to read or fill in, kept
/// deliberately narrow so devices never reach back into the controller.
pub struct DispatchContext<'a> {
    pub cdb: &'a [u8],
    pub opcode: u8,
    pub initiator_id: Option<u8>,
    pub target_id: u8,
    /// Sorted LUN numbers currently attached to the controller (for REPORT LUNS).
    pub attached_luns: &'a [u8],
    /// Set by the device to the bytes that should go out in DATA IN.
    pub data_in: Option<Vec<u8>>,
}

/// The capability set the controller consumes from each device personality.
/// `Send` so a `Controller` (and its attached LUNs) can be handed to a
/// background thread, as the in-process loopback bus's target side does.
pub trait LogicalUnit: Send {
    fn base(&self) -> &DeviceBase;
    fn base_mut(&mut self) -> &mut DeviceBase;

    /// Appends device-specific bytes beyond the standard 36-byte INQUIRY
    /// response. The base INQUIRY handler never grows past 36 bytes itself;
    /// a device wanting a longer response (e.g. a 37th vendor byte some
    /// drivers request) overrides this.
    fn inquiry_internal(&self, _buf: &mut Vec<u8>) {}

    fn write_data(&mut self, _cdb: &[u8], _buf: &[u8], _offset: usize) -> Result<(), ScsiError> {
        Err(ScsiError::sense(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode))
    }

    /// Logical block size in bytes, used to turn a READ/WRITE CDB's block
    /// count into a byte length. Devices with no block structure (SCHS, SCLP)
    /// never reach this since they don't advertise `has_data_out` block opcodes.
    fn block_size(&self) -> u32 {
        512
    }

    fn read_data(&mut self, _buf: &mut [u8]) -> Result<usize, ScsiError> {
        Err(ScsiError::sense(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode))
    }

    fn mode_select(&mut self, _cdb: &[u8], _buf: &[u8]) -> Result<(), ScsiError> {
        Err(ScsiError::sense(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb))
    }

    fn flush_cache(&mut self) -> Result<(), ScsiError> {
        Ok(())
    }

    /// Additional opcodes a concrete device supports beyond the mandatory
    /// PrimaryDevice set; called when [`dispatch`](Self::dispatch)'s default
    /// implementation doesn't recognize the opcode.
    fn dispatch_extended(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        let _ = ctx;
        Err(ScsiError::sense(
            SenseKey::IllegalRequest,
            Asc::InvalidCommandOperationCode,
        ))
    }

    /// Routes an opcode to its handler, returning the status to report.
    /// Device exceptions (`Err`) are translated by the controller into
    /// CHECK_CONDITION with the matching sense data.
    fn dispatch(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        match ctx.opcode {
            opcode::TEST_UNIT_READY => {
                self.base_mut().check_ready()?;
                Ok(StatusCode::Good)
            }
            opcode::INQUIRY => self.inquiry(ctx),
            opcode::REQUEST_SENSE => self.request_sense(ctx),
            opcode::REPORT_LUNS => self.report_luns(ctx),
            opcode::RESERVE_6 => {
                self.base_mut().reserving_initiator = ctx.initiator_id;
                Ok(StatusCode::Good)
            }
            opcode::RELEASE_6 => {
                self.base_mut().discard_reservation();
                Ok(StatusCode::Good)
            }
            opcode::SEND_DIAGNOSTIC => {
                if ctx.cdb.len() > 4 && (ctx.cdb[3] != 0 || ctx.cdb[4] != 0) {
                    return Err(ScsiError::sense(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
                }
                Ok(StatusCode::Good)
            }
            _ => self.dispatch_extended(ctx),
        }
    }

    fn inquiry(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        if ctx.cdb.len() < 5 || (ctx.cdb[1] & 0x1f) != 0 || ctx.cdb[2] != 0 {
            return Err(ScsiError::sense(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        let base = self.base();
        let mut buf = vec![0u8; 36];
        buf[0] = base.device_type.peripheral_type();
        if base.removable {
            buf[1] |= 0x80;
        }
        buf[2] = base.scsi_level as u8;
        buf[3] = base.response_data_format;
        buf[4] = 0x1f;
        buf[7] = 0x08; // supports linked commands
        buf[8..36].copy_from_slice(&base.product_data.padded_bytes());

        self.inquiry_internal(&mut buf);

        let allocation_length = if ctx.cdb.len() > 4 { ctx.cdb[4] as usize } else { 0 };
        let allocation_length = allocation_length.min(buf.len());
        buf.truncate(allocation_length);

        ctx.data_in = Some(buf);
        Ok(StatusCode::Good)
    }

    fn request_sense(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        let base = self.base();
        if matches!(base.sense.key, None | Some(SenseKey::NoSense)) && !base.ready {
            return Err(ScsiError::sense(SenseKey::NotReady, Asc::MediumNotPresent));
        }

        let requested = if ctx.cdb.len() > 4 { ctx.cdb[4] as usize } else { 0 };
        let is_ccs = base.scsi_level == ScsiLevel::Scsi1Ccs;
        let extended = !(is_ccs && requested < 4);
        // SCSI-1 CCS initiators that pass an allocation length of 0 still
        // expect the 4-byte fixed sense format.
        let effective_requested = if is_ccs && requested == 0 { 4 } else { requested };

        let mut buf = base.sense.to_bytes(extended);
        let alloc = if effective_requested == 0 {
            buf.len()
        } else {
            effective_requested.min(buf.len())
        };
        buf.truncate(alloc);

        self.base_mut().reset_status();
        ctx.data_in = Some(buf);
        Ok(StatusCode::Good)
    }

    fn report_luns(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        if ctx.cdb.len() > 2 && ctx.cdb[2] != 0 {
            return Err(ScsiError::sense(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb));
        }

        let lun_list_length = (ctx.attached_luns.len() * 8) as u32;
        let mut buf = vec![0u8; 8 + ctx.attached_luns.len() * 8];
        buf[0..4].copy_from_slice(&lun_list_length.to_be_bytes());
        for (i, &lun) in ctx.attached_luns.iter().enumerate() {
            let off = 8 + i * 8;
            buf[off + 1] = lun;
        }

        let allocation_length = if ctx.cdb.len() > 9 {
            u32::from_be_bytes([ctx.cdb[6], ctx.cdb[7], ctx.cdb[8], ctx.cdb[9]]) as usize
        } else {
            buf.len()
        };
        buf.truncate(allocation_length.min(buf.len()));

        ctx.data_in = Some(buf);
        Ok(StatusCode::Good)
    }
}
