//! The per-target phase state machine: BUS FREE -> SELECTION -> (MESSAGE
//! OUT) -> COMMAND -> (DATA IN|DATA OUT) -> STATUS -> MESSAGE IN -> BUS FREE.

use std::collections::HashMap;

use log::{trace, warn};

use crate::bus::{Bus, HandshakeOutcome, Phase, Signal};
use crate::device::{DispatchContext, LogicalUnit};
use crate::error::ScsiError;
use crate::opcode::{self, OpcodeInfo};
use crate::sense::{self, Asc, SenseKey};
use crate::status::StatusCode;

const MSG_COMMAND_COMPLETE: u8 = 0x00;
const MSG_EXTENDED_MESSAGE: u8 = 0x01;
const MSG_ABORT: u8 = 0x06;
const MSG_BUS_DEVICE_RESET: u8 = 0x0c;
const MSG_LINKED_COMMAND_COMPLETE: u8 = 0x0a;
const MSG_LINKED_COMMAND_COMPLETE_WITH_FLAG: u8 = 0x0b;

const CONTROL_LINK: u8 = 0x01;
const CONTROL_FLAG: u8 = 0x02;

/// What to do once the controller next returns to BUS FREE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    #[default]
    None,
    Shutdown,
}

/// How the next DATA phase should be driven. `ForcedDataOut` models the
/// `current_length == -1` sentinel FORMAT UNIT relies on with the Linux SG
/// pass-through driver: it forces DATA OUT even when no bytes remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferDirection {
    In,
    Out,
    ForcedDataOut,
}

/// Computes the DATA OUT byte length a dispatched opcode expects, from its
/// allocation-length CDB field. For READ/WRITE-family opcodes this field is
/// a block count and gets multiplied by `block_size`; for others (e.g. MODE
/// SELECT) it's already a byte count. Opcodes with no field at all (FORMAT
/// UNIT) return 0, which the caller treats as the forced-transfer sentinel.
fn expected_data_out_length(info: &OpcodeInfo, cdb: &[u8], block_size: u32) -> usize {
    let Some(offset) = info.allocation_length_offset else {
        return 0;
    };
    let offset = offset as usize;
    let size = info.allocation_length_size as usize;
    if cdb.len() < offset + size || size == 0 || size > 4 {
        return 0;
    }

    let mut value: u32 = 0;
    for &byte in &cdb[offset..offset + size] {
        value = (value << 8) | u32::from(byte);
    }

    if info.transfer_is_blocks {
        value as usize * block_size as usize
    } else {
        value as usize
    }
}

/// One SCSI (or SASI) target controller, owning up to 32 attached logical
/// units and driving the phase state machine on a [`Bus`].
pub struct Controller {
    target_id: u8,
    initiator_id: Option<u8>,

    luns: HashMap<u8, Box<dyn LogicalUnit>>,

    cdb: [u8; 16],
    cdb_len: usize,

    /// Per-controller transfer buffer; grows monotonically, never shrinks
    /// mid-command. Deliberately not a process-wide static (see the crate's
    /// notes on avoiding cross-controller sharing accidents).
    buffer: Vec<u8>,
    offset: usize,
    remaining_length: usize,
    current_length: i32,
    chunk_size: usize,
    transfer_direction: TransferDirection,

    status: StatusCode,

    identified_lun: Option<u8>,
    atn_msg: bool,
    msg_bytes: Vec<u8>,
    linked: bool,
    flag: bool,

    deferred_sense: Option<(SenseKey, Asc, u8)>,

    /// `(lun, opcode)` awaiting a `write_data`/`mode_select` call once the
    /// in-flight DATA OUT transfer completes.
    pending_write: Option<(u8, u8)>,

    shutdown_mode: ShutdownMode,
}

impl Controller {
    pub fn new(target_id: u8) -> Self {
        Self {
            target_id,
            initiator_id: None,
            luns: HashMap::new(),
            cdb: [0; 16],
            cdb_len: 0,
            buffer: vec![0; 512],
            offset: 0,
            remaining_length: 0,
            current_length: 0,
            chunk_size: 0,
            transfer_direction: TransferDirection::In,
            status: StatusCode::Good,
            identified_lun: None,
            atn_msg: false,
            msg_bytes: Vec::new(),
            linked: false,
            flag: false,
            deferred_sense: None,
            pending_write: None,
            shutdown_mode: ShutdownMode::None,
        }
    }

    pub const fn target_id(&self) -> u8 {
        self.target_id
    }

    pub const fn initiator_id(&self) -> Option<u8> {
        self.initiator_id
    }

    pub const fn lun_count(&self) -> usize {
        self.luns.len()
    }

    pub fn schedule_shutdown(&mut self, mode: ShutdownMode) {
        self.shutdown_mode = mode;
    }

    /// Attaches `device` at its own LUN, rejecting if the LUN is out of
    /// range for this device type, already occupied, or (for LUN > 0) LUN 0
    /// isn't attached yet.
    pub fn add_device(&mut self, lun: u8, device: Box<dyn LogicalUnit>) -> Result<(), String> {
        let max_luns = device.base().device_type.max_luns();
        if lun >= max_luns {
            return Err(format!("LUN {lun} is out of range for this device type"));
        }
        if self.luns.contains_key(&lun) {
            return Err(format!("LUN {lun} is already attached"));
        }
        if lun != 0 && !self.luns.contains_key(&0) {
            return Err("a controller cannot serve LUN > 0 without LUN 0".to_string());
        }
        self.luns.insert(lun, device);
        Ok(())
    }

    pub fn remove_device(&mut self, lun: u8) -> bool {
        self.luns.remove(&lun).is_some()
    }

    pub fn lun_mut(&mut self, lun: u8) -> Option<&mut dyn LogicalUnit> {
        self.luns.get_mut(&lun).map(|d| d.as_mut())
    }

    fn attached_luns(&self) -> Vec<u8> {
        let mut luns: Vec<u8> = self.luns.keys().copied().collect();
        luns.sort_unstable();
        luns
    }

    pub fn reset(&mut self, bus: &mut dyn Bus) {
        self.offset = 0;
        self.remaining_length = 0;
        self.current_length = 0;
        self.chunk_size = 0;
        self.status = StatusCode::Good;
        self.initiator_id = None;
        for device in self.luns.values_mut() {
            let base = device.base_mut();
            base.reset = true;
        }
        bus.reset();
    }

    /// Runs the phase loop for one SCSI connection: resolves the initiator
    /// ID from the selection bitmask (excluding this target's own bit) and
    /// loops `process()` until BUS FREE, returning any scheduled shutdown.
    pub fn process_on_controller(&mut self, bus: &mut dyn Bus, selection_mask: u32) -> ShutdownMode {
        let without_target = selection_mask & !(1 << self.target_id);
        self.initiator_id = if without_target != 0 {
            Some(without_target.trailing_zeros() as u8)
        } else {
            None
        };

        while self.process(bus) {}

        self.shutdown_mode
    }

    /// Runs one phase handler, returning `true` if the connection continues.
    fn process(&mut self, bus: &mut dyn Bus) -> bool {
        bus.acquire();

        match bus.get_phase() {
            Phase::BusFree => self.bus_free(bus),
            Phase::Selection => self.selection(bus),
            Phase::Command => self.command(bus),
            Phase::MsgOut => self.msg_out(bus),
            Phase::MsgIn => self.msg_in(bus),
            Phase::Status => self.status_phase(bus),
            Phase::DataIn => self.data_in(bus),
            Phase::DataOut => self.data_out(bus),
            _ => false,
        }
    }

    fn bus_free(&mut self, bus: &mut dyn Bus) -> bool {
        bus.set_signal(Signal::Bsy, false);
        bus.set_signal(Signal::Req, false);
        bus.set_signal(Signal::Msg, false);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, false);

        self.status = StatusCode::Good;
        self.identified_lun = None;
        self.atn_msg = false;

        if self.shutdown_mode != ShutdownMode::None {
            return false;
        }

        if !bus.wait_for_selection() {
            return false;
        }
        bus.acquire();
        bus.get_signal(Signal::Sel) && !bus.get_signal(Signal::Bsy)
    }

    fn selection(&mut self, bus: &mut dyn Bus) -> bool {
        bus.set_signal(Signal::Bsy, true);
        if !bus.wait_handshake(Signal::Sel, false) {
            bus.set_signal(Signal::Bsy, false);
            return false;
        }
        trace!("target {} selected", self.target_id);

        // ATN pending: go to MSG OUT first. Otherwise straight to COMMAND.
        bus.set_signal(Signal::Msg, true);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, !bus.get_signal(Signal::Atn));
        true
    }

    fn command(&mut self, bus: &mut dyn Bus) -> bool {
        bus.set_signal(Signal::Msg, true);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, true);

        let mut raw = [0u8; 16];
        let outcome = bus.target_command_handshake(&mut raw);

        let actual_len = match outcome {
            HandshakeOutcome::Complete(n) => n,
            HandshakeOutcome::Timeout | HandshakeOutcome::BusReset => {
                bus.set_signal(Signal::Rst, true);
                bus.set_signal(Signal::Bsy, false);
                if outcome == HandshakeOutcome::Timeout {
                    self.deferred_sense = Some((SenseKey::AbortedCommand, Asc::CommandPhaseError, 0));
                } else {
                    self.deferred_sense =
                        Some((SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode, 0));
                }
                return false;
            }
        };

        let opcode = raw[0];
        let info: OpcodeInfo = opcode::lookup(opcode);
        let cdb_len = info.cdb_len as usize;

        if actual_len != cdb_len {
            warn!("expected {cdb_len} CDB bytes for opcode {opcode:#04x}, got {actual_len}");
            self.deferred_sense = Some((SenseKey::AbortedCommand, Asc::CommandPhaseError, 0));
            bus.set_signal(Signal::Bsy, false);
            return false;
        }

        self.cdb[..cdb_len].copy_from_slice(&raw[..cdb_len]);
        self.cdb_len = cdb_len;

        let control = self.cdb[cdb_len - 1];
        self.linked = control & CONTROL_LINK != 0;
        self.flag = control & CONTROL_FLAG != 0;
        if self.flag && !self.linked {
            self.error(bus, SenseKey::IllegalRequest, Asc::InvalidFieldInCdb, StatusCode::CheckCondition);
            return true;
        }

        if let Some((key, asc, ascq)) = self.deferred_sense.take() {
            if opcode == opcode::REQUEST_SENSE {
                let mut sense = crate::sense::SenseData::default();
                sense.set(key, asc, ascq);
                self.buffer = sense.to_bytes(true);
                self.set_transfer(self.buffer.len(), self.buffer.len());
                self.transfer_direction = TransferDirection::In;
                bus.set_signal(Signal::Msg, false);
                bus.set_signal(Signal::Cd, true);
                bus.set_signal(Signal::Io, true);
                return true;
            }
        }

        self.execute(bus, opcode);
        true
    }

    fn execute(&mut self, bus: &mut dyn Bus, opcode: u8) {
        self.current_length = 0;
        self.offset = 0;
        self.remaining_length = 0;
        self.chunk_size = 0;

        let effective_lun = self
            .identified_lun
            .unwrap_or_else(|| if self.cdb_len > 1 { self.cdb[1] >> 5 } else { 0 });

        let resolved_lun = if self.luns.contains_key(&effective_lun) {
            Some(effective_lun)
        } else if matches!(opcode, opcode::INQUIRY | opcode::REQUEST_SENSE) {
            Some(0).filter(|_| self.luns.contains_key(&0))
        } else {
            None
        };

        let Some(lun) = resolved_lun else {
            self.error(
                bus,
                SenseKey::IllegalRequest,
                Asc::LogicalUnitNotSupported,
                StatusCode::CheckCondition,
            );
            return;
        };

        if opcode != opcode::REQUEST_SENSE {
            self.status = StatusCode::Good;
            self.luns.get_mut(&lun).unwrap().base_mut().reset_status();
        }

        let missing_lun = !self.luns.contains_key(&effective_lun);

        {
            let device = self.luns.get(&lun).unwrap();
            if !device
                .base()
                .check_reservation(self.initiator_id, opcode, &self.cdb[..self.cdb_len])
            {
                self.status = StatusCode::ReservationConflict;
                bus.set_signal(Signal::Msg, false);
                bus.set_signal(Signal::Cd, false);
                bus.set_signal(Signal::Io, true);
                return;
            }
        }

        let attached = self.attached_luns();
        let mut ctx = DispatchContext {
            cdb: &self.cdb[..self.cdb_len],
            opcode,
            initiator_id: self.initiator_id,
            target_id: self.target_id,
            attached_luns: &attached,
            data_in: None,
        };

        let info = opcode::lookup(opcode);
        let device = self.luns.get_mut(&lun).unwrap();
        match device.dispatch(&mut ctx) {
            Ok(status) => {
                self.status = status;
                if missing_lun && matches!(opcode, opcode::INQUIRY | opcode::REQUEST_SENSE) {
                    if let Some(data) = ctx.data_in.as_mut() {
                        if opcode == opcode::INQUIRY && !data.is_empty() {
                            data[0] = 0x7f;
                        } else if opcode == opcode::REQUEST_SENSE {
                            *data = sense::missing_lun_sense();
                        }
                    }
                }
                if let Some(data) = ctx.data_in {
                    self.buffer = data;
                    let len = self.buffer.len();
                    self.set_transfer(len, len);
                    self.transfer_direction = TransferDirection::In;
                    bus.set_signal(Signal::Msg, false);
                    bus.set_signal(Signal::Cd, true);
                    bus.set_signal(Signal::Io, true);
                } else if info.has_data_out {
                    let block_size = self.luns.get(&lun).map_or(512, |d| d.block_size());
                    let length = expected_data_out_length(&info, &self.cdb[..self.cdb_len], block_size);
                    if length == 0 {
                        self.current_length = -1;
                        self.transfer_direction = TransferDirection::ForcedDataOut;
                    } else {
                        self.current_length = length as i32;
                        self.set_transfer(length, length.min(4096));
                        self.transfer_direction = TransferDirection::Out;
                    }
                    self.pending_write = Some((lun, opcode));
                    bus.set_signal(Signal::Msg, true);
                    bus.set_signal(Signal::Cd, true);
                    bus.set_signal(Signal::Io, true);
                } else {
                    bus.set_signal(Signal::Msg, false);
                    bus.set_signal(Signal::Cd, false);
                    bus.set_signal(Signal::Io, true);
                }
            }
            Err(ScsiError::Sense { key, asc, ascq, status }) => {
                self.error_ascq(bus, key, asc, ascq, status, lun);
            }
        }
    }

    fn set_transfer(&mut self, length: usize, chunk: usize) {
        self.remaining_length = length;
        self.chunk_size = length.min(chunk);
    }

    fn status_phase(&mut self, bus: &mut dyn Bus) -> bool {
        bus.set_signal(Signal::Msg, false);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, true);

        let status = self.status.for_linked(self.linked);
        let outcome = bus.target_send_handshake(&[status.value()], 0);
        if outcome.is_fatal() {
            bus.set_signal(Signal::Rst, true);
            bus.set_signal(Signal::Bsy, false);
            return false;
        }

        bus.set_signal(Signal::Io, false);
        true
    }

    fn msg_in(&mut self, bus: &mut dyn Bus) -> bool {
        bus.set_signal(Signal::Msg, false);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, false);

        let msg = if self.flag && self.linked {
            MSG_LINKED_COMMAND_COMPLETE_WITH_FLAG
        } else if self.linked {
            MSG_LINKED_COMMAND_COMPLETE
        } else {
            MSG_COMMAND_COMPLETE
        };

        let outcome = bus.target_send_handshake(&[msg], 0);
        if outcome.is_fatal() {
            bus.set_signal(Signal::Rst, true);
            bus.set_signal(Signal::Bsy, false);
            return false;
        }

        if self.linked {
            // The connection continues: the next COMMAND phase picks up the next CDB.
            self.linked = false;
            self.flag = false;
            bus.set_signal(Signal::Msg, true);
            bus.set_signal(Signal::Cd, false);
            bus.set_signal(Signal::Io, true);
        } else {
            bus.set_signal(Signal::Bsy, false);
        }
        true
    }

    fn msg_out(&mut self, bus: &mut dyn Bus) -> bool {
        bus.set_signal(Signal::Msg, true);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, false);

        if !self.atn_msg {
            self.atn_msg = true;
            self.msg_bytes.clear();
        }

        let mut byte = 0u8;
        let outcome = bus.target_byte_in(&mut byte);
        match outcome {
            HandshakeOutcome::Complete(_) => self.msg_bytes.push(byte),
            _ => {
                bus.set_signal(Signal::Rst, true);
                bus.set_signal(Signal::Bsy, false);
                return false;
            }
        }

        if bus.get_signal(Signal::Atn) {
            // More bytes to come.
            return true;
        }

        self.process_message();
        bus.set_signal(Signal::Msg, true);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, true);
        true
    }

    fn process_message(&mut self) {
        let bytes = std::mem::take(&mut self.msg_bytes);
        let mut iter = bytes.into_iter();
        while let Some(msg) = iter.next() {
            match msg {
                MSG_ABORT => {
                    self.atn_msg = false;
                    return;
                }
                MSG_BUS_DEVICE_RESET => {
                    if let Some(lun) = self.identified_lun {
                        if let Some(device) = self.luns.get_mut(&lun) {
                            device.base_mut().set_reset(true);
                            device.base_mut().discard_reservation();
                        }
                    }
                    self.atn_msg = false;
                    return;
                }
                MSG_EXTENDED_MESSAGE => {
                    if let Some(sub) = iter.next() {
                        warn!("rejecting extended message code {sub:#04x}");
                    }
                    self.atn_msg = false;
                    return;
                }
                b if b >= 0x80 => {
                    self.identified_lun = Some(b & 0x1f);
                }
                other => {
                    warn!("ignoring unsupported message byte {other:#04x}");
                }
            }
        }
        // COMMAND follows after a fully-processed message sequence.
    }

    fn data_in(&mut self, bus: &mut dyn Bus) -> bool {
        if self.remaining_length == 0 {
            bus.set_signal(Signal::Msg, false);
            bus.set_signal(Signal::Cd, false);
            bus.set_signal(Signal::Io, true);
            return true;
        }

        bus.set_signal(Signal::Msg, false);
        bus.set_signal(Signal::Cd, true);
        bus.set_signal(Signal::Io, true);

        let chunk = self.chunk_size.max(1).min(self.remaining_length);
        let slice = &self.buffer[self.offset..self.offset + chunk];
        let outcome = bus.target_send_handshake(slice, 0);

        match outcome {
            HandshakeOutcome::Complete(n) => {
                self.offset += n;
                self.remaining_length = self.remaining_length.saturating_sub(n);
                self.chunk_size = self.remaining_length.min(self.chunk_size.max(1));
                if n < chunk {
                    self.remaining_length = 0;
                }
            }
            _ => {
                bus.set_signal(Signal::Rst, true);
                bus.set_signal(Signal::Bsy, false);
                return false;
            }
        }

        true
    }

    fn data_out(&mut self, bus: &mut dyn Bus) -> bool {
        let forced = self.transfer_direction == TransferDirection::ForcedDataOut;

        if self.remaining_length == 0 && !forced {
            if let Some((lun, opcode)) = self.pending_write.take() {
                let cdb = self.cdb;
                let cdb_len = self.cdb_len;
                let written = self.offset;
                let is_mode_select = matches!(opcode, opcode::MODE_SELECT_6 | opcode::MODE_SELECT_10);
                if let Some(device) = self.luns.get_mut(&lun) {
                    let result = if is_mode_select {
                        device.mode_select(&cdb[..cdb_len], &self.buffer[..written])
                    } else {
                        device.write_data(&cdb[..cdb_len], &self.buffer[..written], 0)
                    };
                    if let Err(ScsiError::Sense { key, asc, ascq, status }) = result {
                        self.error_ascq(bus, key, asc, ascq, status, lun);
                        return true;
                    }
                }
            }
            bus.set_signal(Signal::Msg, false);
            bus.set_signal(Signal::Cd, false);
            bus.set_signal(Signal::Io, true);
            return true;
        }

        bus.set_signal(Signal::Msg, true);
        bus.set_signal(Signal::Cd, true);
        bus.set_signal(Signal::Io, true);

        let chunk = if forced { 1 } else { self.chunk_size.max(1).min(self.remaining_length) };
        if self.buffer.len() < self.offset + chunk {
            self.buffer.resize(self.offset + chunk, 0);
        }
        let outcome = bus.target_receive_handshake(&mut self.buffer[self.offset..self.offset + chunk]);

        match outcome {
            HandshakeOutcome::Complete(n) => {
                self.offset += n;
                if forced {
                    // One forced chunk is enough; fall through to STATUS next.
                    self.transfer_direction = TransferDirection::Out;
                } else {
                    self.remaining_length = self.remaining_length.saturating_sub(n);
                }
            }
            _ => {
                bus.set_signal(Signal::Rst, true);
                bus.set_signal(Signal::Bsy, false);
                return false;
            }
        }

        true
    }

    /// The error injection path: records sense on the addressed LUN (LUN 0
    /// if the target LUN is missing or the ASC is LOGICAL_UNIT_NOT_SUPPORTED)
    /// and transitions to STATUS, unless already in STATUS/MSG IN or RST is set.
    fn error(&mut self, bus: &mut dyn Bus, key: SenseKey, asc: Asc, status: StatusCode) {
        self.error_ascq(bus, key, asc, 0, status, 0);
    }

    fn error_ascq(&mut self, bus: &mut dyn Bus, key: SenseKey, asc: Asc, ascq: u8, status: StatusCode, lun: u8) {
        if bus.is_phase(Phase::Status) || bus.is_phase(Phase::MsgIn) || bus.get_signal(Signal::Rst) {
            bus.set_signal(Signal::Bsy, false);
            return;
        }

        let sense_lun = if matches!(asc, Asc::LogicalUnitNotSupported) || !self.luns.contains_key(&lun) {
            0
        } else {
            lun
        };
        if let Some(device) = self.luns.get_mut(&sense_lun) {
            device.base_mut().sense.set(key, asc, ascq);
        }

        self.status = status;
        bus.set_signal(Signal::Msg, false);
        bus.set_signal(Signal::Cd, false);
        bus.set_signal(Signal::Io, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::host_services::HostServicesDevice;

    fn controller_with_host_services() -> Controller {
        let mut controller = Controller::new(0);
        controller
            .add_device(0, Box::new(HostServicesDevice::new()))
            .unwrap();
        controller
    }

    #[test]
    fn rejects_second_device_at_same_lun() {
        let mut controller = controller_with_host_services();
        assert!(controller.add_device(0, Box::new(HostServicesDevice::new())).is_err());
    }

    #[test]
    fn rejects_lun_without_lun_zero() {
        let mut controller = Controller::new(0);
        assert!(controller.add_device(1, Box::new(HostServicesDevice::new())).is_err());
    }

    #[test]
    fn attached_luns_sorted() {
        let mut controller = controller_with_host_services();
        controller
            .add_device(3, Box::new(HostServicesDevice::new()))
            .unwrap();
        assert_eq!(controller.attached_luns(), vec![0, 3]);
    }
}
