//! Drives a `Controller` through complete SCSI connections over an
//! in-process loopback bus: a background thread runs the dispatcher while
//! this thread plays the initiator, exactly as two independent nodes on a
//! real parallel bus would negotiate phases via REQ/ACK.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use scsi_target_core::bus::loopback::LoopbackBus;
use scsi_target_core::bus::{Bus, Phase, Signal};
use scsi_target_core::controller::{Controller, ShutdownMode};
use scsi_target_core::devices::host_services::HostServicesDevice;
use scsi_target_core::devices::memory_disk::MemoryDisk;
use scsi_target_core::target_set::TargetSet;

const INITIATOR_A: u8 = 7;
const INITIATOR_B: u8 = 6;
const TARGET_ID: u8 = 0;

enum Cmd {
    Shutdown,
}

/// Owns the initiator side of a loopback bus pair and the background thread
/// servicing its target side, so a test can run several connections in a
/// row against the same controller state.
struct Harness {
    bus: LoopbackBus,
    target_id: u8,
    cmd_tx: mpsc::Sender<Cmd>,
    ack_rx: mpsc::Receiver<()>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Harness {
    fn new(controller: Controller) -> Self {
        let target_id = controller.target_id();
        let mut set = TargetSet::new();
        set.attach(controller).unwrap();

        let mut target_bus = LoopbackBus::new(true);
        let initiator_bus = target_bus.handle(false);

        let (cmd_tx, cmd_rx) = mpsc::channel::<Cmd>();
        let (ack_tx, ack_rx) = mpsc::channel::<()>();

        let worker = thread::spawn(move || {
            target_bus.mark_target_ready();
            loop {
                if let Ok(Cmd::Shutdown) = cmd_rx.try_recv() {
                    if let Some(c) = set.controller_mut(target_id) {
                        c.schedule_shutdown(ShutdownMode::Shutdown);
                    }
                    ack_tx.send(()).unwrap();
                }
                if !set.run_once(&mut target_bus) {
                    break;
                }
            }
        });

        let mut bus = initiator_bus;
        assert!(bus.wait_for_target(), "target thread never came up");

        Self { bus, target_id, cmd_tx, ack_rx, worker: Some(worker) }
    }

    fn select(&mut self, initiator_id: u8) {
        self.bus.set_dat((1u8 << initiator_id) | (1u8 << self.target_id));
        self.bus.set_signal(Signal::Sel, true);
        let selected = self.bus.wait_handshake(Signal::Bsy, true);
        self.bus.set_signal(Signal::Sel, false);
        assert!(selected, "target {} did not respond to selection", self.target_id);
    }

    fn wait_phase(&mut self, phase: Phase) {
        let start = Instant::now();
        loop {
            self.bus.acquire();
            if self.bus.get_phase() == phase {
                return;
            }
            assert!(start.elapsed() < Duration::from_secs(2), "timed out waiting for {phase:?}");
        }
    }

    /// Runs one full command cycle: SELECT, send `cdb`, read DATA IN if
    /// offered, read STATUS, and consume the MESSAGE IN byte.
    fn command(&mut self, initiator_id: u8, cdb: &[u8], max_data_in: usize) -> (u8, Vec<u8>) {
        self.select(initiator_id);

        self.wait_phase(Phase::Command);
        let sent = self.bus.initiator_send_handshake(cdb);
        assert_eq!(sent.count(), cdb.len(), "CDB not fully accepted");

        self.bus.acquire();
        let data = if self.bus.is_phase(Phase::DataIn) {
            let mut buf = vec![0u8; max_data_in];
            let outcome = self.bus.initiator_receive_handshake(&mut buf);
            buf.truncate(outcome.count());
            buf
        } else {
            Vec::new()
        };

        self.wait_phase(Phase::Status);
        let status = self.bus.initiator_byte_in().expect("STATUS byte");

        self.wait_phase(Phase::MsgIn);
        self.bus.initiator_msg_in_handshake().expect("MESSAGE IN byte");

        (status, data)
    }

    fn inquiry(&mut self, initiator_id: u8) -> (u8, Vec<u8>) {
        self.command(initiator_id, &[0x12, 0x00, 0x00, 0x00, 36, 0x00], 36)
    }

    fn request_sense(&mut self, initiator_id: u8) -> (u8, Vec<u8>) {
        self.command(initiator_id, &[0x03, 0x00, 0x00, 0x00, 0x12, 0x00], 18)
    }

    /// A WRITE-shaped command: SELECT, send `cdb`, push `payload` through
    /// DATA OUT, then read STATUS and consume MESSAGE IN.
    fn write(&mut self, initiator_id: u8, cdb: &[u8], payload: &[u8]) -> u8 {
        self.select(initiator_id);

        self.wait_phase(Phase::Command);
        let sent = self.bus.initiator_send_handshake(cdb);
        assert_eq!(sent.count(), cdb.len(), "CDB not fully accepted");

        self.wait_phase(Phase::DataOut);
        let sent = self.bus.initiator_send_handshake(payload);
        assert_eq!(sent.count(), payload.len(), "DATA OUT not fully accepted");

        self.wait_phase(Phase::Status);
        let status = self.bus.initiator_byte_in().expect("STATUS byte");

        self.wait_phase(Phase::MsgIn);
        self.bus.initiator_msg_in_handshake().expect("MESSAGE IN byte");

        status
    }

    /// Pulses RST as an initiator would on a real bus reset; the dispatcher
    /// is expected to mark every attached device's `reset` flag on the next
    /// idle poll.
    fn reset_bus(&mut self) {
        self.bus.set_signal(Signal::Rst, true);
        thread::sleep(Duration::from_millis(25));
        self.bus.set_signal(Signal::Rst, false);
        thread::sleep(Duration::from_millis(25));
    }

    /// Schedules shutdown on the background controller and runs one more
    /// trivial connection so the scheduled shutdown is observed at that
    /// connection's own BUS FREE transition, then joins the worker thread.
    fn finish(mut self) {
        self.cmd_tx.send(Cmd::Shutdown).unwrap();
        self.ack_rx.recv_timeout(Duration::from_secs(1)).expect("worker never acked shutdown");
        self.command(INITIATOR_A, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00], 0);
        self.worker.take().unwrap().join().expect("worker thread panicked");
    }
}

fn single_host_services_controller() -> Controller {
    let mut controller = Controller::new(TARGET_ID);
    controller.add_device(0, Box::new(HostServicesDevice::new())).unwrap();
    controller
}

#[test]
fn inquiry_reports_device_identity() {
    let mut h = Harness::new(single_host_services_controller());

    let (status, data) = h.inquiry(INITIATOR_A);
    assert_eq!(status, 0x00);
    assert_eq!(data[0], 0x03);
    assert_eq!(&data[8..16], b"SCSI2Pi ");

    h.finish();
}

#[test]
fn atari_icd_prefix_behaves_like_the_unprefixed_inquiry() {
    let mut h = Harness::new(single_host_services_controller());

    let (status, data) = h.command(INITIATOR_A, &[0x1f, 0x12, 0x00, 0x00, 0x00, 36, 0x00], 36);
    assert_eq!(status, 0x00);
    assert_eq!(data[0], 0x03);
    assert_eq!(&data[8..16], b"SCSI2Pi ");

    h.finish();
}

#[test]
fn test_unit_ready_after_reset_reports_unit_attention_once() {
    let mut controller = Controller::new(TARGET_ID);
    controller.add_device(0, Box::new(MemoryDisk::new(0, 16))).unwrap();
    let mut h = Harness::new(controller);

    let (status, _) = h.command(INITIATOR_A, &[0x1b, 0x00, 0x00, 0x00, 0x01, 0x00], 0);
    assert_eq!(status, 0x00);

    h.reset_bus();

    let (status, _) = h.command(INITIATOR_A, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00], 0);
    assert_eq!(status, 0x02, "CHECK CONDITION expected for the first TUR after reset");

    let (status, sense) = h.request_sense(INITIATOR_A);
    assert_eq!(status, 0x00);
    assert_eq!(sense[2] & 0x0f, 0x06, "sense key UNIT_ATTENTION");
    assert_eq!(sense[12], 0x29, "asc POWER_ON_OR_RESET");

    let (status, _) = h.command(INITIATOR_A, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00], 0);
    assert_eq!(status, 0x00, "the reset condition is cleared after being reported once");

    h.finish();
}

#[test]
fn report_luns_lists_every_attached_lun() {
    let mut controller = Controller::new(TARGET_ID);
    controller.add_device(0, Box::new(HostServicesDevice::new())).unwrap();
    controller.add_device(2, Box::new(MemoryDisk::new(2, 16))).unwrap();
    let mut h = Harness::new(controller);

    let cdb = [0xa0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00];
    let (status, data) = h.command(INITIATOR_A, &cdb, 32);
    assert_eq!(status, 0x00);
    assert_eq!(data.len(), 24);

    let lun_list_length = u32::from_be_bytes(data[0..4].try_into().unwrap());
    assert_eq!(lun_list_length, 16);
    assert_eq!(data[9], 0);
    assert_eq!(data[17], 2);

    h.finish();
}

#[test]
fn unsupported_opcode_reports_invalid_command_operation_code() {
    let mut h = Harness::new(single_host_services_controller());

    let (status, _) = h.command(INITIATOR_A, &[0xff, 0x00, 0x00, 0x00, 0x00, 0x00], 0);
    assert_eq!(status, 0x02);

    let (status, sense) = h.request_sense(INITIATOR_A);
    assert_eq!(status, 0x00);
    assert_eq!(sense[2] & 0x0f, 0x05, "sense key ILLEGAL_REQUEST");
    assert_eq!(sense[12], 0x20, "asc INVALID_COMMAND_OPERATION_CODE");

    h.finish();
}

#[test]
fn reservation_conflict_blocks_a_second_initiator() {
    let mut h = Harness::new(single_host_services_controller());

    let (status, _) = h.command(INITIATOR_A, &[0x16, 0x00, 0x00, 0x00, 0x00, 0x00], 0);
    assert_eq!(status, 0x00, "RESERVE(6) from initiator A succeeds");

    let (status, _) = h.command(INITIATOR_B, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00], 0);
    assert_eq!(status, 0x18, "RESERVATION CONFLICT for initiator B's TEST UNIT READY");

    // REQUEST SENSE is on the always-allowed list and bypasses the
    // reservation check entirely, so it reports no pending sense at all.
    let (status, sense) = h.request_sense(INITIATOR_B);
    assert_eq!(status, 0x00);
    assert_eq!(sense[2] & 0x0f, 0x00, "sense key NO_SENSE");

    let (status, _) = h.command(INITIATOR_A, &[0x17, 0x00, 0x00, 0x00, 0x00, 0x00], 0);
    assert_eq!(status, 0x00, "RELEASE(6) from the reservation holder succeeds");

    let (status, _) = h.command(INITIATOR_B, &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00], 0);
    assert_eq!(status, 0x00, "TEST UNIT READY succeeds for anyone once released");

    h.finish();
}

#[test]
fn command_dispatcher_ignores_selection_for_a_different_target() {
    let mut controller_a = Controller::new(0);
    controller_a.add_device(0, Box::new(HostServicesDevice::new())).unwrap();
    let mut controller_b = Controller::new(3);
    controller_b.add_device(0, Box::new(HostServicesDevice::new())).unwrap();

    let mut set = TargetSet::new();
    set.attach(controller_a).unwrap();
    set.attach(controller_b).unwrap();

    let mut target_bus = LoopbackBus::new(true);
    let mut initiator_bus = target_bus.handle(false);

    let worker = thread::spawn(move || {
        target_bus.mark_target_ready();
        if let Some(c) = set.controller_mut(3) {
            c.schedule_shutdown(ShutdownMode::Shutdown);
        }
        while set.run_once(&mut target_bus) {}
    });

    assert!(initiator_bus.wait_for_target());

    initiator_bus.set_dat((1u8 << INITIATOR_A) | (1u8 << 3));
    initiator_bus.set_signal(Signal::Sel, true);
    assert!(initiator_bus.wait_handshake(Signal::Bsy, true));
    initiator_bus.set_signal(Signal::Sel, false);

    let start = Instant::now();
    loop {
        initiator_bus.acquire();
        if initiator_bus.get_phase() == Phase::Command {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }
    let sent = initiator_bus.initiator_send_handshake(&[0x12, 0x00, 0x00, 0x00, 36, 0x00]);
    assert_eq!(sent.count(), 6);

    initiator_bus.acquire();
    if initiator_bus.is_phase(Phase::DataIn) {
        let mut buf = [0u8; 36];
        initiator_bus.initiator_receive_handshake(&mut buf);
    }

    let start = Instant::now();
    loop {
        initiator_bus.acquire();
        if initiator_bus.get_phase() == Phase::Status {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }
    initiator_bus.initiator_byte_in().expect("STATUS byte");

    let start = Instant::now();
    loop {
        initiator_bus.acquire();
        if initiator_bus.get_phase() == Phase::MsgIn {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }
    initiator_bus.initiator_msg_in_handshake().expect("MESSAGE IN byte");

    worker.join().expect("worker thread panicked");
}

#[test]
fn memory_disk_persists_writes_across_connections() {
    let mut controller = Controller::new(TARGET_ID);
    controller.add_device(0, Box::new(MemoryDisk::new(0, 16))).unwrap();
    let mut h = Harness::new(controller);

    let cap_cdb = [0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let (status, data) = h.command(INITIATOR_A, &cap_cdb, 8);
    assert_eq!(status, 0x00);
    assert_eq!(u32::from_be_bytes(data[0..4].try_into().unwrap()), 15);

    // WRITE(6) one block at LBA 1, then READ(6) it back over a fresh
    // connection: the disk's state must outlive the connection it was
    // written on.
    let payload = vec![0xab; 512];
    let status = h.write(INITIATOR_A, &[0x0a, 0x00, 0x00, 0x01, 0x01, 0x00], &payload);
    assert_eq!(status, 0x00);

    let (status, data) = h.command(INITIATOR_A, &[0x08, 0x00, 0x00, 0x01, 0x01, 0x00], 512);
    assert_eq!(status, 0x00);
    assert_eq!(data, payload);

    h.finish();
}
