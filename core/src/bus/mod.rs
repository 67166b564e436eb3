//! The SCSI bus abstraction: signal lines, phase computation, and the
//! REQ/ACK handshake primitives built on top of them.
//!
//! Two implementations are provided: [`loopback::LoopbackBus`], a
//! same-process bus shared between an initiator and a target thread (used by
//! tests and the `cli` self-test mode), and, behind the `hardware` feature,
//! a `rppal`-backed GPIO bus for real Raspberry Pi hardware.

pub mod loopback;

#[cfg(feature = "hardware")]
pub mod gpio;

use std::time::{Duration, Instant};

use crate::opcode;

/// One SCSI control or data line. `Dat` is the 8-bit data bus, handled
/// separately via `get_dat`/`set_dat` since it isn't a boolean signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Bsy,
    Sel,
    Atn,
    Ack,
    Rst,
    Msg,
    Cd,
    Io,
    Req,
}

/// The bus phase, derived from BSY/SEL/MSG/C-D/I-O as observed at the last
/// `acquire()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BusFree,
    Arbitration,
    Selection,
    Reselection,
    Command,
    DataIn,
    DataOut,
    Status,
    MsgIn,
    MsgOut,
    Reserved,
}

/// Upper bound on how long a handshake primitive will busy-wait for a
/// REQ/ACK transition before giving up.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Minimum delay SCSI requires between asserting REQ and sampling DAT.
pub const BUS_SETTLE_DELAY: Duration = Duration::from_nanos(400);

/// Outcome of a handshake primitive: how many bytes were actually
/// transferred, or why the loop ended early. Kept as a named enum rather
/// than the original's "negative count" convention since it reads better in
/// Rust and avoids a magic sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Complete(usize),
    Timeout,
    BusReset,
}

impl HandshakeOutcome {
    pub const fn count(self) -> usize {
        match self {
            Self::Complete(n) => n,
            _ => 0,
        }
    }

    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Timeout | Self::BusReset)
    }
}

/// The capability set consumed by the controller and provided by each bus
/// backend. Signal accessors use positive logic in-process even though the
/// physical wire is negative logic; implementations invert at the edge.
pub trait Bus {
    /// Refresh the cached signal snapshot. All getters in this step observe
    /// this snapshot, so phase computation never blocks.
    fn acquire(&mut self);

    fn get_signal(&self, signal: Signal) -> bool;
    fn set_signal(&mut self, signal: Signal, asserted: bool);

    fn get_dat(&self) -> u8;
    fn set_dat(&mut self, value: u8);

    /// Restores direction bits for the bus's target/initiator role and
    /// clears the cached signal snapshot.
    fn reset(&mut self);

    /// Blocks (target side) until this target's SCSI ID is selected, or
    /// returns promptly if RST is observed. Busy waiting is unavoidable on
    /// physical hardware without an edge-triggered GPIO interrupt.
    fn wait_for_selection(&mut self) -> bool;

    /// Polls `signal` until it reaches `asserted`, [`HANDSHAKE_TIMEOUT`]
    /// elapses, or RST is observed.
    fn wait_handshake(&mut self, signal: Signal, asserted: bool) -> bool {
        let start = Instant::now();
        loop {
            self.acquire();
            if self.get_signal(Signal::Rst) {
                return false;
            }
            if self.get_signal(signal) == asserted {
                return true;
            }
            if start.elapsed() >= HANDSHAKE_TIMEOUT {
                return false;
            }
        }
    }

    fn get_phase(&self) -> Phase {
        compute_phase(
            self.get_signal(Signal::Bsy),
            self.get_signal(Signal::Sel),
            self.get_signal(Signal::Msg),
            self.get_signal(Signal::Cd),
            self.get_signal(Signal::Io),
        )
    }

    fn is_phase(&self, phase: Phase) -> bool {
        self.get_phase() == phase
    }

    /// Target reads one CDB during the COMMAND phase. Transparently strips a
    /// leading Atari ICD `$1F` prefix byte and re-reads the real opcode.
    fn target_command_handshake(&mut self, buf: &mut [u8; 16]) -> HandshakeOutcome {
        let mut len = match self.target_byte_in(&mut buf[0]) {
            HandshakeOutcome::Complete(n) => n,
            other => return other,
        };

        if buf[0] == opcode::ICD_PREFIX {
            match self.target_byte_in(&mut buf[0]) {
                HandshakeOutcome::Complete(n) => len = n,
                other => return other,
            }
        }

        let cdb_len = opcode::lookup(buf[0]).cdb_len as usize;
        for byte in buf.iter_mut().take(cdb_len).skip(1) {
            match self.target_byte_in(byte) {
                HandshakeOutcome::Complete(n) => len += n,
                other => return other,
            }
        }

        HandshakeOutcome::Complete(len)
    }

    /// Target reads `buf.len()` bytes during DATA OUT or MSG OUT.
    fn target_receive_handshake(&mut self, buf: &mut [u8]) -> HandshakeOutcome {
        let mut n = 0;
        for byte in buf.iter_mut() {
            match self.target_byte_in(byte) {
                HandshakeOutcome::Complete(_) => n += 1,
                other => return other,
            }
        }
        HandshakeOutcome::Complete(n)
    }

    /// Target writes `buf` during DATA IN, STATUS, or MSG IN. `delay_after_bytes`,
    /// when nonzero, inserts a short pause after that many bytes — a single
    /// quirky driver's workaround, otherwise unused.
    fn target_send_handshake(&mut self, buf: &[u8], delay_after_bytes: usize) -> HandshakeOutcome {
        let mut n = 0;
        for (i, byte) in buf.iter().enumerate() {
            match self.target_byte_out(*byte) {
                HandshakeOutcome::Complete(_) => n += 1,
                other => return other,
            }
            if delay_after_bytes != 0 && i + 1 == delay_after_bytes {
                busy_wait(Duration::from_nanos(100));
            }
        }
        HandshakeOutcome::Complete(n)
    }

    /// Initiator reads one MSG IN byte; asserts ATN if it isn't COMMAND
    /// COMPLETE (0x00), requesting a MESSAGE OUT rejection cycle.
    fn initiator_msg_in_handshake(&mut self) -> Option<u8> {
        let byte = self.initiator_byte_in()?;
        if byte != 0x00 {
            self.set_signal(Signal::Atn, true);
        }
        Some(byte)
    }

    fn initiator_receive_handshake(&mut self, buf: &mut [u8]) -> HandshakeOutcome {
        let mut n = 0;
        for byte in buf.iter_mut() {
            if !self.is_phase(Phase::DataIn) && !self.is_phase(Phase::MsgIn) {
                return HandshakeOutcome::Complete(n);
            }
            match self.initiator_byte_in() {
                Some(b) => {
                    *byte = b;
                    n += 1;
                }
                None => return HandshakeOutcome::Timeout,
            }
        }
        HandshakeOutcome::Complete(n)
    }

    fn initiator_send_handshake(&mut self, buf: &[u8]) -> HandshakeOutcome {
        let mut n = 0;
        for (i, byte) in buf.iter().enumerate() {
            if !self.initiator_byte_out(*byte) {
                return HandshakeOutcome::Timeout;
            }
            n += 1;
            // Deassert ATN on the last MESSAGE OUT byte.
            if i + 1 == buf.len() {
                self.set_signal(Signal::Atn, false);
            }
        }
        HandshakeOutcome::Complete(n)
    }

    /// One target-side REQ/ACK cycle reading a byte (DATA OUT/MSG OUT/COMMAND).
    fn target_byte_in(&mut self, out: &mut u8) -> HandshakeOutcome {
        self.set_signal(Signal::Req, true);
        if !self.wait_handshake(Signal::Ack, true) {
            self.set_signal(Signal::Req, false);
            return if self.get_signal(Signal::Rst) {
                HandshakeOutcome::BusReset
            } else {
                HandshakeOutcome::Timeout
            };
        }
        busy_wait(BUS_SETTLE_DELAY);
        *out = self.get_dat();
        self.set_signal(Signal::Req, false);
        if !self.wait_handshake(Signal::Ack, false) {
            return if self.get_signal(Signal::Rst) {
                HandshakeOutcome::BusReset
            } else {
                HandshakeOutcome::Timeout
            };
        }
        HandshakeOutcome::Complete(1)
    }

    /// One target-side REQ/ACK cycle writing a byte (DATA IN/STATUS/MSG IN).
    fn target_byte_out(&mut self, value: u8) -> HandshakeOutcome {
        self.set_dat(value);
        busy_wait(BUS_SETTLE_DELAY);
        self.set_signal(Signal::Req, true);
        if !self.wait_handshake(Signal::Ack, true) {
            self.set_signal(Signal::Req, false);
            return if self.get_signal(Signal::Rst) {
                HandshakeOutcome::BusReset
            } else {
                HandshakeOutcome::Timeout
            };
        }
        self.set_signal(Signal::Req, false);
        if !self.wait_handshake(Signal::Ack, false) {
            return if self.get_signal(Signal::Rst) {
                HandshakeOutcome::BusReset
            } else {
                HandshakeOutcome::Timeout
            };
        }
        HandshakeOutcome::Complete(1)
    }

    /// One initiator-side REQ/ACK cycle reading a byte.
    fn initiator_byte_in(&mut self) -> Option<u8> {
        if !self.wait_handshake(Signal::Req, true) {
            return None;
        }
        busy_wait(BUS_SETTLE_DELAY);
        let byte = self.get_dat();
        self.set_signal(Signal::Ack, true);
        if !self.wait_handshake(Signal::Req, false) {
            self.set_signal(Signal::Ack, false);
            return None;
        }
        self.set_signal(Signal::Ack, false);
        Some(byte)
    }

    /// One initiator-side REQ/ACK cycle writing a byte.
    fn initiator_byte_out(&mut self, value: u8) -> bool {
        if !self.wait_handshake(Signal::Req, true) {
            return false;
        }
        self.set_dat(value);
        self.set_signal(Signal::Ack, true);
        if !self.wait_handshake(Signal::Req, false) {
            self.set_signal(Signal::Ack, false);
            return false;
        }
        self.set_signal(Signal::Ack, false);
        true
    }
}

fn compute_phase(bsy: bool, sel: bool, msg: bool, cd: bool, io: bool) -> Phase {
    if !bsy && !sel {
        return Phase::BusFree;
    }
    if sel {
        return Phase::Selection;
    }
    match (msg, cd, io) {
        (false, false, false) => Phase::MsgIn,
        (false, false, true) => Phase::Status,
        (false, true, true) => Phase::DataIn,
        (true, false, false) => Phase::MsgOut,
        (true, false, true) => Phase::Command,
        (true, true, true) => Phase::DataOut,
        _ => Phase::Reserved,
    }
}

/// A busy wait against a monotonic clock; `nanosleep`-style sleeping is not
/// acceptable here because it requires interrupts, which are disabled for
/// the duration of a handshake.
pub(crate) fn busy_wait(d: Duration) {
    let start = Instant::now();
    while start.elapsed() < d {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_free_when_bsy_and_sel_clear() {
        assert_eq!(compute_phase(false, false, false, false, false), Phase::BusFree);
        assert_eq!(compute_phase(false, false, true, true, true), Phase::BusFree);
    }

    #[test]
    fn selection_when_sel_asserted() {
        assert_eq!(compute_phase(true, true, false, false, false), Phase::Selection);
    }

    #[test]
    fn data_and_message_phases() {
        assert_eq!(compute_phase(true, false, false, false, false), Phase::MsgIn);
        assert_eq!(compute_phase(true, false, false, false, true), Phase::Status);
        assert_eq!(compute_phase(true, false, false, true, true), Phase::DataIn);
        assert_eq!(compute_phase(true, false, true, false, false), Phase::MsgOut);
        assert_eq!(compute_phase(true, false, true, false, true), Phase::Command);
        assert_eq!(compute_phase(true, false, true, true, true), Phase::DataOut);
    }

    #[test]
    fn reserved_combination() {
        assert_eq!(compute_phase(true, false, false, true, false), Phase::Reserved);
        assert_eq!(compute_phase(true, false, true, true, false), Phase::Reserved);
    }
}
