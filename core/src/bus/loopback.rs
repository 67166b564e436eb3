//! An in-process bus shared between an initiator thread and a target thread
//! in the same process — used by tests and the `cli` self-test mode in place
//! of real hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::trace;

use super::{Bus, Signal};

#[derive(Debug, Default)]
struct SignalState {
    bsy: bool,
    sel: bool,
    atn: bool,
    ack: bool,
    rst: bool,
    msg: bool,
    cd: bool,
    io: bool,
    req: bool,
    dat: u8,
}

impl SignalState {
    fn get(&self, signal: Signal) -> bool {
        match signal {
            Signal::Bsy => self.bsy,
            Signal::Sel => self.sel,
            Signal::Atn => self.atn,
            Signal::Ack => self.ack,
            Signal::Rst => self.rst,
            Signal::Msg => self.msg,
            Signal::Cd => self.cd,
            Signal::Io => self.io,
            Signal::Req => self.req,
        }
    }

    fn set(&mut self, signal: Signal, asserted: bool) {
        match signal {
            Signal::Bsy => self.bsy = asserted,
            Signal::Sel => self.sel = asserted,
            Signal::Atn => self.atn = asserted,
            Signal::Ack => self.ack = asserted,
            Signal::Rst => self.rst = asserted,
            Signal::Msg => self.msg = asserted,
            Signal::Cd => self.cd = asserted,
            Signal::Io => self.io = asserted,
            Signal::Req => self.req = asserted,
        }
    }
}

/// Shared state behind both ends of a [`LoopbackBus`] pair. The only
/// synchronization point is a mutex around signal writes, plus an atomic
/// flag the initiator polls to learn the target side is up.
struct Shared {
    signals: Mutex<SignalState>,
    target_enabled: AtomicBool,
}

/// One end (initiator or target) of an in-process loopback SCSI bus.
/// Cloning a handle (via `handle()`) gives the other side a view onto the
/// same shared signal state — there is deliberately no process-wide
/// singleton, so multiple independent buses can run side by side in tests.
pub struct LoopbackBus {
    shared: Arc<Shared>,
    snapshot: SignalState,
    target_mode: bool,
}

impl LoopbackBus {
    /// Creates a fresh bus pair; call `handle()` to get the other side.
    pub fn new(target_mode: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                signals: Mutex::new(SignalState::default()),
                target_enabled: AtomicBool::new(false),
            }),
            snapshot: SignalState::default(),
            target_mode,
        }
    }

    /// Returns a handle to the same underlying bus for the opposite role.
    pub fn handle(&self, target_mode: bool) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            snapshot: SignalState::default(),
            target_mode,
        }
    }

    /// Initiator-side readiness wait: blocks up to 1 s for the target side
    /// to call `mark_target_ready()`.
    pub fn wait_for_target(&self) -> bool {
        if self.target_mode {
            return true;
        }
        let start = Instant::now();
        loop {
            if self.shared.target_enabled.load(Ordering::Acquire) {
                return true;
            }
            if start.elapsed() >= Duration::from_secs(1) {
                return false;
            }
            std::hint::spin_loop();
        }
    }

    /// Signals that the target side is ready to accept selection.
    pub fn mark_target_ready(&self) {
        if self.target_mode {
            self.shared.target_enabled.store(true, Ordering::Release);
        }
    }
}

impl Bus for LoopbackBus {
    fn acquire(&mut self) {
        let guard = self.shared.signals.lock().unwrap();
        self.snapshot.bsy = guard.bsy;
        self.snapshot.sel = guard.sel;
        self.snapshot.atn = guard.atn;
        self.snapshot.ack = guard.ack;
        self.snapshot.rst = guard.rst;
        self.snapshot.msg = guard.msg;
        self.snapshot.cd = guard.cd;
        self.snapshot.io = guard.io;
        self.snapshot.req = guard.req;
        self.snapshot.dat = guard.dat;
    }

    fn get_signal(&self, signal: Signal) -> bool {
        self.snapshot.get(signal)
    }

    fn set_signal(&mut self, signal: Signal, asserted: bool) {
        if !matches!(signal, Signal::Ack | Signal::Req) {
            trace!("setting {signal:?} to {asserted}");
        }
        let mut guard = self.shared.signals.lock().unwrap();
        guard.set(signal, asserted);
        self.snapshot.set(signal, asserted);
    }

    fn get_dat(&self) -> u8 {
        self.snapshot.dat
    }

    fn set_dat(&mut self, value: u8) {
        let mut guard = self.shared.signals.lock().unwrap();
        guard.dat = value;
        self.snapshot.dat = value;
    }

    fn reset(&mut self) {
        trace!("resetting bus");
        let mut guard = self.shared.signals.lock().unwrap();
        *guard = SignalState::default();
        self.snapshot = SignalState::default();
    }

    fn wait_for_selection(&mut self) -> bool {
        // Busy waiting cannot be avoided without an OS-level wakeup source.
        super::busy_wait(Duration::from_millis(10));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signal_writes_are_visible_across_handles() {
        let mut target = LoopbackBus::new(true);
        let mut initiator = target.handle(false);

        target.set_signal(Signal::Bsy, true);
        initiator.acquire();
        assert!(initiator.get_signal(Signal::Bsy));
    }

    #[test]
    fn initiator_waits_for_target_ready() {
        let target = LoopbackBus::new(true);
        let initiator = target.handle(false);

        let handle = thread::spawn(move || initiator.wait_for_target());
        thread::sleep(Duration::from_millis(20));
        target.mark_target_ready();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn byte_handshake_round_trips_target_to_initiator() {
        let mut target = LoopbackBus::new(true);
        let mut initiator = target.handle(false);

        let handle = thread::spawn(move || {
            initiator.acquire();
            initiator.initiator_byte_in()
        });

        thread::sleep(Duration::from_millis(5));
        target.acquire();
        let outcome = target.target_byte_out(0x42);
        assert_eq!(outcome, super::super::HandshakeOutcome::Complete(1));

        assert_eq!(handle.join().unwrap(), Some(0x42));
    }
}
