//! The dispatcher owning the shared bus and routing each connection to the
//! controller whose target ID is set in the initiator's selection bitmap,
//! giving it the bus until it returns to BUS FREE.

use log::trace;

use crate::bus::{Bus, Signal};
use crate::controller::{Controller, ShutdownMode};

/// Up to eight controllers sharing one [`Bus`]. Exactly one drives the bus
/// per connection; there is no preemption and no locking beyond what the bus
/// implementation itself provides.
pub struct TargetSet {
    controllers: Vec<Controller>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self { controllers: Vec::new() }
    }

    /// Attaches a controller at its own target ID, rejecting a duplicate ID
    /// or an eighth controller (SCSI target IDs 0..7 on a parallel bus).
    pub fn attach(&mut self, controller: Controller) -> Result<(), String> {
        if self.controllers.len() >= 8 {
            return Err("a target set serves at most 8 controllers".to_string());
        }
        if self.controllers.iter().any(|c| c.target_id() == controller.target_id()) {
            return Err(format!("target ID {} is already attached", controller.target_id()));
        }
        self.controllers.push(controller);
        Ok(())
    }

    pub fn target_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.controllers.iter().map(Controller::target_id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn controller_mut(&mut self, target_id: u8) -> Option<&mut Controller> {
        self.controllers.iter_mut().find(|c| c.target_id() == target_id)
    }

    /// Waits for one SELECTION to appear on the bus, hands the connection to
    /// the matching controller, and returns once it has returned to BUS
    /// FREE. Returns `false` once a controller has scheduled shutdown.
    ///
    /// A selection bitmap naming no attached target ID is ignored: on real
    /// hardware that's another target on a shared bus being selected, not an
    /// error here.
    pub fn run_once(&mut self, bus: &mut dyn Bus) -> bool {
        bus.acquire();
        if bus.get_signal(Signal::Rst) {
            trace!("bus reset observed, resetting all attached controllers");
            for controller in &mut self.controllers {
                controller.reset(bus);
            }
            return true;
        }
        if !bus.get_signal(Signal::Sel) {
            bus.wait_for_selection();
            bus.acquire();
            if !bus.get_signal(Signal::Sel) || bus.get_signal(Signal::Bsy) {
                return true;
            }
        }

        let mask = u32::from(bus.get_dat());
        let Some(index) = self
            .controllers
            .iter()
            .position(|c| mask & (1 << c.target_id()) != 0)
        else {
            return true;
        };

        trace!(
            "selection mask {mask:#010b} routed to target {}",
            self.controllers[index].target_id()
        );
        self.controllers[index].process_on_controller(bus, mask) == ShutdownMode::None
    }

    /// Drives connections until a controller schedules shutdown.
    pub fn run(&mut self, bus: &mut dyn Bus) {
        while self.run_once(bus) {}
    }
}

impl Default for TargetSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::host_services::HostServicesDevice;

    fn controller(target_id: u8) -> Controller {
        let mut controller = Controller::new(target_id);
        controller.add_device(0, Box::new(HostServicesDevice::new())).unwrap();
        controller
    }

    #[test]
    fn rejects_duplicate_target_id() {
        let mut set = TargetSet::new();
        set.attach(controller(0)).unwrap();
        assert!(set.attach(controller(0)).is_err());
    }

    #[test]
    fn rejects_ninth_controller() {
        let mut set = TargetSet::new();
        for id in 0..8 {
            set.attach(controller(id)).unwrap();
        }
        assert!(set.attach(controller(8)).is_err());
    }

    #[test]
    fn target_ids_sorted() {
        let mut set = TargetSet::new();
        set.attach(controller(3)).unwrap();
        set.attach(controller(1)).unwrap();
        assert_eq!(set.target_ids(), vec![1, 3]);
    }

    #[test]
    fn controller_mut_finds_attached_target() {
        let mut set = TargetSet::new();
        set.attach(controller(5)).unwrap();
        assert!(set.controller_mut(5).is_some());
        assert!(set.controller_mut(6).is_none());
    }

    #[test]
    fn bus_reset_marks_all_attached_devices_reset() {
        use crate::bus::loopback::LoopbackBus;

        let mut set = TargetSet::new();
        set.attach(controller(0)).unwrap();
        set.attach(controller(1)).unwrap();

        let mut bus = LoopbackBus::new(true);
        bus.set_signal(Signal::Rst, true);
        assert!(set.run_once(&mut bus));

        for id in [0, 1] {
            let c = set.controller_mut(id).unwrap();
            assert!(c.lun_mut(0).unwrap().base().reset);
        }
        bus.acquire();
        assert!(!bus.get_signal(Signal::Rst));
    }
}
