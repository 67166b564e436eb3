//! Concrete logical-unit personalities built on [`crate::device::DeviceBase`].
//! These are minimal fixtures: enough to exercise the command set end to
//! end, not a full emulation of any particular piece of hardware.

pub mod host_services;
pub mod memory_disk;
