//! A minimal SCHS (host services) logical unit: supports only the shared
//! PrimaryDevice command set. Used as the fixture device in the crate's own
//! end-to-end tests, standing in for scsi2pi's vendor-specific time/shutdown
//! commands, which are out of scope here.

use crate::device::{DeviceBase, DeviceType, LogicalUnit};

pub struct HostServicesDevice {
    base: DeviceBase,
}

impl HostServicesDevice {
    pub fn new() -> Self {
        let mut base = DeviceBase::new(DeviceType::Schs, 0);
        base.product_data.set("SCSI2Pi", "Host Services", "0100").unwrap();
        base.removable = false;
        Self { base }
    }
}

impl Default for HostServicesDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LogicalUnit for HostServicesDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DispatchContext;
    use crate::opcode;
    use crate::status::StatusCode;

    #[test]
    fn inquiry_reports_host_services_type_and_vendor() {
        let mut device = HostServicesDevice::new();
        let cdb = [0x12, 0x00, 0x00, 0x00, 0x24, 0x00];
        let attached = [0u8];
        let mut ctx = DispatchContext {
            cdb: &cdb,
            opcode: opcode::INQUIRY,
            initiator_id: Some(7),
            target_id: 0,
            attached_luns: &attached,
            data_in: None,
        };

        let status = device.dispatch(&mut ctx).unwrap();
        assert_eq!(status, StatusCode::Good);

        let data = ctx.data_in.unwrap();
        assert_eq!(data.len(), 36);
        assert_eq!(data[0], 0x03);
        assert_eq!(data[1] & 0x80, 0);
        assert_eq!(&data[8..16], b"SCSI2Pi ");
    }

    #[test]
    fn test_unit_ready_is_good_by_default() {
        let mut device = HostServicesDevice::new();
        let attached = [0u8];
        let mut ctx = DispatchContext {
            cdb: &[0, 0, 0, 0, 0, 0],
            opcode: opcode::TEST_UNIT_READY,
            initiator_id: Some(7),
            target_id: 0,
            attached_luns: &attached,
            data_in: None,
        };
        assert_eq!(device.dispatch(&mut ctx).unwrap(), StatusCode::Good);
    }
}
