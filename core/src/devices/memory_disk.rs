//! A minimal SCHD logical unit backed by a `Vec<u8>` in RAM. Exercises
//! READ/WRITE, write protection, and reservations end to end without needing
//! an actual image file on disk.

use crate::device::{DeviceBase, DeviceType, DispatchContext, LogicalUnit};
use crate::error::ScsiError;
use crate::opcode;
use crate::sense::{Asc, SenseKey};
use crate::status::StatusCode;

const BLOCK_SIZE: u32 = 512;

pub struct MemoryDisk {
    base: DeviceBase,
    blocks: Vec<u8>,
    num_blocks: u32,
}

impl MemoryDisk {
    pub fn new(lun: u8, num_blocks: u32) -> Self {
        let mut base = DeviceBase::new(DeviceType::Schd, lun);
        base.product_data.set("SCSI2Pi", "RAM Disk", "0100").unwrap();
        base.protectable = true;
        Self {
            base,
            blocks: vec![0u8; num_blocks as usize * BLOCK_SIZE as usize],
            num_blocks,
        }
    }

    fn lba_and_count(cdb: &[u8]) -> (u32, u32) {
        if cdb.len() <= 6 {
            let lba = (u32::from(cdb[1] & 0x1f) << 16) | (u32::from(cdb[2]) << 8) | u32::from(cdb[3]);
            let count = if cdb[4] == 0 { 256 } else { u32::from(cdb[4]) };
            (lba, count)
        } else {
            let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
            let count = u32::from_be_bytes([0, 0, cdb[7], cdb[8]]);
            (lba, count)
        }
    }

    fn check_range(&self, lba: u32, count: u32) -> Result<(usize, usize), ScsiError> {
        let end = lba as u64 + count as u64;
        if count == 0 || end > self.num_blocks as u64 {
            return Err(ScsiError::sense(SenseKey::IllegalRequest, Asc::LbaOutOfRange));
        }
        let start = lba as usize * BLOCK_SIZE as usize;
        let len = count as usize * BLOCK_SIZE as usize;
        Ok((start, len))
    }

    fn handle_read(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        self.base.check_ready()?;
        let (lba, count) = Self::lba_and_count(ctx.cdb);
        let (start, len) = self.check_range(lba, count)?;
        ctx.data_in = Some(self.blocks[start..start + len].to_vec());
        Ok(StatusCode::Good)
    }

    fn handle_read_capacity(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        self.base.check_ready()?;
        let last_lba = self.num_blocks.saturating_sub(1);
        let mut buf = vec![0u8; 8];
        buf[0..4].copy_from_slice(&last_lba.to_be_bytes());
        buf[4..8].copy_from_slice(&BLOCK_SIZE.to_be_bytes());
        ctx.data_in = Some(buf);
        Ok(StatusCode::Good)
    }

    fn handle_mode_sense(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        let header_len = if ctx.cdb.len() <= 6 { 4 } else { 8 };
        let mut buf = vec![0u8; header_len];
        if self.base.write_protected {
            buf[if header_len == 4 { 2 } else { 3 }] = 0x80;
        }
        ctx.data_in = Some(buf);
        Ok(StatusCode::Good)
    }
}

impl LogicalUnit for MemoryDisk {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn write_data(&mut self, cdb: &[u8], buf: &[u8], _offset: usize) -> Result<(), ScsiError> {
        self.base.check_ready()?;
        if self.base.write_protected {
            return Err(ScsiError::sense(SenseKey::DataProtect, Asc::WriteProtected));
        }
        let (lba, count) = Self::lba_and_count(cdb);
        let (start, len) = self.check_range(lba, count)?;
        let len = len.min(buf.len());
        self.blocks[start..start + len].copy_from_slice(&buf[..len]);
        Ok(())
    }

    fn mode_select(&mut self, _cdb: &[u8], buf: &[u8]) -> Result<(), ScsiError> {
        // Only the write-protect bit (byte 2 of a short-form mode page header,
        // matching `handle_mode_sense` above) is honored; anything else is ignored.
        if let Some(&byte) = buf.get(2) {
            self.base.set_write_protected(byte & 0x80 != 0);
        }
        Ok(())
    }

    fn flush_cache(&mut self) -> Result<(), ScsiError> {
        Ok(())
    }

    fn dispatch_extended(&mut self, ctx: &mut DispatchContext) -> Result<StatusCode, ScsiError> {
        match ctx.opcode {
            opcode::READ_6 | opcode::READ_10 => self.handle_read(ctx),
            opcode::WRITE_6 | opcode::WRITE_10 => {
                self.base.check_ready()?;
                Ok(StatusCode::Good)
            }
            opcode::READ_CAPACITY_10 => self.handle_read_capacity(ctx),
            opcode::MODE_SENSE_6 | opcode::MODE_SENSE_10 => self.handle_mode_sense(ctx),
            opcode::MODE_SELECT_6 | opcode::MODE_SELECT_10 => Ok(StatusCode::Good),
            opcode::START_STOP_UNIT => {
                if ctx.cdb.len() > 4 {
                    self.base.ready = ctx.cdb[4] & 0x01 != 0;
                }
                Ok(StatusCode::Good)
            }
            opcode::PREVENT_ALLOW_MEDIUM_REMOVAL | opcode::SEEK_6 | opcode::SEEK_10
            | opcode::SYNCHRONIZE_CACHE_10 | opcode::VERIFY_10 => Ok(StatusCode::Good),
            _ => Err(ScsiError::sense(
                SenseKey::IllegalRequest,
                Asc::InvalidCommandOperationCode,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DispatchContext;

    fn ctx<'a>(cdb: &'a [u8], opcode: u8, attached: &'a [u8]) -> DispatchContext<'a> {
        DispatchContext {
            cdb,
            opcode,
            initiator_id: Some(7),
            target_id: 0,
            attached_luns: attached,
            data_in: None,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut disk = MemoryDisk::new(0, 16);
        let attached = [0u8];

        let payload = vec![0xab; BLOCK_SIZE as usize];
        disk.write_data(&[0x0a, 0, 0, 0, 1, 0], &payload, 0).unwrap();

        let mut c = ctx(&[0x08, 0, 0, 0, 1, 0], opcode::READ_6, &attached);
        let status = disk.dispatch(&mut c).unwrap();
        assert_eq!(status, StatusCode::Good);
        assert_eq!(c.data_in.unwrap(), payload);
    }

    #[test]
    fn write_protected_rejects_writes() {
        let mut disk = MemoryDisk::new(0, 16);
        disk.base_mut().set_write_protected(true);
        let err = disk.write_data(&[0x0a, 0, 0, 0, 1, 0], &[0u8; BLOCK_SIZE as usize], 0);
        assert!(matches!(
            err,
            Err(ScsiError::Sense { key: SenseKey::DataProtect, .. })
        ));
    }

    #[test]
    fn read_out_of_range_is_sense_error() {
        let mut disk = MemoryDisk::new(0, 4);
        let attached = [0u8];
        let mut c = ctx(&[0x08, 0, 0, 0, 10, 0], opcode::READ_6, &attached);
        let err = disk.dispatch(&mut c).unwrap_err();
        assert!(matches!(
            err,
            ScsiError::Sense { key: SenseKey::IllegalRequest, asc: Asc::LbaOutOfRange, .. }
        ));
    }

    #[test]
    fn read_capacity_reports_last_lba_and_block_size() {
        let mut disk = MemoryDisk::new(0, 100);
        let attached = [0u8];
        let mut c = ctx(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], opcode::READ_CAPACITY_10, &attached);
        disk.dispatch(&mut c).unwrap();
        let data = c.data_in.unwrap();
        assert_eq!(u32::from_be_bytes(data[0..4].try_into().unwrap()), 99);
        assert_eq!(u32::from_be_bytes(data[4..8].try_into().unwrap()), BLOCK_SIZE);
    }
}
