//! SCSI opcode metadata: CDB length, allocation-length and block-field
//! offsets, and transfer direction. The single source of truth for CDB
//! parsing used by both the controller and device dispatch.

/// Metadata describing one opcode's CDB shape.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub name: &'static str,
    pub cdb_len: u8,
    /// Offset of the allocation-length field within the CDB; a negative
    /// value (stored as `None` with `fixed_length`) means "fixed response
    /// length, no CDB field".
    pub allocation_length_offset: Option<u8>,
    pub allocation_length_size: u8,
    /// Fixed response length, used when `allocation_length_offset` is `None`.
    pub fixed_length: u32,
    pub block_offset: u8,
    pub block_size: u8,
    pub has_data_out: bool,
    /// Whether the allocation-length field is a block *count* that must be
    /// multiplied by the device's logical block size to get a byte length
    /// (READ/WRITE family), as opposed to a direct byte count (MODE SELECT).
    pub transfer_is_blocks: bool,
}

macro_rules! op {
    ($name:literal, $len:literal, alloc = $off:literal .. $sz:literal, block = $boff:literal .. $bsz:literal, out = $out:literal) => {
        OpcodeInfo {
            name: $name,
            cdb_len: $len,
            allocation_length_offset: Some($off),
            allocation_length_size: $sz,
            fixed_length: 0,
            block_offset: $boff,
            block_size: $bsz,
            has_data_out: $out,
            transfer_is_blocks: false,
        }
    };
    ($name:literal, $len:literal, fixed = $fixed:literal) => {
        OpcodeInfo {
            name: $name,
            cdb_len: $len,
            allocation_length_offset: None,
            allocation_length_size: 0,
            fixed_length: $fixed,
            block_offset: 0,
            block_size: 0,
            has_data_out: false,
            transfer_is_blocks: false,
        }
    };
    ($name:literal, $len:literal) => {
        OpcodeInfo {
            name: $name,
            cdb_len: $len,
            allocation_length_offset: None,
            allocation_length_size: 0,
            fixed_length: 0,
            block_offset: 0,
            block_size: 0,
            has_data_out: false,
            transfer_is_blocks: false,
        }
    };
}

pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const FORMAT_UNIT: u8 = 0x04;
pub const READ_6: u8 = 0x08;
pub const WRITE_6: u8 = 0x0a;
pub const SEEK_6: u8 = 0x0b;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SELECT_6: u8 = 0x15;
pub const RESERVE_6: u8 = 0x16;
pub const RELEASE_6: u8 = 0x17;
pub const MODE_SENSE_6: u8 = 0x1a;
pub const START_STOP_UNIT: u8 = 0x1b;
pub const SEND_DIAGNOSTIC: u8 = 0x1d;
pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
pub const ICD_PREFIX: u8 = 0x1f;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;
pub const SEEK_10: u8 = 0x2b;
pub const VERIFY_10: u8 = 0x2f;
pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
pub const MODE_SELECT_10: u8 = 0x55;
pub const MODE_SENSE_10: u8 = 0x5a;
pub const REPORT_LUNS: u8 = 0xa0;
pub const READ_16: u8 = 0x88;
pub const WRITE_16: u8 = 0x8a;

/// Looks up the metadata for `opcode`, falling back to the SCSI-2 CDB length
/// convention when the opcode has no explicit table entry: 0x00-0x1f are
/// 6-byte, 0x20-0x7f are 10-byte, 0x80-0x9f are 16-byte, 0xa0-0xbf are
/// 12-byte commands.
pub fn lookup(opcode: u8) -> OpcodeInfo {
    match opcode {
        TEST_UNIT_READY => op!("TEST UNIT READY", 6),
        REQUEST_SENSE => op!("REQUEST SENSE", 6, alloc = 4..1, block = 0..0, out = false),
        FORMAT_UNIT => OpcodeInfo {
            has_data_out: true,
            ..op!("FORMAT UNIT", 6)
        },
        READ_6 => op!("READ(6)", 6, alloc = 4..1, block = 1..3, out = false),
        WRITE_6 => OpcodeInfo {
            transfer_is_blocks: true,
            ..op!("WRITE(6)", 6, alloc = 4..1, block = 1..3, out = true)
        },
        SEEK_6 => op!("SEEK(6)", 6),
        INQUIRY => op!("INQUIRY", 6, alloc = 4..1, block = 0..0, out = false),
        MODE_SELECT_6 => OpcodeInfo {
            has_data_out: true,
            ..op!("MODE SELECT(6)", 6, alloc = 4..1, block = 0..0, out = true)
        },
        RESERVE_6 => op!("RESERVE(6)", 6),
        RELEASE_6 => op!("RELEASE(6)", 6),
        MODE_SENSE_6 => op!("MODE SENSE(6)", 6, alloc = 4..1, block = 0..0, out = false),
        START_STOP_UNIT => op!("START STOP UNIT", 6),
        SEND_DIAGNOSTIC => op!("SEND DIAGNOSTIC", 6, fixed = 0),
        PREVENT_ALLOW_MEDIUM_REMOVAL => op!("PREVENT ALLOW MEDIUM REMOVAL", 6),
        READ_CAPACITY_10 => op!("READ CAPACITY(10)", 10, fixed = 8),
        READ_10 => op!("READ(10)", 10, alloc = 7..2, block = 2..4, out = false),
        WRITE_10 => OpcodeInfo {
            transfer_is_blocks: true,
            ..op!("WRITE(10)", 10, alloc = 7..2, block = 2..4, out = true)
        },
        SEEK_10 => op!("SEEK(10)", 10),
        VERIFY_10 => op!("VERIFY(10)", 10),
        SYNCHRONIZE_CACHE_10 => op!("SYNCHRONIZE CACHE(10)", 10),
        MODE_SELECT_10 => OpcodeInfo {
            has_data_out: true,
            ..op!("MODE SELECT(10)", 10, alloc = 7..2, block = 0..0, out = true)
        },
        MODE_SENSE_10 => op!("MODE SENSE(10)", 10, alloc = 7..2, block = 0..0, out = false),
        READ_16 => op!("READ(16)", 16, alloc = 10..4, block = 2..8, out = false),
        WRITE_16 => OpcodeInfo {
            transfer_is_blocks: true,
            ..op!("WRITE(16)", 16, alloc = 10..4, block = 2..8, out = true)
        },
        REPORT_LUNS => op!("REPORT LUNS", 12, alloc = 6..4, block = 0..0, out = false),
        _ => OpcodeInfo {
            name: "UNKNOWN",
            cdb_len: default_cdb_len(opcode),
            allocation_length_offset: None,
            allocation_length_size: 0,
            fixed_length: 0,
            block_offset: 0,
            block_size: 0,
            has_data_out: false,
            transfer_is_blocks: false,
        },
    }
}

const fn default_cdb_len(opcode: u8) -> u8 {
    match opcode {
        0x00..=0x1f => 6,
        0x20..=0x7f => 10,
        0x80..=0x9f => 16,
        _ => 12,
    }
}
