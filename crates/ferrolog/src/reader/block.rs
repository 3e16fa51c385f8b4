//! Redo block and file header validation.
//!
//! A redo log file is an ordered run of fixed-size blocks (512, 1024
//! or 4096 bytes). Block 0 identifies the block size and byte order,
//! block 1 is the file header with sequence, SCN range, resetlogs,
//! activation and the compatibility version; every later block starts
//! with a 16-byte header carrying its block number, the file sequence
//! and a checksum over the whole block.

use crate::common::errors::{ReplError, Result};
use crate::common::types::{Activation, BlockNumber, Endian, Resetlogs, Scn, Seq};

/// Valid block sizes, auto-detected from block 0.
pub const BLOCK_SIZES: [u32; 3] = [512, 1024, 4096];

/// Byte 1 marker for 512 and 1024 byte blocks.
pub const TYPE_MARKER_SMALL: u8 = 0x22;
/// Byte 1 marker for 4096 byte blocks.
pub const TYPE_MARKER_LARGE: u8 = 0x82;

/// Offset of the record area within a data block.
pub const BLOCK_HEADER_SIZE: u32 = 16;

/// Outcome of a single block validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCheck {
    Ok,
    /// All-zero header: the online log has not reached this block yet.
    Empty,
    /// Header sequence above the attached one (online log rotated
    /// under us before we finished).
    Overwritten,
    BadChecksum,
    BadBlockNumber,
    BadSequence,
    BadData,
}

/// Expected byte-1 marker for a block size.
pub fn type_marker(block_size: u32) -> u8 {
    if block_size == 4096 {
        TYPE_MARKER_LARGE
    } else {
        TYPE_MARKER_SMALL
    }
}

/// XOR checksum over the block taken in 8-byte words, folded to 16
/// bits. The stored field (bytes 14-15) is excluded.
pub fn checksum(block: &[u8]) -> u16 {
    let mut sum = 0u64;
    for (i, word) in block.chunks_exact(8).enumerate() {
        let mut bytes: [u8; 8] = word.try_into().expect("8-byte word");
        if i == 1 {
            bytes[6] = 0;
            bytes[7] = 0;
        }
        sum ^= u64::from_le_bytes(bytes);
    }
    sum ^= sum >> 32;
    sum ^= sum >> 16;
    sum as u16
}

/// Parameters the per-block check validates against.
#[derive(Debug, Clone, Copy)]
pub struct BlockExpectation {
    pub block_size: u32,
    pub endian: Endian,
    pub sequence: Seq,
    /// Online and standby readers tolerate sequence drift (rotation),
    /// group 0 readers do not.
    pub group: i64,
    pub verify_checksum: bool,
}

/// Validate one data block header.
pub fn check_block(block: &[u8], number: BlockNumber, exp: &BlockExpectation) -> BlockCheck {
    if block[0] == 0 && block[1] == 0 {
        return BlockCheck::Empty;
    }
    if block[1] != type_marker(exp.block_size) {
        return BlockCheck::BadData;
    }

    let header_number = exp.endian.read_u32(&block[4..]);
    let header_sequence = Seq::new(exp.endian.read_u32(&block[8..]));

    if header_sequence != exp.sequence {
        if exp.group == 0 {
            return BlockCheck::BadSequence;
        }
        if header_sequence < exp.sequence {
            return BlockCheck::Empty;
        }
        return BlockCheck::Overwritten;
    }

    if header_number != number {
        return BlockCheck::BadBlockNumber;
    }

    if exp.verify_checksum {
        let stored = exp.endian.read_u16(&block[14..]);
        if stored != checksum(block) {
            return BlockCheck::BadChecksum;
        }
    }

    BlockCheck::Ok
}

/// Everything the file header (blocks 0 and 1) tells us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoHeader {
    pub block_size: u32,
    pub endian: Endian,
    pub compat_version: u32,
    pub version_str: String,
    pub sid: String,
    pub sequence: Seq,
    pub activation: Activation,
    pub resetlogs: Resetlogs,
    /// Block count recorded in the header, ZERO_BLOCK when absent.
    pub num_blocks: BlockNumber,
    pub first_scn: Scn,
    pub first_time: u32,
    pub next_scn: Scn,
    pub next_time: u32,
}

/// Oracle compatibility versions this decoder accepts.
pub fn version_allowed(vsn: u32) -> bool {
    matches!(vsn,
        0x0B20_0000..=0x0B20_0400      // 11.2.0.0 - 11.2.0.4
        | 0x0C10_0000..=0x0C10_0200    // 12.1.0.0 - 12.1.0.2
        | 0x0C20_0000..=0x0C20_0100    // 12.2.0.0 - 12.2.0.1
        | 0x1200_0000..=0x120E_0000    // 18.0.0.0 - 18.14.0.0
        | 0x1300_0000..=0x1312_0000    // 19.0.0.0 - 19.18.0.0
        | 0x1500_0000..=0x1508_0000    // 21.0.0.0 - 21.8.0.0
        | 0x1700_0000..=0x1703_0000    // 23.0.0.0 - 23.3.0.0
    )
}

fn version_string(vsn: u32) -> String {
    if vsn < 0x1200_0000 {
        format!("{}.{}.{}.{}", vsn >> 24, (vsn >> 20) & 0xF, (vsn >> 16) & 0xF, (vsn >> 8) & 0xFF)
    } else {
        format!("{}.{}.{}", vsn >> 24, (vsn >> 16) & 0xFF, (vsn >> 8) & 0xFF)
    }
}

/// Detect byte order from bytes 28-31 of block 0.
pub fn detect_endian(block0: &[u8], file: &str) -> Result<Endian> {
    match block0[28..32] {
        [0x7D, 0x7C, 0x7B, 0x7A] => Ok(Endian::Little),
        [0x7A, 0x7B, 0x7C, 0x7D] => Ok(Endian::Big),
        _ => Err(ReplError::redo(
            40004,
            format!(
                "file: {file} - invalid header[28-31]: {}, {}, {}, {}",
                block0[28], block0[29], block0[30], block0[31]
            ),
        )),
    }
}

/// Parse blocks 0 and 1. `block1` must span a full block of the size
/// block 0 announces.
pub fn parse_header(block0: &[u8], block1: &[u8], file: &str) -> Result<Option<RedoHeader>> {
    if block0[0] != 0 {
        return Err(ReplError::redo(
            40003,
            format!("file: {file} - invalid header[0]: {}", block0[0]),
        ));
    }
    let endian = detect_endian(block0, file)?;

    let block_size = endian.read_u32(&block0[20..]);
    if !BLOCK_SIZES.contains(&block_size) || block0[1] != type_marker(block_size) {
        return Err(ReplError::redo(
            40005,
            format!("file: {file} - invalid block size: {block_size}, header[1]: {}", block0[1]),
        ));
    }

    let compat_version = endian.read_u32(&block1[20..]);
    if compat_version == 0 {
        // Freshly formatted online log: nothing written yet.
        return Ok(None);
    }
    if !version_allowed(compat_version) {
        return Err(ReplError::redo(
            40006,
            format!("file: {file} - invalid database version: {compat_version}"),
        ));
    }

    let sid_bytes = &block1[28..36];
    let sid = sid_bytes
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect::<String>();

    Ok(Some(RedoHeader {
        block_size,
        endian,
        compat_version,
        version_str: version_string(compat_version),
        sid,
        sequence: Seq::new(endian.read_u32(&block1[8..])),
        activation: endian.read_u32(&block1[52..]),
        resetlogs: endian.read_u32(&block1[160..]),
        num_blocks: endian.read_u32(&block1[156..]),
        first_scn: endian.read_scn(&block1[180..]),
        first_time: endian.read_u32(&block1[188..]),
        next_scn: endian.read_scn(&block1[192..]),
        next_time: endian.read_u32(&block1[200..]),
    }))
}

/// Fill in a data block header (used by the copy path and tests).
pub fn write_block_header(
    block: &mut [u8],
    block_size: u32,
    endian: Endian,
    number: BlockNumber,
    sequence: Seq,
) {
    block[0] = 0x01;
    block[1] = type_marker(block_size);
    endian.write_u32(&mut block[4..], number);
    endian.write_u32(&mut block[8..], sequence.value());
}

/// Stamp the checksum of a finished block.
pub fn seal_block(block: &mut [u8], endian: Endian) {
    let sum = checksum(block);
    endian.write_u16(&mut block[14..], sum);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_block(endian: Endian, number: BlockNumber, seq: Seq) -> Vec<u8> {
        let mut block = vec![0u8; 512];
        write_block_header(&mut block, 512, endian, number, seq);
        block[100] = 0x42;
        seal_block(&mut block, endian);
        block
    }

    fn expectation(endian: Endian) -> BlockExpectation {
        BlockExpectation {
            block_size: 512,
            endian,
            sequence: Seq::new(7),
            group: 0,
            verify_checksum: true,
        }
    }

    #[test]
    fn valid_block_passes() {
        for endian in [Endian::Little, Endian::Big] {
            let block = sealed_block(endian, 5, Seq::new(7));
            assert_eq!(check_block(&block, 5, &expectation(endian)), BlockCheck::Ok);
        }
    }

    #[test]
    fn corruption_fails_checksum() {
        let mut block = sealed_block(Endian::Little, 5, Seq::new(7));
        block[200] ^= 0xFF;
        assert_eq!(check_block(&block, 5, &expectation(Endian::Little)), BlockCheck::BadChecksum);
    }

    #[test]
    fn checksum_can_be_disabled() {
        let mut block = sealed_block(Endian::Little, 5, Seq::new(7));
        block[200] ^= 0xFF;
        let mut exp = expectation(Endian::Little);
        exp.verify_checksum = false;
        assert_eq!(check_block(&block, 5, &exp), BlockCheck::Ok);
    }

    #[test]
    fn zero_header_is_empty() {
        let block = vec![0u8; 512];
        assert_eq!(check_block(&block, 5, &expectation(Endian::Little)), BlockCheck::Empty);
    }

    #[test]
    fn block_number_mismatch() {
        let block = sealed_block(Endian::Little, 5, Seq::new(7));
        assert_eq!(
            check_block(&block, 6, &expectation(Endian::Little)),
            BlockCheck::BadBlockNumber
        );
    }

    #[test]
    fn sequence_drift_for_online_groups() {
        let block = sealed_block(Endian::Little, 5, Seq::new(9));
        let mut exp = expectation(Endian::Little);
        assert_eq!(check_block(&block, 5, &exp), BlockCheck::BadSequence);

        exp.group = 1;
        // Newer sequence in the header: the log was rotated away.
        assert_eq!(check_block(&block, 5, &exp), BlockCheck::Overwritten);

        exp.sequence = Seq::new(12);
        // Older sequence: not yet overwritten by the current one.
        assert_eq!(check_block(&block, 5, &exp), BlockCheck::Empty);
    }

    #[test]
    fn version_allow_list() {
        assert!(version_allowed(0x0B20_0300)); // 11.2.0.3
        assert!(version_allowed(0x1312_0000)); // 19.18
        assert!(version_allowed(0x1508_0000)); // 21.8
        assert!(!version_allowed(0x0A20_0000)); // 10.2
        assert!(!version_allowed(0x1313_0000)); // 19.19
        assert!(!version_allowed(0x1800_0000));
    }

    #[test]
    fn version_strings() {
        assert_eq!(version_string(0x0B20_0400), "11.2.0.4");
        assert_eq!(version_string(0x1312_0000), "19.18.0");
        assert_eq!(version_string(0x1500_0000), "21.0.0");
    }

    #[test]
    fn endian_markers() {
        let mut block0 = vec![0u8; 512];
        block0[28..32].copy_from_slice(&[0x7D, 0x7C, 0x7B, 0x7A]);
        assert_eq!(detect_endian(&block0, "x").unwrap(), Endian::Little);
        block0[28..32].copy_from_slice(&[0x7A, 0x7B, 0x7C, 0x7D]);
        assert_eq!(detect_endian(&block0, "x").unwrap(), Endian::Big);
        block0[28..32].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(detect_endian(&block0, "x").unwrap_err().code(), 40004);
    }

    #[test]
    fn header_parse_rejects_bad_sizes() {
        let mut block0 = vec![0u8; 512];
        block0[1] = TYPE_MARKER_SMALL;
        block0[28..32].copy_from_slice(&[0x7D, 0x7C, 0x7B, 0x7A]);
        Endian::Little.write_u32(&mut block0[20..], 2048);
        let block1 = vec![0u8; 512];
        assert_eq!(parse_header(&block0, &block1, "x").unwrap_err().code(), 40005);
    }
}
