//! Core identifier types of the redo stream.
//!
//! Every position in the pipeline is expressed with these newtypes:
//! [`Scn`] orders committed changes, [`Seq`] numbers redo log files
//! within an incarnation, [`FileOffset`] addresses a byte inside one
//! file and [`Xid`] identifies a transaction. [`Endian`] carries the
//! source database's byte order, which is a runtime property detected
//! from the file header rather than a compile-time choice.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::errors::ReplError;

/// Block number within a redo log file.
pub type BlockNumber = u32;

/// Resetlogs counter identifying a database incarnation.
pub type Resetlogs = u32;

/// Activation id distinguishing instances after failover.
pub type Activation = u32;

/// Sentinel for "no block count in header".
pub const ZERO_BLOCK: BlockNumber = 0xFFFF_FFFF;

/// System Change Number: a 64-bit monotonically non-decreasing token
/// ordering all committed changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scn(u64);

impl Scn {
    const NONE: u64 = u64::MAX;

    /// The reserved all-ones sentinel meaning "no SCN".
    pub const fn none() -> Self {
        Scn(Self::NONE)
    }

    pub const fn zero() -> Self {
        Scn(0)
    }

    pub const fn new(value: u64) -> Self {
        Scn(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE
    }

    /// Pre-12c rendering: `0xXXXX.XXXXXXXX` (16 + 32 bits).
    pub fn to_hex48(self) -> String {
        format!("0x{:04x}.{:08x}", (self.0 >> 32) & 0xFFFF, self.0 & 0xFFFF_FFFF)
    }

    /// Full 64-bit hex rendering used by 12.2+ dumps.
    pub fn to_hex64(self) -> String {
        format!("0x{:016x}", self.0)
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sub-SCN ordering records that share an SCN within an LWN batch.
pub type SubScn = u16;

/// Redo log sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(u32);

impl Seq {
    const NONE: u32 = u32::MAX;

    pub const fn none() -> Self {
        Seq(Self::NONE)
    }

    pub const fn zero() -> Self {
        Seq(0)
    }

    pub const fn new(value: u32) -> Self {
        Seq(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE
    }

    pub const fn next(self) -> Self {
        Seq(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier: (undo segment, slot, wrap) packed into 64
/// bits. Rendered the way Oracle prints it, `0xUSN.SLT.WRAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Xid {
    pub usn: u16,
    pub slot: u16,
    pub wrap: u32,
}

impl Xid {
    pub const fn new(usn: u16, slot: u16, wrap: u32) -> Self {
        Xid { usn, slot, wrap }
    }

    pub const fn zero() -> Self {
        Xid { usn: 0, slot: 0, wrap: 0 }
    }

    pub const fn is_zero(self) -> bool {
        self.usn == 0 && self.slot == 0 && self.wrap == 0
    }

    pub const fn to_u64(self) -> u64 {
        ((self.usn as u64) << 48) | ((self.slot as u64) << 32) | self.wrap as u64
    }

    pub const fn from_u64(raw: u64) -> Self {
        Xid {
            usn: (raw >> 48) as u16,
            slot: (raw >> 32) as u16,
            wrap: raw as u32,
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}.{:03x}.{:08x}", self.usn, self.slot, self.wrap)
    }
}

impl FromStr for Xid {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let mut parts = raw.split('.');
        let (usn, slot, wrap) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(u), Some(s), Some(w), None) => (u, s, w),
            _ => return Err(ReplError::bad_xid(s)),
        };
        let usn = u16::from_str_radix(usn, 16).map_err(|_| ReplError::bad_xid(s))?;
        let slot = u16::from_str_radix(slot, 16).map_err(|_| ReplError::bad_xid(s))?;
        let wrap = u32::from_str_radix(wrap, 16).map_err(|_| ReplError::bad_xid(s))?;
        Ok(Xid { usn, slot, wrap })
    }
}

impl Serialize for Xid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Xid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Byte position within a redo log file. Valid positions are always a
/// multiple of the file's block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileOffset(u64);

impl FileOffset {
    pub const fn zero() -> Self {
        FileOffset(0)
    }

    pub const fn new(value: u64) -> Self {
        FileOffset(value)
    }

    pub const fn from_block(block: BlockNumber, block_size: u32) -> Self {
        FileOffset(block as u64 * block_size as u64)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn block(self, block_size: u32) -> BlockNumber {
        (self.0 / block_size as u64) as BlockNumber
    }

    pub const fn is_block_aligned(self, block_size: u32) -> bool {
        self.0 % block_size as u64 == 0
    }
}

impl fmt::Display for FileOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte order of the source database, detected from bytes 28-31 of
/// redo block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => u16::from_le_bytes([buf[0], buf[1]]),
            Endian::Big => u16::from_be_bytes([buf[0], buf[1]]),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            Endian::Big => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        }
    }

    pub fn read_u64(self, buf: &[u8]) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[..8]);
        match self {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        }
    }

    pub fn write_u16(self, buf: &mut [u8], val: u16) {
        let b = match self {
            Endian::Little => val.to_le_bytes(),
            Endian::Big => val.to_be_bytes(),
        };
        buf[..2].copy_from_slice(&b);
    }

    pub fn write_u32(self, buf: &mut [u8], val: u32) {
        let b = match self {
            Endian::Little => val.to_le_bytes(),
            Endian::Big => val.to_be_bytes(),
        };
        buf[..4].copy_from_slice(&b);
    }

    pub fn write_u64(self, buf: &mut [u8], val: u64) {
        let b = match self {
            Endian::Little => val.to_le_bytes(),
            Endian::Big => val.to_be_bytes(),
        };
        buf[..8].copy_from_slice(&b);
    }

    /// Decode an on-disk SCN. The compact form is 6 bytes (48 bits);
    /// when the high bit of the wrap word is set the field extends to
    /// 8 bytes carrying the upper 16 bits in the trailing pair.
    /// All-ones in the first 6 bytes means [`Scn::none`].
    pub fn read_scn(self, buf: &[u8]) -> Scn {
        if buf[..6] == [0xFF; 6] {
            return Scn::none();
        }
        match self {
            Endian::Little => {
                let base = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
                if buf[5] & 0x80 != 0 {
                    let ext = u16::from_le_bytes([buf[6], buf[7]]) as u64;
                    let wrap = (u16::from_le_bytes([buf[4], buf[5]]) & 0x7FFF) as u64;
                    Scn::new(base | (ext << 32) | (wrap << 48))
                } else {
                    let wrap = u16::from_le_bytes([buf[4], buf[5]]) as u64;
                    Scn::new(base | (wrap << 32))
                }
            }
            Endian::Big => {
                let base = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
                if buf[4] & 0x80 != 0 {
                    let ext = u16::from_be_bytes([buf[6], buf[7]]) as u64;
                    let wrap = (u16::from_be_bytes([buf[4], buf[5]]) & 0x7FFF) as u64;
                    Scn::new(base | (ext << 32) | (wrap << 48))
                } else {
                    let wrap = u16::from_be_bytes([buf[4], buf[5]]) as u64;
                    Scn::new(base | (wrap << 32))
                }
            }
        }
    }

    /// Encode an SCN into its on-disk form, inverse of [`read_scn`].
    ///
    /// [`read_scn`]: Endian::read_scn
    pub fn write_scn(self, buf: &mut [u8], scn: Scn) {
        if scn.is_none() {
            buf[..6].copy_from_slice(&[0xFF; 6]);
            return;
        }
        let v = scn.value();
        let base = (v & 0xFFFF_FFFF) as u32;
        if v < 0x0000_8000_0000_0000 {
            let wrap = ((v >> 32) & 0xFFFF) as u16;
            match self {
                Endian::Little => {
                    buf[..4].copy_from_slice(&base.to_le_bytes());
                    buf[4..6].copy_from_slice(&wrap.to_le_bytes());
                }
                Endian::Big => {
                    buf[..4].copy_from_slice(&base.to_be_bytes());
                    buf[4..6].copy_from_slice(&wrap.to_be_bytes());
                }
            }
        } else {
            let wrap = (((v >> 48) & 0x7FFF) | 0x8000) as u16;
            let ext = ((v >> 32) & 0xFFFF) as u16;
            match self {
                Endian::Little => {
                    buf[..4].copy_from_slice(&base.to_le_bytes());
                    buf[4..6].copy_from_slice(&wrap.to_le_bytes());
                    buf[6..8].copy_from_slice(&ext.to_le_bytes());
                }
                Endian::Big => {
                    buf[..4].copy_from_slice(&base.to_be_bytes());
                    buf[4..6].copy_from_slice(&wrap.to_be_bytes());
                    buf[6..8].copy_from_slice(&ext.to_be_bytes());
                }
            }
        }
    }
}
