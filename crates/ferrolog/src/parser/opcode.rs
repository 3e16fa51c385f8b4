//! Redo vector decoding.
//!
//! Every physical change inside a redo record is a vector keyed by a
//! two-byte opcode (`major.minor`). Decoding is a tagged dispatch over
//! that discriminant; the shared KDO and supplemental preambles are
//! free functions used by the arms that need them.
//!
//! Vector layout:
//!
//! ```text
//! [u8 major][u8 minor][u16 flags]
//! [u32 obj][u32 data_obj][u32 bdba]
//! [u16 slot][u16 field_cnt][u32 pad][u64 xid]
//! [u16 field sizes ... pad4][field bytes, each pad4]
//! ```
//!
//! A field size of 0xFFFF marks a NULL column; no bytes follow for it.

use crate::common::errors::{ReplError, Result};
use crate::common::types::{Endian, Xid};

/// Vector header length.
pub const VECTOR_HEADER: usize = 32;

/// NULL marker in the field-size table.
pub const FIELD_NULL: u16 = 0xFFFF;

/// Upper bound on fields per vector.
pub const FIELD_MAX: usize = 256;

/// Vector header flag: this vector begins its transaction.
pub const FLG_BEGIN_TRANS: u16 = 0x0008;
/// Vector header flag: 5.4 terminates with rollback instead of commit.
pub const FLG_ROLLBACK: u16 = 0x0004;
/// Vector header flag: KDO op-seq suppression (adaptive-schema path).
pub const FLG_KDO_NOREDO_OP_SEQ: u16 = 0x8000;

/// Two-byte opcodes this pipeline materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// 5.1 - undo record (before-image carrier).
    Undo,
    /// 5.2 - transaction begin.
    Begin,
    /// 5.4 - commit / rollback.
    Commit,
    /// 5.6 - partial rollback (rollback to savepoint).
    PartialRollback,
    /// 5.11 - session attributes.
    SessionAttributes,
    /// 10.x - index operation, tracked for LOB bookkeeping only.
    Index(u8),
    /// 11.2 - insert single row.
    Insert,
    /// 11.3 - delete row.
    Delete,
    /// 11.4 - lock row, no data change.
    Lock,
    /// 11.5 - update row.
    Update,
    /// 11.11 - insert multiple rows.
    MultiInsert,
    /// 11.x others - traced, not materialized.
    HeapOther(u8),
    /// 13.x / 18.x / 19.x - LOB, XML and direct-load markers.
    LobMarker(u8, u8),
    /// 24.1 - DDL statement.
    Ddl,
    /// Anything else - traced only.
    Other(u8, u8),
}

impl OpCode {
    pub fn from_bytes(major: u8, minor: u8) -> OpCode {
        match (major, minor) {
            (5, 1) => OpCode::Undo,
            (5, 2) => OpCode::Begin,
            (5, 4) => OpCode::Commit,
            (5, 6) => OpCode::PartialRollback,
            (5, 11) => OpCode::SessionAttributes,
            (10, minor) => OpCode::Index(minor),
            (11, 2) => OpCode::Insert,
            (11, 3) => OpCode::Delete,
            (11, 4) => OpCode::Lock,
            (11, 5) => OpCode::Update,
            (11, 11) => OpCode::MultiInsert,
            (11, minor) => OpCode::HeapOther(minor),
            (13 | 18 | 19, minor) => OpCode::LobMarker(major, minor),
            (24, 1) => OpCode::Ddl,
            (major, minor) => OpCode::Other(major, minor),
        }
    }

    pub fn to_u16(self) -> u16 {
        let (major, minor) = match self {
            OpCode::Undo => (5, 1),
            OpCode::Begin => (5, 2),
            OpCode::Commit => (5, 4),
            OpCode::PartialRollback => (5, 6),
            OpCode::SessionAttributes => (5, 11),
            OpCode::Index(minor) => (10, minor),
            OpCode::Insert => (11, 2),
            OpCode::Delete => (11, 3),
            OpCode::Lock => (11, 4),
            OpCode::Update => (11, 5),
            OpCode::MultiInsert => (11, 11),
            OpCode::HeapOther(minor) => (11, minor),
            OpCode::LobMarker(major, minor) => (major, minor),
            OpCode::Ddl => (24, 1),
            OpCode::Other(major, minor) => (major, minor),
        };
        ((major as u16) << 8) | minor as u16
    }

    /// Heap DML that produces row events.
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            OpCode::Insert | OpCode::Delete | OpCode::Update | OpCode::MultiInsert | OpCode::Lock
        )
    }
}

/// One decoded vector borrowing its raw bytes.
#[derive(Debug)]
pub struct Vector<'a> {
    pub op: OpCode,
    pub flags: u16,
    pub obj: u32,
    pub data_obj: u32,
    pub bdba: u32,
    pub slot: u16,
    pub xid: Xid,
    /// `None` marks a NULL field.
    pub fields: Vec<Option<&'a [u8]>>,
    /// Total encoded length including header and field area.
    pub encoded_len: usize,
    pub raw: &'a [u8],
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// Decode one vector at the start of `bytes`.
pub fn decode_vector(bytes: &[u8], endian: Endian) -> Result<Vector<'_>> {
    if bytes.len() < VECTOR_HEADER {
        return Err(ReplError::data(
            20010,
            format!("vector truncated: {} bytes", bytes.len()),
        ));
    }
    let major = bytes[0];
    let minor = bytes[1];
    let flags = endian.read_u16(&bytes[2..]);
    let obj = endian.read_u32(&bytes[4..]);
    let data_obj = endian.read_u32(&bytes[8..]);
    let bdba = endian.read_u32(&bytes[12..]);
    let slot = endian.read_u16(&bytes[16..]);
    let field_cnt = endian.read_u16(&bytes[18..]) as usize;
    let xid = Xid::from_u64(endian.read_u64(&bytes[24..]));

    if field_cnt > FIELD_MAX {
        return Err(ReplError::data(20010, format!("vector field count: {field_cnt}")));
    }
    let table_len = pad4(field_cnt * 2);
    if bytes.len() < VECTOR_HEADER + table_len {
        return Err(ReplError::data(20010, "vector field table truncated".to_string()));
    }

    let mut fields = Vec::with_capacity(field_cnt);
    let mut pos = VECTOR_HEADER + table_len;
    for i in 0..field_cnt {
        let size = endian.read_u16(&bytes[VECTOR_HEADER + i * 2..]);
        if size == FIELD_NULL {
            fields.push(None);
            continue;
        }
        let size = size as usize;
        if pos + size > bytes.len() {
            return Err(ReplError::data(
                20010,
                format!("vector field {i} of size {size} exceeds record"),
            ));
        }
        fields.push(Some(&bytes[pos..pos + size]));
        pos += pad4(size);
    }

    Ok(Vector {
        op: OpCode::from_bytes(major, minor),
        flags,
        obj,
        data_obj,
        bdba,
        slot,
        xid,
        fields,
        encoded_len: pos,
        raw: &bytes[..pos.min(bytes.len())],
    })
}

/// Iterate all vectors in a record body.
pub fn decode_vectors(mut bytes: &[u8], endian: Endian) -> Result<Vec<Vector<'_>>> {
    let mut vectors = Vec::new();
    while bytes.len() >= VECTOR_HEADER && bytes[0] != 0 {
        let consumed = {
            let vector = decode_vector(bytes, endian)?;
            let consumed = vector.encoded_len;
            vectors.push(vector);
            consumed
        };
        bytes = &bytes[consumed..];
    }
    Ok(vectors)
}

// --- shared preambles ----------------------------------------------------

/// KDO preamble of a heap DML vector (field 0): column count or row
/// count, and the row flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdoHeader {
    pub cc: u16,
    pub nrow: u16,
    pub fb: u8,
}

pub fn kdo_header(vector: &Vector<'_>, endian: Endian) -> Result<KdoHeader> {
    let field = vector
        .fields
        .first()
        .copied()
        .flatten()
        .ok_or_else(|| ReplError::data(20010, format!("missing KDO header in {:?}", vector.op)))?;
    if field.len() < 6 {
        return Err(ReplError::data(20010, format!("short KDO header in {:?}", vector.op)));
    }
    Ok(KdoHeader {
        cc: endian.read_u16(field),
        nrow: endian.read_u16(&field[2..]),
        fb: field[4],
    })
}

/// Supplemental preamble of a 5.1 undo vector (field 0): column count
/// of the before-image that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuppHeader {
    pub cc: u16,
}

pub fn supp_header(vector: &Vector<'_>, endian: Endian) -> Result<SuppHeader> {
    let field = vector
        .fields
        .first()
        .copied()
        .flatten()
        .ok_or_else(|| ReplError::data(20010, "missing supplemental header".to_string()))?;
    if field.len() < 2 {
        return Err(ReplError::data(20010, "short supplemental header".to_string()));
    }
    Ok(SuppHeader { cc: endian.read_u16(field) })
}

/// Column-number list (field 1 of update and undo vectors).
pub fn column_numbers(vector: &Vector<'_>, count: usize, endian: Endian) -> Result<Vec<u16>> {
    let field = vector
        .fields
        .get(1)
        .copied()
        .flatten()
        .ok_or_else(|| ReplError::data(20010, "missing column-number list".to_string()))?;
    if field.len() < count * 2 {
        return Err(ReplError::data(20010, "short column-number list".to_string()));
    }
    Ok((0..count).map(|i| endian.read_u16(&field[i * 2..])).collect())
}

/// Commit flavor of a 5.4 vector.
pub fn is_rollback_commit(vector: &Vector<'_>) -> bool {
    vector.flags & FLG_ROLLBACK != 0
}

/// Target (bdba, slot) of a 5.6 partial rollback.
pub fn rollback_target(vector: &Vector<'_>, endian: Endian) -> Result<(u32, u16)> {
    let field = vector
        .fields
        .first()
        .copied()
        .flatten()
        .ok_or_else(|| ReplError::data(20010, "missing rollback target".to_string()))?;
    if field.len() < 6 {
        return Err(ReplError::data(20010, "short rollback target".to_string()));
    }
    Ok((endian.read_u32(field), endian.read_u16(&field[4..])))
}

/// (name, value) pairs of a 5.11 session-attribute vector.
pub fn session_attributes(vector: &Vector<'_>) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let mut iter = vector.fields.iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        if let (Some(name), Some(value)) = (name, value) {
            attributes.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            ));
        }
    }
    attributes
}

/// DDL statement text of a 24.1 vector.
pub fn ddl_text(vector: &Vector<'_>) -> Option<String> {
    vector
        .fields
        .first()
        .copied()
        .flatten()
        .map(|f| String::from_utf8_lossy(f).into_owned())
}

// --- encoding (copy path and fixtures) -----------------------------------

/// Assemble a vector from its parts, inverse of [`decode_vector`].
pub struct VectorBuilder {
    pub op: OpCode,
    pub flags: u16,
    pub obj: u32,
    pub data_obj: u32,
    pub bdba: u32,
    pub slot: u16,
    pub xid: Xid,
    pub fields: Vec<Option<Vec<u8>>>,
}

impl VectorBuilder {
    pub fn new(op: OpCode, xid: Xid) -> VectorBuilder {
        VectorBuilder {
            op,
            flags: 0,
            obj: 0,
            data_obj: 0,
            bdba: 0,
            slot: 0,
            xid,
            fields: Vec::new(),
        }
    }

    pub fn encode(&self, endian: Endian) -> Vec<u8> {
        let table_len = pad4(self.fields.len() * 2);
        let mut out = vec![0u8; VECTOR_HEADER + table_len];
        let op = self.op.to_u16();
        out[0] = (op >> 8) as u8;
        out[1] = op as u8;
        endian.write_u16(&mut out[2..], self.flags);
        endian.write_u32(&mut out[4..], self.obj);
        endian.write_u32(&mut out[8..], self.data_obj);
        endian.write_u32(&mut out[12..], self.bdba);
        endian.write_u16(&mut out[16..], self.slot);
        endian.write_u16(&mut out[18..], self.fields.len() as u16);
        endian.write_u64(&mut out[24..], self.xid.to_u64());
        for (i, field) in self.fields.iter().enumerate() {
            let size = match field {
                Some(bytes) => bytes.len() as u16,
                None => FIELD_NULL,
            };
            endian.write_u16(&mut out[VECTOR_HEADER + i * 2..], size);
        }
        for field in self.fields.iter().flatten() {
            let start = out.len();
            out.resize(start + pad4(field.len()), 0);
            out[start..start + field.len()].copy_from_slice(field);
        }
        out
    }
}
