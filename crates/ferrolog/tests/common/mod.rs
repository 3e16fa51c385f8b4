//! Shared test support: a synthetic redo encoder producing files the
//! reader and parser accept (valid headers, checksums, LWN batches,
//! vectors), plus a capturing builder for end-to-end assertions.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use ferrolog::builder::{Builder, EmitContext};
use ferrolog::common::errors::Result;
use ferrolog::common::types::{Endian, FileOffset, Scn, Seq, Xid};
use ferrolog::metadata::schema::{col_type, DbColumn, DbTable};
use ferrolog::reader::block::seal_block;
use ferrolog::parser::opcode::{OpCode, VectorBuilder, FLG_BEGIN_TRANS, FLG_ROLLBACK};
use ferrolog::parser::row::encode_number;
use ferrolog::parser::RowImage;

pub const COMPAT_19_18: u32 = 0x1312_0000;

/// One LWN batch: all records commit atomically for ordering.
pub struct Batch {
    pub scn: u64,
    pub timestamp: u32,
    pub records: Vec<Vec<u8>>,
}

/// Builder for a complete synthetic redo log file.
pub struct RedoFile {
    pub endian: Endian,
    pub block_size: u32,
    pub seq: u32,
    pub first_scn: u64,
    pub next_scn: Option<u64>,
    pub resetlogs: u32,
    pub activation: u32,
    pub batches: Vec<Batch>,
}

impl RedoFile {
    pub fn new(seq: u32, first_scn: u64) -> RedoFile {
        RedoFile {
            endian: Endian::Little,
            block_size: 512,
            seq,
            first_scn,
            next_scn: None,
            resetlogs: 900,
            activation: 0x0BAD_CAFE,
            batches: Vec::new(),
        }
    }

    pub fn batch(mut self, scn: u64, records: Vec<Vec<u8>>) -> RedoFile {
        self.batches.push(Batch { scn, timestamp: 1_700_000_000, records });
        self
    }

    pub fn write(&self, path: &Path) {
        std::fs::write(path, self.build()).unwrap();
    }

    pub fn build(&self) -> Vec<u8> {
        let bs = self.block_size as usize;
        let endian = self.endian;

        // Data blocks, record area from offset 16. Each batch starts a
        // fresh block with the 68-byte LWN header record.
        let mut blocks: Vec<Vec<u8>> = Vec::new();
        for batch in &self.batches {
            let batch_start = blocks.len();
            let mut block = vec![0u8; bs];
            let mut offset = 16usize;

            // LWN header record: size 68, vld bit 0x04.
            endian.write_u32(&mut block[offset..], 68);
            block[offset + 4] = 0x05;
            endian.write_u16(&mut block[offset + 6..], (batch.scn >> 32) as u16);
            endian.write_u32(&mut block[offset + 8..], batch.scn as u32);
            endian.write_u16(&mut block[offset + 12..], 0);
            endian.write_u16(&mut block[offset + 24..], 1); // chunk number
            endian.write_u16(&mut block[offset + 26..], 1); // chunk max
            // size in blocks patched below
            endian.write_scn(&mut block[offset + 40..], Scn::new(batch.scn));
            endian.write_u32(&mut block[offset + 64..], batch.timestamp);
            offset += 68;

            for record in &batch.records {
                // A record never starts in the final header's worth of
                // a block.
                if offset + 24 >= bs {
                    blocks.push(block);
                    block = vec![0u8; bs];
                    offset = 16;
                }
                let mut written = 0usize;
                while written < record.len() {
                    if offset == bs {
                        blocks.push(block);
                        block = vec![0u8; bs];
                        offset = 16;
                    }
                    let space = bs - offset;
                    let take = space.min(record.len() - written);
                    block[offset..offset + take]
                        .copy_from_slice(&record[written..written + take]);
                    offset += take;
                    written += take;
                }
            }
            blocks.push(block);

            let batch_blocks = (blocks.len() - batch_start) as u32;
            endian.write_u32(&mut blocks[batch_start][16 + 28..], batch_blocks);
        }

        let total_blocks = blocks.len() as u32 + 2;
        let mut out = vec![0u8; 2 * bs];

        // Block 0: format block.
        out[1] = if self.block_size == 4096 { 0x82 } else { 0x22 };
        endian.write_u32(&mut out[20..], self.block_size);
        match endian {
            Endian::Little => out[28..32].copy_from_slice(&[0x7D, 0x7C, 0x7B, 0x7A]),
            Endian::Big => out[28..32].copy_from_slice(&[0x7A, 0x7B, 0x7C, 0x7D]),
        }

        // Block 1: file header.
        {
            let header = &mut out[bs..2 * bs];
            header[0] = 0x01;
            header[1] = if self.block_size == 4096 { 0x82 } else { 0x22 };
            endian.write_u32(&mut header[4..], 1);
            endian.write_u32(&mut header[8..], self.seq);
            endian.write_u32(&mut header[20..], COMPAT_19_18);
            header[28..32].copy_from_slice(b"ORCL");
            endian.write_u32(&mut header[52..], self.activation);
            endian.write_u32(&mut header[156..], total_blocks);
            endian.write_u32(&mut header[160..], self.resetlogs);
            endian.write_scn(&mut header[180..], Scn::new(self.first_scn));
            endian.write_u32(&mut header[188..], 1_700_000_000);
            match self.next_scn {
                Some(scn) => endian.write_scn(&mut header[192..], Scn::new(scn)),
                None => endian.write_scn(&mut header[192..], Scn::none()),
            }
            endian.write_u32(&mut header[200..], 1_700_000_100);
            seal_block(header, endian);
        }

        for (i, block) in blocks.iter().enumerate() {
            let mut block = block.clone();
            block[0] = 0x01;
            block[1] = if self.block_size == 4096 { 0x82 } else { 0x22 };
            endian.write_u32(&mut block[4..], i as u32 + 2);
            endian.write_u32(&mut block[8..], self.seq);
            seal_block(&mut block, endian);
            out.extend_from_slice(&block);
        }
        out
    }
}

/// Wrap vectors into one redo record.
pub fn record(endian: Endian, scn: u64, sub_scn: u16, vectors: &[Vec<u8>]) -> Vec<u8> {
    let body_len: usize = vectors.iter().map(Vec::len).sum();
    let size4 = (24 + body_len + 3) & !3;
    let mut out = vec![0u8; size4];
    endian.write_u32(&mut out, size4 as u32);
    out[4] = 0x01;
    endian.write_u16(&mut out[6..], (scn >> 32) as u16);
    endian.write_u32(&mut out[8..], scn as u32);
    endian.write_u16(&mut out[12..], sub_scn);
    let mut pos = 24;
    for vector in vectors {
        out[pos..pos + vector.len()].copy_from_slice(vector);
        pos += vector.len();
    }
    out
}

// --- vector helpers ------------------------------------------------------

pub fn begin_vec(endian: Endian, xid: Xid) -> Vec<u8> {
    let mut builder = VectorBuilder::new(OpCode::Begin, xid);
    builder.flags = FLG_BEGIN_TRANS;
    builder.encode(endian)
}

pub fn commit_vec(endian: Endian, xid: Xid, rollback: bool) -> Vec<u8> {
    let mut builder = VectorBuilder::new(OpCode::Commit, xid);
    if rollback {
        builder.flags = FLG_ROLLBACK;
    }
    builder.encode(endian)
}

fn kdo(endian: Endian, cc: u16, nrow: u16, fb: u8) -> Vec<u8> {
    let mut field = vec![0u8; 6];
    endian.write_u16(&mut field, cc);
    endian.write_u16(&mut field[2..], nrow);
    field[4] = fb;
    field
}

/// Insert of a full row; `values[i]` is column `i + 1`.
pub fn insert_vec(
    endian: Endian,
    xid: Xid,
    obj: u32,
    bdba: u32,
    slot: u16,
    values: Vec<Option<Vec<u8>>>,
) -> Vec<u8> {
    let mut builder = VectorBuilder::new(OpCode::Insert, xid);
    builder.obj = obj;
    builder.data_obj = obj;
    builder.bdba = bdba;
    builder.slot = slot;
    let cc = values.len() as u16;
    builder.fields = std::iter::once(Some(kdo(endian, cc, 1, 0x2C)))
        .chain(values)
        .collect();
    builder.encode(endian)
}

/// Update of selected columns, after-image only.
pub fn update_vec(
    endian: Endian,
    xid: Xid,
    obj: u32,
    bdba: u32,
    slot: u16,
    cols: &[u16],
    values: Vec<Option<Vec<u8>>>,
) -> Vec<u8> {
    let mut builder = VectorBuilder::new(OpCode::Update, xid);
    builder.obj = obj;
    builder.data_obj = obj;
    builder.bdba = bdba;
    builder.slot = slot;
    let mut col_field = vec![0u8; cols.len() * 2];
    for (i, col) in cols.iter().enumerate() {
        endian.write_u16(&mut col_field[i * 2..], *col);
    }
    builder.fields = std::iter::once(Some(kdo(endian, cols.len() as u16, 1, 0)))
        .chain(std::iter::once(Some(col_field)))
        .chain(values)
        .collect();
    builder.encode(endian)
}

/// Delete; the before-image travels in the paired undo vector.
pub fn delete_vec(endian: Endian, xid: Xid, obj: u32, bdba: u32, slot: u16) -> Vec<u8> {
    let mut builder = VectorBuilder::new(OpCode::Delete, xid);
    builder.obj = obj;
    builder.data_obj = obj;
    builder.bdba = bdba;
    builder.slot = slot;
    builder.fields = vec![Some(kdo(endian, 0, 1, 0x2C))];
    builder.encode(endian)
}

/// Supplemental undo carrying before-images of `cols`.
pub fn undo_vec(
    endian: Endian,
    xid: Xid,
    obj: u32,
    cols: &[u16],
    values: Vec<Option<Vec<u8>>>,
) -> Vec<u8> {
    let mut builder = VectorBuilder::new(OpCode::Undo, xid);
    builder.obj = obj;
    builder.data_obj = obj;
    let mut supp = vec![0u8; 2];
    endian.write_u16(&mut supp, cols.len() as u16);
    let mut col_field = vec![0u8; cols.len() * 2];
    for (i, col) in cols.iter().enumerate() {
        endian.write_u16(&mut col_field[i * 2..], *col);
    }
    builder.fields = std::iter::once(Some(supp))
        .chain(std::iter::once(Some(col_field)))
        .chain(values)
        .collect();
    builder.encode(endian)
}

pub fn partial_rollback_vec(endian: Endian, xid: Xid, bdba: u32, slot: u16) -> Vec<u8> {
    let mut builder = VectorBuilder::new(OpCode::PartialRollback, xid);
    let mut target = vec![0u8; 6];
    endian.write_u32(&mut target, bdba);
    endian.write_u16(&mut target[4..], slot);
    builder.fields = vec![Some(target)];
    builder.encode(endian)
}

pub fn number(text: &str) -> Option<Vec<u8>> {
    Some(encode_number(text).unwrap())
}

pub fn varchar(text: &str) -> Option<Vec<u8>> {
    Some(text.as_bytes().to_vec())
}

// --- schema --------------------------------------------------------------

pub const EMP_OBJ: u32 = 5001;

pub fn emp_table() -> DbTable {
    DbTable {
        obj: EMP_OBJ,
        data_obj: EMP_OBJ,
        owner: "SCOTT".to_string(),
        name: "EMP".to_string(),
        columns: vec![
            DbColumn {
                col_no: 1,
                name: "ID".to_string(),
                typ: col_type::NUMBER,
                length: 22,
                precision: Some(10),
                scale: Some(0),
                nullable: false,
                charset_id: 0,
            },
            DbColumn {
                col_no: 2,
                name: "NAME".to_string(),
                typ: col_type::VARCHAR2,
                length: 10,
                precision: None,
                scale: None,
                nullable: true,
                charset_id: 873,
            },
        ],
        lobs: Vec::new(),
        pk: vec![1],
        tag_cols: Vec::new(),
        partitions: Vec::new(),
    }
}

// --- capturing builder ---------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Begin { scn: u64, xid: Xid },
    Dml { op: char, scn: u64, idx: u64, table: String, before: Value, after: Value },
    Ddl { scn: u64, sql: String },
    Commit { scn: u64 },
    Checkpoint { scn: u64, seq: u32, offset: u64, switch_redo: bool },
}

#[derive(Clone, Default)]
pub struct Capture {
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl Capture {
    pub fn new() -> Capture {
        Capture::default()
    }

    pub fn dml_events(&self) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Dml { .. }))
            .cloned()
            .collect()
    }

    pub fn emitted_tuples(&self) -> Vec<(u64, u64)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Dml { scn, idx, .. } => Some((*scn, *idx)),
                _ => None,
            })
            .collect()
    }

    pub fn checkpoints(&self) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Checkpoint { .. }))
            .cloned()
            .collect()
    }
}

pub struct CaptureBuilder {
    capture: Capture,
}

impl CaptureBuilder {
    pub fn new(capture: Capture) -> CaptureBuilder {
        CaptureBuilder { capture }
    }

    fn columns(table: &DbTable, values: &[(u16, Value)]) -> Value {
        let mut object = serde_json::Map::new();
        for (col_no, value) in values {
            let name = table
                .column(*col_no)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| format!("COL_{col_no}"));
            object.insert(name, value.clone());
        }
        Value::Object(object)
    }

    fn push_dml(&mut self, op: char, ctx: &EmitContext, table: &DbTable, row: &RowImage) {
        self.capture.events.lock().push(Event::Dml {
            op,
            scn: ctx.scn.value(),
            idx: ctx.idx,
            table: table.full_name(),
            before: Self::columns(table, &row.before),
            after: Self::columns(table, &row.after),
        });
    }
}

impl Builder for CaptureBuilder {
    fn process_begin(
        &mut self,
        scn: Scn,
        _timestamp: i64,
        xid: Xid,
        _attributes: &[(String, String)],
    ) -> Result<()> {
        self.capture.events.lock().push(Event::Begin { scn: scn.value(), xid });
        Ok(())
    }

    fn process_insert(&mut self, ctx: &EmitContext, table: &DbTable, row: &RowImage) -> Result<()> {
        self.push_dml('c', ctx, table, row);
        Ok(())
    }

    fn process_update(&mut self, ctx: &EmitContext, table: &DbTable, row: &RowImage) -> Result<()> {
        self.push_dml('u', ctx, table, row);
        Ok(())
    }

    fn process_delete(&mut self, ctx: &EmitContext, table: &DbTable, row: &RowImage) -> Result<()> {
        self.push_dml('d', ctx, table, row);
        Ok(())
    }

    fn process_ddl(
        &mut self,
        ctx: &EmitContext,
        _owner: &str,
        _table: &str,
        sql: &str,
    ) -> Result<()> {
        self.capture
            .events
            .lock()
            .push(Event::Ddl { scn: ctx.scn.value(), sql: sql.to_string() });
        Ok(())
    }

    fn process_commit(&mut self, scn: Scn, _timestamp: i64) -> Result<()> {
        self.capture.events.lock().push(Event::Commit { scn: scn.value() });
        Ok(())
    }

    fn process_checkpoint(
        &mut self,
        scn: Scn,
        seq: Seq,
        _timestamp: i64,
        offset: FileOffset,
        switch_redo: bool,
    ) -> Result<()> {
        self.capture.events.lock().push(Event::Checkpoint {
            scn: scn.value(),
            seq: seq.value(),
            offset: offset.value(),
            switch_redo,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
