//! The parse loop.
//!
//! Record layout within a block run:
//!
//! ```text
//! block:  [16-byte block header][record][record]...
//! record: [u32 size][u8 vld][pad][u16 scn_wrap][u32 scn_base]
//!         [u16 sub_scn][10 pad] = 24 bytes, then change vectors
//! ```
//!
//! The first block of an LWN batch sets bit 0x04 in `vld` and carries
//! the batch header at fixed offsets behind the block header. Records
//! may span blocks; each continues at offset 16 of the next block. A
//! record never starts in the last 24 bytes of a block.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use tracing::{debug, error, info, trace, warn};

use crate::builder::{Builder, EmitContext};
use crate::common::config::RedoFlags;
use crate::common::errors::{ReplError, Result};
use crate::common::memory::MemoryManager;
use crate::common::metrics as metric;
use crate::common::types::{Endian, FileOffset, Scn, Seq, Xid};
use crate::metadata::schema::{col_type, DbColumn, DbTable};
use crate::metadata::Metadata;
use crate::parser::lwn::{LwnArena, LwnMember};
use crate::parser::opcode::{self, OpCode, Vector, FLG_KDO_NOREDO_OP_SEQ};
use crate::parser::row::{self, RowOp};
use crate::reader::file::{FileReader, WaitOutcome};
use crate::reader::RedoCode;
use crate::txn::record::{record_flags, RecordMeta};
use crate::txn::{TransactionBuffer, TxState};

/// Record header length.
pub const RECORD_HEADER: usize = 24;

/// LWN header offsets behind the 16-byte block header.
const LWN_VLD: usize = 16 + 4;
const LWN_NUM: usize = 16 + 24;
const LWN_NUM_MAX: usize = 16 + 26;
const LWN_SIZE: usize = 16 + 28;
const LWN_SCN: usize = 16 + 40;
const LWN_TIMESTAMP: usize = 16 + 64;

/// Tracks `(commit scn, emit idx)` so the emitted tuple sequence is
/// strictly increasing across files and transactions.
#[derive(Debug, Default)]
pub struct EmitTracker {
    last_scn: Scn,
    idx: u64,
}

impl EmitTracker {
    pub fn new() -> EmitTracker {
        EmitTracker { last_scn: Scn::zero(), idx: 0 }
    }

    fn begin_commit(&mut self, scn: Scn) {
        if scn > self.last_scn {
            self.last_scn = scn;
            self.idx = 0;
        }
    }

    fn next(&mut self) -> u64 {
        let idx = self.idx;
        self.idx += 1;
        idx
    }
}

#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub flags: RedoFlags,
    pub transaction_max_mb: u64,
}

pub struct Parser<'a> {
    mm: Arc<MemoryManager>,
    metadata: Arc<Metadata>,
    buffer: &'a TransactionBuffer,
    builder: &'a mut dyn Builder,
    reader: Arc<FileReader>,
    tracker: &'a mut EmitTracker,
    opts: ParserOptions,
    group: i64,
    sequence: Seq,
    endian: Endian,
    /// Batch state.
    lwn_scn: Scn,
    lwn_timestamp: i64,
    /// Synthetic tables for schemaless decoding, by column count.
    schemaless_tables: HashMap<u16, DbTable>,
}

impl<'a> Parser<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mm: Arc<MemoryManager>,
        metadata: Arc<Metadata>,
        buffer: &'a TransactionBuffer,
        builder: &'a mut dyn Builder,
        reader: Arc<FileReader>,
        tracker: &'a mut EmitTracker,
        opts: ParserOptions,
        group: i64,
    ) -> Parser<'a> {
        Parser {
            mm,
            metadata,
            buffer,
            builder,
            reader,
            tracker,
            opts,
            group,
            sequence: Seq::none(),
            endian: Endian::Little,
            lwn_scn: Scn::zero(),
            lwn_timestamp: 0,
            schemaless_tables: HashMap::new(),
        }
    }

    /// Parse the attached file to its end or a stop condition. The
    /// reader must have passed `check` already.
    pub fn parse(&mut self) -> Result<RedoCode> {
        let header = self.reader.header().ok_or_else(|| {
            ReplError::internal(50056, "parse without a checked reader".to_string())
        })?;
        let block_size = header.block_size as u64;
        self.sequence = header.sequence;
        self.endian = header.endian;

        // Incarnation guards.
        if self.metadata.resetlogs() == 0 {
            self.metadata.set_resetlogs(header.resetlogs);
        }
        if self.metadata.resetlogs() != header.resetlogs {
            return Err(ReplError::internal(
                50048,
                format!(
                    "invalid resetlogs value (found: {}, expected: {})",
                    header.resetlogs,
                    self.metadata.resetlogs()
                ),
            ));
        }
        if header.activation != 0 && self.metadata.activation() != header.activation {
            info!("new activation detected: {}", header.activation);
            self.metadata.set_activation(header.activation);
        }

        // Resume position inside this sequence, or right behind the
        // file header.
        let mut start = self.metadata.take_file_offset();
        if start == FileOffset::zero() {
            start = FileOffset::from_block(2, header.block_size);
        }
        if !start.is_block_aligned(header.block_size) {
            return Err(ReplError::internal(
                50047,
                format!(
                    "incorrect offset start: {start} - not a multiplication of block size: {}",
                    header.block_size
                ),
            ));
        }
        info!(
            "processing redo log: group: {} scn: {} seq: {} offset: {start}",
            self.group, header.first_scn, self.sequence
        );

        self.reader.start_read(start);

        let mut arena = LwnArena::new(Arc::clone(&self.mm))?;
        let mut block = vec![0u8; block_size as usize];

        let start_block = start.block(header.block_size);
        let mut current_block = start_block;
        let mut lwn_confirmed_block = start_block;
        let mut lwn_end_block = start_block;
        let mut lwn_num_max: u16 = 0;
        let mut lwn_num_cnt: u16 = 0;
        let mut record_left = 0usize;
        let mut record_pos = 0usize;
        let mut current_member: Option<LwnMember> = None;
        let mut confirmed = start.value();
        let mut switch_redo = false;

        let code = loop {
            match self.reader.wait_for_data(confirmed) {
                WaitOutcome::Data(end) => {
                    while (current_block as u64 + 1) * block_size <= end {
                        self.reader
                            .copy_block(current_block as u64 * block_size, &mut block)?;

                        // New batch begins where the previous ended.
                        if current_block == lwn_end_block {
                            let vld = block[LWN_VLD];
                            if vld & 0x04 == 0 {
                                return Err(ReplError::internal(
                                    50051,
                                    format!(
                                        "did not find lwn at offset: {}",
                                        current_block as u64 * block_size
                                    ),
                                ));
                            }
                            let lwn_num = self.endian.read_u16(&block[LWN_NUM..]);
                            let lwn_size = self.endian.read_u32(&block[LWN_SIZE..]);
                            lwn_end_block = current_block + lwn_size;
                            self.lwn_scn = self.endian.read_scn(&block[LWN_SCN..]);
                            self.lwn_timestamp =
                                self.endian.read_u32(&block[LWN_TIMESTAMP..]) as i64;

                            let now = chrono::Utc::now().timestamp();
                            gauge!(metric::CHECKPOINT_LAG)
                                .set((now - self.lwn_timestamp) as f64);

                            if lwn_num_cnt == 0 {
                                lwn_num_max = self.endian.read_u16(&block[LWN_NUM_MAX..]);
                                if self.lwn_scn < header.first_scn
                                    || (!header.next_scn.is_none()
                                        && self.lwn_scn > header.next_scn)
                                {
                                    return Err(ReplError::internal(
                                        50049,
                                        format!("invalid lwn scn: {}", self.lwn_scn),
                                    ));
                                }
                            } else {
                                let cur_max = self.endian.read_u16(&block[LWN_NUM_MAX..]);
                                if cur_max != lwn_num_max {
                                    return Err(ReplError::internal(
                                        50050,
                                        format!(
                                            "invalid lwn max: {lwn_num}/{cur_max}/{lwn_num_max}"
                                        ),
                                    ));
                                }
                            }
                            lwn_num_cnt += 1;
                            trace!(
                                "lwn at: {current_block} size: {lwn_size} chk: {lwn_num} max: {lwn_num_max}"
                            );
                        }

                        // Records within the block.
                        let mut offset = 16usize;
                        while offset < block_size as usize {
                            if record_left == 0 {
                                if offset + RECORD_HEADER >= block_size as usize {
                                    break;
                                }
                                let size4 = ((self.endian.read_u32(&block[offset..]) as usize)
                                    + 3)
                                    & !3;
                                if size4 == 0 {
                                    break;
                                }
                                let scn = Scn::new(
                                    self.endian.read_u32(&block[offset + 8..]) as u64
                                        | ((self.endian.read_u16(&block[offset + 6..]) as u64)
                                            << 32),
                                );
                                let sub_scn = self.endian.read_u16(&block[offset + 12..]);
                                let member = arena.push_record(
                                    scn,
                                    sub_scn,
                                    offset as u16,
                                    current_block,
                                    size4,
                                )?;
                                current_member = Some(member);
                                record_left = size4;
                                record_pos = 0;
                            }

                            let to_copy = record_left.min(block_size as usize - offset);
                            let member = current_member.as_ref().expect("record in flight");
                            arena.fill(member, record_pos, &block[offset..offset + to_copy]);
                            record_left -= to_copy;
                            record_pos += to_copy;
                            offset += to_copy;
                        }

                        current_block += 1;
                        confirmed = current_block as u64 * block_size;
                        // Record bytes now live in the arena, so the
                        // ring chunk can be recycled as soon as it is
                        // fully consumed, even mid-batch.
                        if confirmed % crate::common::memory::CHUNK_SIZE as u64 == 0 {
                            self.reader.confirm_read_data(confirmed);
                        }

                        // Batch complete: replay it in order.
                        if current_block == lwn_end_block && lwn_num_cnt == lwn_num_max {
                            if record_left > 0 {
                                return Err(ReplError::internal(
                                    50055,
                                    "record crosses lwn boundary".to_string(),
                                ));
                            }
                            self.drain_batch(&mut arena)?;
                            self.emit_checkpoint(
                                FileOffset::from_block(current_block, header.block_size),
                                false,
                            )?;
                            counter!(metric::BYTES_PARSED).increment(
                                (current_block - lwn_confirmed_block) as u64 * block_size,
                            );
                            lwn_num_cnt = 0;
                            arena.reset();
                            lwn_confirmed_block = current_block;
                            self.reader
                                .confirm_read_data(lwn_confirmed_block as u64 * block_size);
                        } else if lwn_num_cnt > lwn_num_max {
                            return Err(ReplError::internal(
                                50055,
                                format!("lwn overflow: {lwn_num_cnt}/{lwn_num_max}"),
                            ));
                        }
                    }
                }
                WaitOutcome::Done(code) => {
                    match code {
                        RedoCode::Finished => {
                            if !switch_redo && self.lwn_scn > Scn::zero() {
                                switch_redo = true;
                                self.emit_switch_checkpoint(
                                    FileOffset::from_block(current_block, header.block_size),
                                )?;
                            }
                        }
                        RedoCode::Stopped | RedoCode::Overwritten => {
                            // Resume from the last fully-processed batch.
                            self.metadata.set_seq_offset(
                                self.sequence,
                                FileOffset::from_block(lwn_confirmed_block, header.block_size),
                            );
                        }
                        RedoCode::Shutdown => {
                            // Final forced checkpoint, but only when
                            // this run processed any batch at all.
                            if self.lwn_scn > Scn::zero() {
                                self.emit_checkpoint(
                                    FileOffset::from_block(current_block, header.block_size),
                                    true,
                                )?;
                            }
                        }
                        _ => {}
                    }
                    break code;
                }
            }
        };

        debug!(
            "redo log done: seq: {} blocks: {} lwn arena hwm: {}",
            self.sequence,
            current_block - start_block,
            arena.hwm_chunks
        );
        self.builder.flush()?;
        Ok(code)
    }

    /// Replay every record of the completed batch in
    /// `(sub-SCN, page-offset)` order.
    fn drain_batch(&mut self, arena: &mut LwnArena) -> Result<()> {
        while let Some(member) = arena.pop() {
            let bytes = arena.record_bytes(&member).to_vec();
            match self.analyze_record(&member, &bytes) {
                Ok(()) => {}
                Err(e) if e.is_data() && self.opts.flags.is_set(RedoFlags::IGNORE_DATA_ERRORS) => {
                    error!(code = e.code(), "{e}");
                    warn!(code = 60013, "forced to continue working in spite of error");
                }
                Err(e) if e.is_data() => {
                    return Err(ReplError::data(
                        e.code(),
                        format!("runtime error, aborting further redo log processing: {e}"),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn analyze_record(&mut self, member: &LwnMember, bytes: &[u8]) -> Result<()> {
        if bytes.len() < RECORD_HEADER {
            return Err(ReplError::data(20010, "record shorter than its header".to_string()));
        }
        // The batch-header record carries the LWN fields in place of
        // vectors.
        if bytes[4] & 0x04 != 0 {
            return Ok(());
        }
        let vectors = opcode::decode_vectors(&bytes[RECORD_HEADER..], self.endian)?;
        trace!(
            "analyze blk: {} offset: {} scn: {} subscn: {} vectors: {}",
            member.block,
            member.page_offset,
            member.scn,
            member.sub_scn,
            vectors.len()
        );

        let mut pending_undo: Option<&Vector<'_>> = None;
        for vector in &vectors {
            match vector.op {
                OpCode::Undo => pending_undo = Some(vector),
                OpCode::Begin => self.on_begin(vector, member)?,
                OpCode::Commit => self.on_commit(vector, member)?,
                OpCode::PartialRollback => self.on_partial_rollback(vector, member)?,
                OpCode::SessionAttributes => {
                    let attributes = opcode::session_attributes(vector);
                    self.buffer.with_tx(vector.xid, |tx| {
                        tx.attributes.extend(attributes);
                    });
                }
                OpCode::Insert
                | OpCode::Delete
                | OpCode::Update
                | OpCode::MultiInsert
                | OpCode::Lock => {
                    let undo = pending_undo.take();
                    self.on_dml(vector, undo, member)?;
                }
                OpCode::Ddl => self.on_ddl(vector, member)?,
                OpCode::Index(minor) => {
                    trace!("index vector 10.{minor} obj: {}", vector.obj);
                }
                OpCode::LobMarker(major, minor) => {
                    trace!("lob marker {major}.{minor} obj: {}", vector.obj);
                }
                OpCode::HeapOther(minor) => {
                    trace!("heap vector 11.{minor} obj: {}", vector.obj);
                }
                OpCode::Other(major, minor) => {
                    trace!("vector {major}.{minor} not materialized");
                }
            }
        }
        Ok(())
    }

    fn ensure_transaction(&mut self, xid: Xid, member: &LwnMember) -> Result<()> {
        self.buffer.get_or_create(
            xid,
            self.sequence,
            FileOffset::from_block(member.block, self.reader.block_size()),
            member.scn,
        )
    }

    fn on_begin(&mut self, vector: &Vector<'_>, member: &LwnMember) -> Result<()> {
        self.ensure_transaction(vector.xid, member)?;
        self.buffer.with_tx(vector.xid, |tx| {
            tx.begin_seen = true;
            if let Some(Some(name)) = vector.fields.first().map(|f| {
                f.map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            }) {
                if !name.is_empty() {
                    tx.name = Some(name);
                }
            }
        });
        trace!(xid = %vector.xid, "transaction begin");
        Ok(())
    }

    fn on_dml(
        &mut self,
        change: &Vector<'_>,
        undo: Option<&Vector<'_>>,
        member: &LwnMember,
    ) -> Result<()> {
        self.ensure_transaction(change.xid, member)?;
        if self.buffer.state(change.xid) == Some(TxState::Bad) {
            trace!(xid = %change.xid, "dropping vector of bad transaction");
            return Ok(());
        }

        let mut flags = 0u32;
        if change.flags & FLG_KDO_NOREDO_OP_SEQ != 0 {
            flags |= record_flags::KDO_NOREDO_OP_SEQ;
            if self.opts.flags.is_set(RedoFlags::ADAPTIVE_SCHEMA) {
                // Accepted but produces no rows; see the flag's note.
                trace!(xid = %change.xid, "kdo no-redo op-seq vector skipped");
                return Ok(());
            }
        }
        if undo.is_some() {
            flags |= record_flags::SUPPLEMENTAL;
        }

        let meta = RecordMeta {
            scn: member.scn,
            sub_scn: member.sub_scn,
            seq: self.sequence,
            file_offset: FileOffset::from_block(member.block, self.reader.block_size()),
            obj: change.obj,
            bdba: change.bdba,
            slot: change.slot,
            op: change.op.to_u16(),
            flags,
        };
        self.buffer.append(change.xid, meta, change.raw, undo.map(|u| u.raw))?;

        // Big-transaction cap: deliver what we have and start over.
        if self.opts.transaction_max_mb > 0 {
            let size = self
                .buffer
                .with_tx(change.xid, |tx| tx.size_bytes)
                .unwrap_or(0);
            if size > self.opts.transaction_max_mb * 1024 * 1024 {
                warn!(
                    code = 60014,
                    "transaction: {} exceeded size limit: {} MB, forcing partial commit",
                    change.xid,
                    self.opts.transaction_max_mb
                );
                self.force_partial_commit(change.xid, member)?;
            }
        }
        Ok(())
    }

    fn force_partial_commit(&mut self, xid: Xid, member: &LwnMember) -> Result<()> {
        let (begin_seen, attributes) = self
            .buffer
            .with_tx(xid, |tx| {
                tx.split = true;
                (tx.begin_seen, tx.attributes.clone())
            })
            .unwrap_or((false, Vec::new()));

        self.emit_transaction(xid, member.scn, true)?;
        self.buffer.destroy(xid);

        // Reopen so later vectors of the same transaction keep
        // accumulating; downstream sees a split transaction.
        self.ensure_transaction(xid, member)?;
        self.buffer.with_tx(xid, |tx| {
            tx.begin_seen = begin_seen;
            tx.split = true;
            tx.attributes = attributes;
        });
        counter!(metric::TRANSACTIONS, "type" => "commit", "filter" => "partial").increment(1);
        Ok(())
    }

    fn on_partial_rollback(&mut self, vector: &Vector<'_>, member: &LwnMember) -> Result<()> {
        self.ensure_transaction(vector.xid, member)?;
        let (bdba, slot) = opcode::rollback_target(vector, self.endian)?;
        if self.buffer.rollback_match(vector.xid, bdba, slot)? {
            return Ok(());
        }
        let begin_seen = self
            .buffer
            .with_tx(vector.xid, |tx| tx.begin_seen)
            .unwrap_or(false);
        if begin_seen {
            warn!(
                code = 60010,
                "skipping orphaned rollback for xid: {} bdba: {bdba} slot: {slot}", vector.xid
            );
        } else {
            // The forward vector predates replication start.
            debug!(xid = %vector.xid, "rollback without match, marking transaction bad");
            self.buffer.with_tx(vector.xid, |tx| tx.mark_bad());
        }
        Ok(())
    }

    fn on_ddl(&mut self, vector: &Vector<'_>, member: &LwnMember) -> Result<()> {
        self.ensure_transaction(vector.xid, member)?;
        if self.buffer.state(vector.xid) == Some(TxState::Bad) {
            return Ok(());
        }
        let meta = RecordMeta {
            scn: member.scn,
            sub_scn: member.sub_scn,
            seq: self.sequence,
            file_offset: FileOffset::from_block(member.block, self.reader.block_size()),
            obj: vector.obj,
            bdba: vector.bdba,
            slot: vector.slot,
            op: vector.op.to_u16(),
            flags: 0,
        };
        self.buffer.append(vector.xid, meta, vector.raw, None)
    }

    fn on_commit(&mut self, vector: &Vector<'_>, member: &LwnMember) -> Result<()> {
        let xid = vector.xid;
        if !self.buffer.contains(xid) {
            trace!(%xid, "commit for unknown transaction");
            return Ok(());
        }
        let is_rollback = opcode::is_rollback_commit(vector);
        let state = self.buffer.state(xid);

        if state == Some(TxState::Bad) {
            counter!(metric::TRANSACTIONS, "type" => "commit", "filter" => "skip").increment(1);
            self.buffer.with_tx(xid, |tx| tx.mark_rollbacked());
            self.buffer.destroy(xid);
            return Ok(());
        }
        if is_rollback {
            counter!(metric::TRANSACTIONS, "type" => "rollback", "filter" => "out").increment(1);
            self.buffer.with_tx(xid, |tx| tx.mark_rollbacked());
            self.buffer.destroy(xid);
            return Ok(());
        }

        let commit_scn = member.scn;
        let (client_scn, _) = self.metadata.client_confirmed();
        if !client_scn.is_none() && commit_scn <= client_scn {
            // Already delivered before the restart.
            counter!(metric::TRANSACTIONS, "type" => "commit", "filter" => "skip").increment(1);
            self.buffer.with_tx(xid, |tx| tx.mark_committed(commit_scn));
            self.buffer.destroy(xid);
            return Ok(());
        }

        let dml_count = self.buffer.with_tx(xid, |tx| tx.dml_count).unwrap_or(0);
        if dml_count == 0 {
            // Nothing effective: no events, no counters.
            self.buffer.destroy(xid);
            return Ok(());
        }

        self.buffer.with_tx(xid, |tx| tx.mark_committed(commit_scn));
        self.emit_transaction(xid, commit_scn, false)?;
        self.buffer.with_tx(xid, |tx| tx.mark_processed());
        self.buffer.destroy(xid);
        counter!(metric::TRANSACTIONS, "type" => "commit", "filter" => "out").increment(1);
        Ok(())
    }

    /// Replay the transaction's surviving DML to the builder.
    fn emit_transaction(&mut self, xid: Xid, commit_scn: Scn, partial: bool) -> Result<()> {
        let attributes = self
            .buffer
            .with_tx(xid, |tx| tx.attributes.clone())
            .unwrap_or_default();
        let timestamp = self.lwn_timestamp;

        self.builder.process_begin(commit_scn, timestamp, xid, &attributes)?;
        self.tracker.begin_commit(commit_scn);
        if partial {
            debug!(%xid, %commit_scn, "emitting split transaction part");
        }

        let endian = self.endian;
        let schemaless = self.opts.flags.is_set(RedoFlags::SCHEMALESS);
        let mut table_cache: HashMap<u32, Option<DbTable>> = HashMap::new();

        let buffer = self.buffer;
        let metadata = Arc::clone(&self.metadata);
        let builder = &mut *self.builder;
        let tracker = &mut *self.tracker;
        let schemaless_tables = &mut self.schemaless_tables;

        buffer.replay(xid, |entry| {
            let change = opcode::decode_vector(entry.bytes1, endian)?;
            let undo = match entry.bytes2 {
                Some(bytes) => Some(opcode::decode_vector(bytes, endian)?),
                None => None,
            };

            if change.op == OpCode::Ddl {
                let Some(sql) = opcode::ddl_text(&change) else {
                    return Ok(());
                };
                let (owner, name) = metadata.with_schema(|s| {
                    s.table_by_obj(entry.meta.obj)
                        .map(|t| (t.owner.clone(), t.name.clone()))
                        .unwrap_or_default()
                });
                let ctx = EmitContext { scn: commit_scn, idx: tracker.next(), xid, timestamp };
                counter!(metric::DDL_OPS, "type" => "ddl").increment(1);
                return builder.process_ddl(&ctx, &owner, &name, &sql);
            }

            let table = table_cache
                .entry(entry.meta.obj)
                .or_insert_with(|| {
                    metadata.with_schema(|s| s.table_by_obj(entry.meta.obj).cloned())
                })
                .clone();
            let table = match table {
                Some(table) => table,
                None if schemaless => {
                    let kdo = opcode::kdo_header(&change, endian)?;
                    synthetic_table(schemaless_tables, entry.meta.obj, kdo.cc).clone()
                }
                None => {
                    trace!(obj = entry.meta.obj, "no table in schema, skipping vector");
                    counter!(metric::DML_OPS, "type" => "skip", "filter" => "out").increment(1);
                    return Ok(());
                }
            };

            let rows = row::reconstruct_rows(&change, undo.as_ref(), &table, endian)?;
            for image in rows {
                let ctx = EmitContext { scn: commit_scn, idx: tracker.next(), xid, timestamp };
                let (kind, call): (&str, fn(&mut dyn Builder, &EmitContext, &DbTable, &row::RowImage) -> Result<()>) =
                    match image.op {
                        RowOp::Insert => ("insert", |b, c, t, r| b.process_insert(c, t, r)),
                        RowOp::Update => ("update", |b, c, t, r| b.process_update(c, t, r)),
                        RowOp::Delete => ("delete", |b, c, t, r| b.process_delete(c, t, r)),
                    };
                call(builder, &ctx, &table, &image)?;
                counter!(metric::DML_OPS, "type" => kind.to_string(), "filter" => "out")
                    .increment(1);
            }
            Ok(())
        })?;

        self.builder.process_commit(commit_scn, timestamp)
    }

    /// Checkpoint after a fully-drained batch (or at soft shutdown).
    fn emit_checkpoint(&mut self, offset: FileOffset, at_shutdown: bool) -> Result<()> {
        if self.lwn_scn <= self.metadata.first_data_scn() && !at_shutdown {
            counter!(metric::CHECKPOINTS, "filter" => "skip").increment(1);
            return Ok(());
        }
        self.metadata.allow_checkpoints();
        self.builder.process_checkpoint(
            self.lwn_scn,
            self.sequence,
            self.lwn_timestamp,
            offset,
            false,
        )?;
        let (min_seq, min_offset, min_xid) = self.buffer.checkpoint();
        self.metadata
            .checkpoint(self.lwn_scn, self.sequence, offset, min_seq, min_offset, min_xid)?;
        counter!(metric::CHECKPOINTS, "filter" => "out").increment(1);
        Ok(())
    }

    /// The extra checkpoint marking the end of a sequence.
    fn emit_switch_checkpoint(&mut self, offset: FileOffset) -> Result<()> {
        if self.lwn_scn <= self.metadata.first_data_scn() {
            counter!(metric::CHECKPOINTS, "filter" => "skip").increment(1);
            return Ok(());
        }
        self.builder.process_checkpoint(
            self.lwn_scn,
            self.sequence,
            self.lwn_timestamp,
            offset,
            true,
        )?;
        counter!(metric::CHECKPOINTS, "filter" => "out").increment(1);
        Ok(())
    }
}

/// A stand-in table for schemaless mode: `cc` RAW columns named by
/// position.
fn synthetic_table(cache: &mut HashMap<u16, DbTable>, obj: u32, cc: u16) -> &DbTable {
    let table = cache.entry(cc).or_insert_with(|| DbTable {
        obj: 0,
        data_obj: 0,
        owner: "UNKNOWN".to_string(),
        name: "UNKNOWN".to_string(),
        columns: (1..=cc)
            .map(|col_no| DbColumn {
                col_no,
                name: format!("COL_{col_no}"),
                typ: col_type::RAW,
                length: 4000,
                precision: None,
                scale: None,
                nullable: true,
                charset_id: 0,
            })
            .collect(),
        lobs: Vec::new(),
        pk: Vec::new(),
        tag_cols: Vec::new(),
        partitions: Vec::new(),
    });
    table.obj = obj;
    table.data_obj = obj;
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_tracker_resets_per_commit_scn() {
        let mut tracker = EmitTracker::new();
        tracker.begin_commit(Scn::new(100));
        assert_eq!(tracker.next(), 0);
        assert_eq!(tracker.next(), 1);
        tracker.begin_commit(Scn::new(200));
        assert_eq!(tracker.next(), 0);
    }

    #[test]
    fn emit_tracker_continues_within_same_scn() {
        // Two transactions committing at one SCN must keep the tuple
        // sequence strictly increasing.
        let mut tracker = EmitTracker::new();
        tracker.begin_commit(Scn::new(100));
        assert_eq!(tracker.next(), 0);
        tracker.begin_commit(Scn::new(100));
        assert_eq!(tracker.next(), 1);
    }

    #[test]
    fn synthetic_table_shape() {
        let mut cache = HashMap::new();
        let table = synthetic_table(&mut cache, 9001, 3);
        assert_eq!(table.obj, 9001);
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.columns[2].name, "COL_3");
        assert_eq!(table.columns[0].typ, col_type::RAW);
    }
}
