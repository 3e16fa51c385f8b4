//! Message building.
//!
//! The parser hands completed transactions here event by event, in
//! commit-SCN order. A [`Builder`] renders them into messages for a
//! [`crate::writer::Writer`]; the JSON builder in this crate is the
//! reference implementation, the trait is the seam external formats
//! (Protobuf) plug into.

pub mod json;

pub use json::JsonBuilder;

use crate::common::errors::Result;
use crate::common::types::{FileOffset, Scn, Seq, Xid};
use crate::metadata::schema::DbTable;
use crate::parser::row::RowImage;

/// Coordinates attached to every emitted event. `idx` numbers events
/// within one commit SCN so `(scn, idx)` is strictly increasing over
/// a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitContext {
    pub scn: Scn,
    pub idx: u64,
    pub xid: Xid,
    /// Commit timestamp, Unix epoch seconds.
    pub timestamp: i64,
}

pub trait Builder: Send {
    /// A transaction's events follow until `process_commit`.
    fn process_begin(
        &mut self,
        scn: Scn,
        timestamp: i64,
        xid: Xid,
        attributes: &[(String, String)],
    ) -> Result<()>;

    fn process_insert(
        &mut self,
        ctx: &EmitContext,
        table: &DbTable,
        row: &RowImage,
    ) -> Result<()>;

    fn process_update(
        &mut self,
        ctx: &EmitContext,
        table: &DbTable,
        row: &RowImage,
    ) -> Result<()>;

    fn process_delete(
        &mut self,
        ctx: &EmitContext,
        table: &DbTable,
        row: &RowImage,
    ) -> Result<()>;

    /// DDL is delivered as captured text only.
    fn process_ddl(&mut self, ctx: &EmitContext, owner: &str, table: &str, sql: &str)
        -> Result<()>;

    fn process_commit(&mut self, scn: Scn, timestamp: i64) -> Result<()>;

    /// Called after every fully-drained LWN batch; `switch_redo` marks
    /// the end-of-sequence checkpoint.
    fn process_checkpoint(
        &mut self,
        scn: Scn,
        seq: Seq,
        timestamp: i64,
        offset: FileOffset,
        switch_redo: bool,
    ) -> Result<()>;

    /// Flush any buffered output (end of file, shutdown).
    fn flush(&mut self) -> Result<()>;
}
