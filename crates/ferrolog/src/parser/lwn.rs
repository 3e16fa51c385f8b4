//! LWN batch assembly.
//!
//! The log writer flushes redo in LWN batches: a run of blocks whose
//! first block carries the batch header. While the parser scans the
//! reader window it copies every record's bytes into an arena of pool
//! chunks and pushes an [`LwnMember`] into a min-heap; once the
//! batch's last block arrived the members are drained in
//! `(sub-SCN, page-offset)` order for replay.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::common::errors::{ReplError, Result};
use crate::common::memory::{Chunk, MemoryManager, MemoryModule, CHUNK_SIZE};
use crate::common::types::{BlockNumber, Scn, SubScn};

/// Arena cap: a single LWN batch never needs more than 1 GiB.
pub const MAX_LWN_CHUNKS: usize = 1024;

/// Record cap within one batch.
pub const MAX_RECORDS_IN_LWN: usize = 1_048_576;

/// Position of one record within the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LwnMember {
    pub sub_scn: SubScn,
    pub page_offset: u16,
    pub block: BlockNumber,
    pub scn: Scn,
    /// Where the record bytes live in the arena.
    pub chunk: usize,
    pub offset: usize,
    pub size: usize,
}

impl Ord for LwnMember {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.sub_scn, self.page_offset, self.block).cmp(&(
            other.sub_scn,
            other.page_offset,
            other.block,
        ))
    }
}

impl PartialOrd for LwnMember {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Arena of pool chunks holding the current batch's record bytes, plus
/// the replay heap.
pub struct LwnArena {
    mm: Arc<MemoryManager>,
    chunks: Vec<Chunk>,
    used: usize,
    heap: BinaryHeap<Reverse<LwnMember>>,
    records: usize,
    /// Most chunks held at once, for the per-file trace.
    pub hwm_chunks: usize,
}

impl LwnArena {
    pub fn new(mm: Arc<MemoryManager>) -> Result<LwnArena> {
        let first = mm.chunk_alloc(MemoryModule::Parser)?;
        Ok(LwnArena {
            mm,
            chunks: vec![first],
            used: 0,
            heap: BinaryHeap::new(),
            records: 0,
            hwm_chunks: 1,
        })
    }

    /// Reserve space for a record of `size` bytes and return its
    /// location.
    fn reserve(&mut self, size: usize) -> Result<(usize, usize)> {
        if size > CHUNK_SIZE {
            return Err(ReplError::internal(
                50053,
                format!("too big redo log record, size: {size}"),
            ));
        }
        if self.used + size > CHUNK_SIZE {
            if self.chunks.len() == MAX_LWN_CHUNKS {
                return Err(ReplError::internal(
                    50052,
                    format!("all {MAX_LWN_CHUNKS} lwn buffers allocated"),
                ));
            }
            self.chunks.push(self.mm.chunk_alloc(MemoryModule::Parser)?);
            self.hwm_chunks = self.hwm_chunks.max(self.chunks.len());
            self.used = 0;
        }
        let location = (self.chunks.len() - 1, self.used);
        self.used += (size + 7) & !7;
        Ok(location)
    }

    /// Begin a record of `size` bytes; bytes arrive via
    /// [`LwnArena::fill`] as the blocks stream in.
    pub fn push_record(
        &mut self,
        scn: Scn,
        sub_scn: SubScn,
        page_offset: u16,
        block: BlockNumber,
        size: usize,
    ) -> Result<LwnMember> {
        if self.records >= MAX_RECORDS_IN_LWN {
            return Err(ReplError::internal(
                50054,
                format!("all {MAX_RECORDS_IN_LWN} records in lwn were used"),
            ));
        }
        let (chunk, offset) = self.reserve(size)?;
        let member = LwnMember { sub_scn, page_offset, block, scn, chunk, offset, size };
        self.heap.push(Reverse(member));
        self.records += 1;
        Ok(member)
    }

    /// Copy `bytes` into the record at `pos` bytes from its start.
    pub fn fill(&mut self, member: &LwnMember, pos: usize, bytes: &[u8]) {
        let chunk = &mut self.chunks[member.chunk];
        chunk[member.offset + pos..member.offset + pos + bytes.len()].copy_from_slice(bytes);
    }

    /// Drain members in `(sub-SCN, page-offset)` order.
    pub fn pop(&mut self) -> Option<LwnMember> {
        self.heap.pop().map(|Reverse(member)| member)
    }

    pub fn record_bytes(&self, member: &LwnMember) -> &[u8] {
        &self.chunks[member.chunk][member.offset..member.offset + member.size]
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Free everything but the first chunk after a batch is drained.
    pub fn reset(&mut self) {
        while self.chunks.len() > 1 {
            let chunk = self.chunks.pop().expect("len checked");
            self.mm.chunk_free(MemoryModule::Parser, chunk);
        }
        self.used = 0;
        self.heap.clear();
        self.records = 0;
    }
}

impl Drop for LwnArena {
    fn drop(&mut self) {
        while let Some(chunk) = self.chunks.pop() {
            self.mm.chunk_free(MemoryModule::Parser, chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::RedoFlags;
    use tempfile::tempdir;

    fn arena(dir: &std::path::Path) -> LwnArena {
        let mm = MemoryManager::new("ORCL", 4, 8, dir, RedoFlags(RedoFlags::DIRECT_DISABLE)).unwrap();
        LwnArena::new(mm).unwrap()
    }

    #[test]
    fn members_drain_in_subscn_then_offset_order() {
        let dir = tempdir().unwrap();
        let mut arena = arena(dir.path());

        let order = [(2u16, 100u16), (1, 500), (1, 40), (3, 16), (2, 16)];
        for (sub_scn, page_offset) in order {
            arena.push_record(Scn::new(100), sub_scn, page_offset, 2, 16).unwrap();
        }

        let mut drained = Vec::new();
        while let Some(member) = arena.pop() {
            drained.push((member.sub_scn, member.page_offset));
        }
        assert_eq!(drained, vec![(1, 40), (1, 500), (2, 16), (2, 100), (3, 16)]);
    }

    #[test]
    fn record_bytes_roundtrip_across_fills() {
        let dir = tempdir().unwrap();
        let mut arena = arena(dir.path());
        let member = arena.push_record(Scn::new(5), 1, 16, 2, 10).unwrap();
        arena.fill(&member, 0, b"hello");
        arena.fill(&member, 5, b"redo!");
        assert_eq!(arena.record_bytes(&member), b"helloredo!");
    }

    #[test]
    fn arena_grows_and_resets() {
        let dir = tempdir().unwrap();
        let mut arena = arena(dir.path());
        // Three records of 600 KiB force a second chunk.
        for i in 0..3 {
            arena.push_record(Scn::new(5), 1, i, 2, 600 * 1024).unwrap();
        }
        assert!(arena.hwm_chunks > 1);
        arena.reset();
        assert!(arena.is_empty());
        let member = arena.push_record(Scn::new(6), 1, 16, 3, 8).unwrap();
        assert_eq!(member.chunk, 0);
    }

    #[test]
    fn oversized_record_rejected() {
        let dir = tempdir().unwrap();
        let mut arena = arena(dir.path());
        let err = arena.push_record(Scn::new(5), 1, 16, 2, CHUNK_SIZE + 1).unwrap_err();
        assert_eq!(err.code(), 50053);
    }
}
