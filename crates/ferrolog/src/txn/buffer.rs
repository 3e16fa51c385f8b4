//! The transaction buffer.
//!
//! Owns every open transaction and its chunk chain. The parser is the
//! only writer; commit replay hands surviving DML pairs to the caller
//! in arrival order, restoring swapped chunks on demand and returning
//! each processed chunk to the pool before moving to the next, so a
//! transaction larger than the pool still replays.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::common::errors::{ReplError, Result};
use crate::common::memory::MemoryManager;
use crate::common::metrics as metric;
use crate::common::types::{FileOffset, Scn, Seq, Xid};
use crate::txn::chunk;
use crate::txn::record::RecordMeta;
use crate::txn::transaction::{Transaction, TxState};

/// One surviving DML pair handed to the commit callback.
#[derive(Debug)]
pub struct ReplayEntry<'a> {
    pub meta: RecordMeta,
    /// Raw change vector.
    pub bytes1: &'a [u8],
    /// Raw paired undo vector, when the operation carries one.
    pub bytes2: Option<&'a [u8]>,
}

pub struct TransactionBuffer {
    mm: Arc<MemoryManager>,
    txns: Mutex<HashMap<Xid, Transaction>>,
}

impl TransactionBuffer {
    pub fn new(mm: Arc<MemoryManager>) -> TransactionBuffer {
        TransactionBuffer { mm, txns: Mutex::new(HashMap::new()) }
    }

    pub fn contains(&self, xid: Xid) -> bool {
        self.txns.lock().contains_key(&xid)
    }

    pub fn open_count(&self) -> usize {
        self.txns.lock().values().filter(|t| t.is_open()).count()
    }

    /// Look up or create the transaction for `xid`. The coordinates of
    /// the creating vector become the transaction's start position.
    pub fn get_or_create(&self, xid: Xid, seq: Seq, offset: FileOffset, scn: Scn) -> Result<()> {
        if self.txns.lock().contains_key(&xid) {
            return Ok(());
        }
        self.mm.chain_init(xid);
        self.mm.chain_grow(xid)?;
        self.mm.with_tail_mut(xid, chunk::init)?;
        let mut txns = self.txns.lock();
        txns.entry(xid).or_insert_with(|| {
            trace!(%xid, %seq, %offset, "transaction created");
            Transaction::new(xid, seq, offset, scn)
        });
        Ok(())
    }

    /// Run `f` against the transaction, if present.
    pub fn with_tx<R>(&self, xid: Xid, f: impl FnOnce(&mut Transaction) -> R) -> Option<R> {
        self.txns.lock().get_mut(&xid).map(f)
    }

    pub fn state(&self, xid: Xid) -> Option<TxState> {
        self.txns.lock().get(&xid).map(|t| t.state)
    }

    /// Append a DML pair to the transaction's chain.
    pub fn append(
        &self,
        xid: Xid,
        meta: RecordMeta,
        bytes1: &[u8],
        bytes2: Option<&[u8]>,
    ) -> Result<()> {
        if !chunk::fits_chunk(bytes1.len(), bytes2.map_or(0, <[u8]>::len)) {
            return Err(ReplError::internal(
                50053,
                format!("too big redo log record, size: {}", bytes1.len()),
            ));
        }

        let appended = self.mm.with_tail_mut(xid, |tail| {
            chunk::append(tail, &meta, bytes1, bytes2).is_some()
        })?;
        if !appended {
            self.mm.chain_grow(xid)?;
            self.mm.with_tail_mut(xid, |tail| {
                chunk::init(tail);
                chunk::append(tail, &meta, bytes1, bytes2)
                    .expect("fresh chunk accepts a fitting entry");
            })?;
        }

        let mut txns = self.txns.lock();
        let tx = txns
            .get_mut(&xid)
            .ok_or_else(|| ReplError::internal(50070, format!("transaction not found: {xid}")))?;
        tx.size_bytes += chunk::entry_size(bytes1.len(), bytes2.map_or(0, <[u8]>::len)) as u64;
        tx.dml_count += 1;
        tx.mark_updated();
        Ok(())
    }

    /// Find the forward vector matching a partial rollback, scanning
    /// the chain in reverse, and mark it dead. Returns whether a match
    /// was found.
    pub fn rollback_match(&self, xid: Xid, undo_bdba: u32, undo_slot: u16) -> Result<bool> {
        let len = self.mm.chain_len(xid);
        for idx in (0..len).rev() {
            self.mm.require_resident(xid, idx)?;
            let found = self.mm.with_chunk_mut(xid, idx, |bytes| {
                let target = chunk::entries(bytes)
                    .filter(|e| !e.rolled_back)
                    .filter(|e| e.meta.bdba == undo_bdba && e.meta.slot == undo_slot)
                    .map(|e| e.offset)
                    .last();
                match target {
                    Some(offset) => {
                        chunk::mark_rolled_back(bytes, offset);
                        true
                    }
                    None => false,
                }
            })?;
            if found {
                counter!(metric::TRANSACTIONS, "type" => "rollback", "filter" => "partial")
                    .increment(1);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Replay surviving DML pairs in arrival order. Chunks are copied
    /// out one at a time and released back to the pool immediately, so
    /// peak residency stays at one chunk regardless of transaction
    /// size. Returns the number of entries handed to `f`.
    pub fn replay(
        &self,
        xid: Xid,
        mut f: impl FnMut(ReplayEntry<'_>) -> Result<()>,
    ) -> Result<u64> {
        self.mm.chain_mark_release(xid);
        let len = self.mm.chain_len(xid);
        let mut emitted = 0;
        for idx in 0..len {
            self.mm.require_resident(xid, idx)?;
            let local = self.mm.with_chunk(xid, idx, |bytes| {
                let used = chunk::used(bytes);
                bytes[..used].to_vec()
            })?;
            self.mm.chain_release_chunk(xid, idx)?;

            for entry in chunk::entries(&local) {
                if entry.rolled_back {
                    continue;
                }
                f(ReplayEntry { meta: entry.meta, bytes1: entry.bytes1, bytes2: entry.bytes2 })?;
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    /// Drop the transaction and free its chain.
    pub fn destroy(&self, xid: Xid) {
        if self.txns.lock().remove(&xid).is_none() {
            warn!(code = 60010, "destroying unknown transaction: {xid}");
        }
        self.mm.chain_remove(xid);
    }

    /// Coordinates of the oldest still-open transaction, for the
    /// checkpoint's `min-tran`.
    pub fn checkpoint(&self) -> (Seq, FileOffset, Option<Xid>) {
        let txns = self.txns.lock();
        let oldest = txns
            .values()
            .filter(|t| t.is_open())
            .min_by_key(|t| (t.start_seq, t.start_offset));
        match oldest {
            Some(tx) => (tx.start_seq, tx.start_offset, Some(tx.xid)),
            None => (Seq::none(), FileOffset::zero(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::RedoFlags;
    use tempfile::tempdir;

    fn buffer(dir: &std::path::Path) -> TransactionBuffer {
        let mm = MemoryManager::new(
            "TESTDB",
            4,
            16,
            dir,
            RedoFlags(RedoFlags::DIRECT_DISABLE),
        )
        .unwrap();
        TransactionBuffer::new(mm)
    }

    fn meta(scn: u64, bdba: u32, slot: u16) -> RecordMeta {
        RecordMeta {
            scn: Scn::new(scn),
            sub_scn: 0,
            seq: Seq::new(1),
            file_offset: FileOffset::new(1024),
            obj: 5001,
            bdba,
            slot,
            op: 0x0B02,
            flags: 0,
        }
    }

    #[test]
    fn replay_preserves_arrival_order() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path());
        let xid = Xid::new(1, 2, 3);
        buffer.get_or_create(xid, Seq::new(1), FileOffset::new(512), Scn::new(10)).unwrap();
        for i in 0..5u64 {
            buffer.append(xid, meta(10 + i, i as u32, 0), format!("row-{i}").as_bytes(), None).unwrap();
        }

        let mut seen = Vec::new();
        let emitted = buffer
            .replay(xid, |entry| {
                seen.push(String::from_utf8(entry.bytes1.to_vec()).unwrap());
                Ok(())
            })
            .unwrap();
        assert_eq!(emitted, 5);
        assert_eq!(seen, vec!["row-0", "row-1", "row-2", "row-3", "row-4"]);
        buffer.destroy(xid);
    }

    #[test]
    fn replay_spans_chunks() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path());
        let xid = Xid::new(2, 0, 7);
        buffer.get_or_create(xid, Seq::new(1), FileOffset::new(512), Scn::new(10)).unwrap();
        // Each entry ~128 KiB; 20 of them forces several chunks.
        let payload = vec![0x5A_u8; 128 * 1024];
        for i in 0..20u32 {
            buffer.append(xid, meta(10 + i as u64, i, 0), &payload, None).unwrap();
        }
        assert!(buffer.mm.chain_len(xid) > 1);

        let emitted = buffer.replay(xid, |_| Ok(())).unwrap();
        assert_eq!(emitted, 20);
        buffer.destroy(xid);
    }

    #[test]
    fn rollback_marks_latest_match_only() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path());
        let xid = Xid::new(3, 0, 1);
        buffer.get_or_create(xid, Seq::new(1), FileOffset::new(512), Scn::new(10)).unwrap();
        buffer.append(xid, meta(10, 0xAA, 1), b"first", None).unwrap();
        buffer.append(xid, meta(11, 0xAA, 1), b"second", None).unwrap();
        buffer.append(xid, meta(12, 0xBB, 2), b"other", None).unwrap();

        assert!(buffer.rollback_match(xid, 0xAA, 1).unwrap());

        let mut survivors = Vec::new();
        buffer
            .replay(xid, |entry| {
                survivors.push(String::from_utf8(entry.bytes1.to_vec()).unwrap());
                Ok(())
            })
            .unwrap();
        assert_eq!(survivors, vec!["first", "other"]);
        buffer.destroy(xid);
    }

    #[test]
    fn rollback_without_match_reports_false() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path());
        let xid = Xid::new(3, 0, 2);
        buffer.get_or_create(xid, Seq::new(1), FileOffset::new(512), Scn::new(10)).unwrap();
        buffer.append(xid, meta(10, 0xAA, 1), b"first", None).unwrap();
        assert!(!buffer.rollback_match(xid, 0xCC, 9).unwrap());
        buffer.destroy(xid);
    }

    #[test]
    fn checkpoint_tracks_oldest_open_transaction() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path());
        let (seq, offset, xid) = buffer.checkpoint();
        assert!(seq.is_none());
        assert_eq!(offset, FileOffset::zero());
        assert!(xid.is_none());

        let old = Xid::new(1, 0, 1);
        let young = Xid::new(1, 0, 2);
        buffer.get_or_create(old, Seq::new(3), FileOffset::new(512), Scn::new(10)).unwrap();
        buffer.get_or_create(young, Seq::new(4), FileOffset::new(512), Scn::new(20)).unwrap();

        let (seq, offset, min_xid) = buffer.checkpoint();
        assert_eq!(seq, Seq::new(3));
        assert_eq!(offset, FileOffset::new(512));
        assert_eq!(min_xid, Some(old));

        buffer.with_tx(old, |t| t.mark_committed(Scn::new(30)));
        let (seq, _, min_xid) = buffer.checkpoint();
        assert_eq!(seq, Seq::new(4));
        assert_eq!(min_xid, Some(young));
        buffer.destroy(old);
        buffer.destroy(young);
    }

    #[test]
    fn paired_vectors_roundtrip() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path());
        let xid = Xid::new(5, 5, 5);
        buffer.get_or_create(xid, Seq::new(1), FileOffset::new(512), Scn::new(10)).unwrap();
        buffer.append(xid, meta(10, 1, 1), b"change", Some(b"before-image")).unwrap();

        buffer
            .replay(xid, |entry| {
                assert_eq!(entry.bytes1, b"change");
                assert_eq!(entry.bytes2.unwrap(), b"before-image");
                Ok(())
            })
            .unwrap();
        buffer.destroy(xid);
    }

    #[test]
    fn empty_transaction_replays_nothing() {
        let dir = tempdir().unwrap();
        let buffer = buffer(dir.path());
        let xid = Xid::new(6, 0, 1);
        buffer.get_or_create(xid, Seq::new(1), FileOffset::new(512), Scn::new(10)).unwrap();
        let emitted = buffer.replay(xid, |_| Ok(())).unwrap();
        assert_eq!(emitted, 0);
        buffer.destroy(xid);
    }
}
