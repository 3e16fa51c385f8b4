//! Transaction state machine.

use crate::common::types::{FileOffset, Scn, Seq, Xid};

/// Lifecycle of an open transaction.
///
/// ```text
/// New ──► Updated* ──► Committed ──► Processed
///   │        │    └──► Rollbacked
///   │        └──► TwoPhase ──► Committed
///   └──► Bad (began before replication start, never emitted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    New,
    Updated,
    Prepared,
    Committed,
    Processed,
    Rollbacked,
    Bad,
    TwoPhase,
}

#[derive(Debug)]
pub struct Transaction {
    pub xid: Xid,
    pub state: TxState,
    /// Coordinates of the first vector; checkpoints must not advance
    /// past them while the transaction stays open.
    pub start_seq: Seq,
    pub start_offset: FileOffset,
    pub start_scn: Scn,
    pub commit_scn: Scn,
    /// The begin vector (5.2) was seen; rollbacks that find no match
    /// are orphans from before replication start otherwise.
    pub begin_seen: bool,
    /// Set when a forced partial commit already emitted earlier parts.
    pub split: bool,
    /// Payload bytes across all chunks, for the big-transaction cap.
    pub size_bytes: u64,
    pub dml_count: u64,
    /// Session attributes captured from 5.11 vectors.
    pub attributes: Vec<(String, String)>,
    pub name: Option<String>,
}

impl Transaction {
    pub fn new(xid: Xid, seq: Seq, offset: FileOffset, scn: Scn) -> Transaction {
        Transaction {
            xid,
            state: TxState::New,
            start_seq: seq,
            start_offset: offset,
            start_scn: scn,
            commit_scn: Scn::none(),
            begin_seen: false,
            split: false,
            size_bytes: 0,
            dml_count: 0,
            attributes: Vec::new(),
            name: None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, TxState::New | TxState::Updated | TxState::TwoPhase | TxState::Prepared)
    }

    pub fn mark_updated(&mut self) {
        if matches!(self.state, TxState::New | TxState::Updated) {
            self.state = TxState::Updated;
        }
    }

    pub fn mark_bad(&mut self) {
        if self.state != TxState::Processed {
            self.state = TxState::Bad;
        }
    }

    pub fn mark_two_phase(&mut self) {
        if self.is_open() {
            self.state = TxState::TwoPhase;
        }
    }

    pub fn mark_committed(&mut self, commit_scn: Scn) {
        self.commit_scn = commit_scn;
        self.state = TxState::Committed;
    }

    pub fn mark_rollbacked(&mut self) {
        self.state = TxState::Rollbacked;
    }

    pub fn mark_processed(&mut self) {
        self.state = TxState::Processed;
    }
}
