//! Resume state and schema cache.
//!
//! [`Metadata`] owns the two mutex-protected domains the rest of the
//! pipeline consults: the schema cache and the checkpoint state
//! (positions, watermarks, incarnations). Lock rank: schema before
//! checkpoint; neither is held across disk I/O of other components.

pub mod checkpoint;
pub mod schema;
pub mod state;

use std::path::Path;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::common::errors::{ReplError, Result};
use crate::common::types::{Activation, FileOffset, Resetlogs, Scn, Seq, Xid};
use checkpoint::{CheckpointDoc, CheckpointStore, Incarnation, MinTran, OnlineRedo};
use schema::Schema;
use state::DiskState;

/// Replicator progression; clients wait on the transition to
/// `Replicate` before consuming events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Start,
    Replicate,
}

/// A resume position recovered from a checkpoint document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePosition {
    pub scn: Scn,
    pub seq: Seq,
    pub offset: FileOffset,
}

struct CheckpointState {
    resetlogs: Resetlogs,
    activation: Activation,
    sequence: Seq,
    /// Position the parser starts at inside the current sequence;
    /// consumed (reset to zero) once applied.
    file_offset: FileOffset,
    first_data_scn: Scn,
    client_scn: Scn,
    client_idx: u64,
    checkpoint_scn: Scn,
    checkpoints: u64,
    allowed: bool,
    last_full_schema_scn: Option<Scn>,
    writes_since_full_schema: u64,
    supp_log_db_primary: bool,
    supp_log_db_all: bool,
    online_redo: Vec<OnlineRedo>,
    incarnations: Vec<Incarnation>,
    users: Vec<String>,
}

pub struct Metadata {
    database: String,
    keep_checkpoints: u64,
    /// A full schema blob is forced after this many reference writes.
    schema_force_interval: u64,
    schema: Mutex<Schema>,
    checkpoint: Mutex<CheckpointState>,
    store: Mutex<CheckpointStore>,
    status: Mutex<Status>,
    cond_status: Condvar,
}

impl Metadata {
    pub fn new(
        state_dir: &Path,
        database: &str,
        keep_checkpoints: u64,
    ) -> Result<Metadata> {
        let store = CheckpointStore::open(DiskState::new(state_dir)?, database)?;
        Ok(Metadata {
            database: database.to_string(),
            keep_checkpoints,
            schema_force_interval: 20,
            schema: Mutex::new(Schema::new()),
            checkpoint: Mutex::new(CheckpointState {
                resetlogs: 0,
                activation: 0,
                sequence: Seq::none(),
                file_offset: FileOffset::zero(),
                first_data_scn: Scn::none(),
                client_scn: Scn::none(),
                client_idx: 0,
                checkpoint_scn: Scn::none(),
                checkpoints: 0,
                allowed: false,
                last_full_schema_scn: None,
                writes_since_full_schema: 0,
                supp_log_db_primary: false,
                supp_log_db_all: false,
                online_redo: Vec::new(),
                incarnations: Vec::new(),
                users: Vec::new(),
            }),
            store: Mutex::new(store),
            status: Mutex::new(Status::Ready),
            cond_status: Condvar::new(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    // --- status machine --------------------------------------------------

    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    pub fn set_status(&self, status: Status) {
        let mut current = self.status.lock();
        if *current != status {
            debug!(?status, "replicator status change");
            *current = status;
            self.cond_status.notify_all();
        }
    }

    /// Block until the pipeline reaches `Replicate` (or shutdown is
    /// signalled by `cancelled`).
    pub fn wait_until_replicate(&self, cancelled: impl Fn() -> bool) {
        let mut current = self.status.lock();
        while *current != Status::Replicate && !cancelled() {
            self.cond_status
                .wait_for(&mut current, std::time::Duration::from_millis(100));
        }
    }

    // --- schema ----------------------------------------------------------

    pub fn with_schema<R>(&self, f: impl FnOnce(&Schema) -> R) -> R {
        f(&self.schema.lock())
    }

    pub fn with_schema_mut<R>(&self, f: impl FnOnce(&mut Schema) -> R) -> R {
        f(&mut self.schema.lock())
    }

    // --- positions and watermarks ---------------------------------------

    pub fn sequence(&self) -> Seq {
        self.checkpoint.lock().sequence
    }

    pub fn set_sequence(&self, seq: Seq) {
        self.checkpoint.lock().sequence = seq;
    }

    /// Set the resume position inside the current sequence.
    pub fn set_seq_offset(&self, seq: Seq, offset: FileOffset) {
        let mut state = self.checkpoint.lock();
        state.sequence = seq;
        state.file_offset = offset;
    }

    /// The parser consumes the start offset exactly once.
    pub fn take_file_offset(&self) -> FileOffset {
        let mut state = self.checkpoint.lock();
        std::mem::take(&mut state.file_offset)
    }

    pub fn resetlogs(&self) -> Resetlogs {
        self.checkpoint.lock().resetlogs
    }

    pub fn set_resetlogs(&self, resetlogs: Resetlogs) {
        self.checkpoint.lock().resetlogs = resetlogs;
    }

    pub fn activation(&self) -> Activation {
        self.checkpoint.lock().activation
    }

    pub fn set_activation(&self, activation: Activation) {
        self.checkpoint.lock().activation = activation;
    }

    pub fn first_data_scn(&self) -> Scn {
        self.checkpoint.lock().first_data_scn
    }

    pub fn set_first_data_scn(&self, scn: Scn) {
        self.checkpoint.lock().first_data_scn = scn;
    }

    pub fn client_confirmed(&self) -> (Scn, u64) {
        let state = self.checkpoint.lock();
        (state.client_scn, state.client_idx)
    }

    pub fn set_client_confirmed(&self, scn: Scn, idx: u64) {
        let mut state = self.checkpoint.lock();
        state.client_scn = scn;
        state.client_idx = idx;
    }

    /// Whether `(scn, idx)` lies beyond the client-confirmed watermark.
    pub fn is_new_data(&self, scn: Scn, idx: u64) -> bool {
        let state = self.checkpoint.lock();
        if state.client_scn.is_none() {
            return true;
        }
        scn > state.client_scn || (scn == state.client_scn && idx > state.client_idx)
    }

    pub fn set_supp_log(&self, primary: bool, all: bool) {
        let mut state = self.checkpoint.lock();
        state.supp_log_db_primary = primary;
        state.supp_log_db_all = all;
    }

    pub fn set_users(&self, users: Vec<String>) {
        self.checkpoint.lock().users = users;
    }

    // --- checkpoints -----------------------------------------------------

    /// Suppressed until the first successful data batch so a fresh
    /// start cannot overwrite the last known good state with nothing.
    pub fn allow_checkpoints(&self) {
        let mut state = self.checkpoint.lock();
        if !state.allowed {
            info!("checkpoints allowed");
            state.allowed = true;
        }
    }

    pub fn checkpoints_allowed(&self) -> bool {
        self.checkpoint.lock().allowed
    }

    pub fn checkpoint_scn(&self) -> Scn {
        self.checkpoint.lock().checkpoint_scn
    }

    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoint.lock().checkpoints
    }

    /// Persist a checkpoint for a fully-drained LWN batch. Returns
    /// whether a document was written.
    #[allow(clippy::too_many_arguments)]
    pub fn checkpoint(
        &self,
        scn: Scn,
        seq: Seq,
        offset: FileOffset,
        min_seq: Seq,
        min_offset: FileOffset,
        min_xid: Option<Xid>,
    ) -> Result<bool> {
        // Rank: schema lock first, then checkpoint.
        let mut schema_guard = self.schema.lock();
        let mut state = self.checkpoint.lock();
        if !state.allowed {
            return Ok(false);
        }
        if !state.checkpoint_scn.is_none() && scn < state.checkpoint_scn {
            return Err(ReplError::internal(
                50051,
                format!(
                    "checkpoint scn going backwards: {scn} after {}",
                    state.checkpoint_scn
                ),
            ));
        }

        let full_schema = schema_guard.touched
            || state.last_full_schema_scn.is_none()
            || state.writes_since_full_schema >= self.schema_force_interval;

        let min_tran = if min_seq.is_none() {
            None
        } else {
            Some(MinTran {
                seq: min_seq,
                offset: min_offset,
                xid: min_xid.unwrap_or_else(Xid::zero),
            })
        };

        let doc = CheckpointDoc {
            database: self.database.clone(),
            scn,
            seq,
            offset,
            resetlogs: state.resetlogs,
            activation: state.activation,
            min_tran,
            supp_log_db_primary: state.supp_log_db_primary,
            supp_log_db_all: state.supp_log_db_all,
            online_redo: state.online_redo.clone(),
            incarnations: state.incarnations.clone(),
            users: state.users.clone(),
            schema_scn: if full_schema { Some(scn) } else { None },
            schema_ref_scn: if full_schema { None } else { state.last_full_schema_scn },
            schema: if full_schema { Some(schema_guard.clone()) } else { None },
        };

        self.store.lock().save(&doc, self.keep_checkpoints)?;

        state.checkpoint_scn = scn;
        state.checkpoints += 1;
        if full_schema {
            state.last_full_schema_scn = Some(scn);
            state.writes_since_full_schema = 0;
            schema_guard.touched = false;
        } else {
            state.writes_since_full_schema += 1;
        }
        Ok(true)
    }

    /// Recover position and schema from the newest usable checkpoint.
    /// `start_scn` bounds the search; NONE means "newest overall".
    pub fn resume(&self, start_scn: Scn) -> Result<Option<ResumePosition>> {
        let doc = match self.store.lock().resume(start_scn)? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        if doc.database != self.database {
            return Err(ReplError::data(
                20009,
                format!("checkpoint belongs to database: {}", doc.database),
            ));
        }

        {
            let mut schema = self.schema.lock();
            if let Some(loaded) = doc.schema {
                *schema = loaded;
            }
        }
        let mut state = self.checkpoint.lock();
        state.sequence = doc.seq;
        state.file_offset = doc.offset;
        state.resetlogs = doc.resetlogs;
        state.activation = doc.activation;
        state.first_data_scn = doc.scn;
        state.supp_log_db_primary = doc.supp_log_db_primary;
        state.supp_log_db_all = doc.supp_log_db_all;
        state.online_redo = doc.online_redo;
        state.incarnations = doc.incarnations;
        state.users = doc.users;
        state.checkpoint_scn = doc.scn;

        info!(
            "resuming database: {} at scn: {} seq: {} offset: {}",
            self.database, doc.scn, doc.seq, doc.offset
        );
        Ok(Some(ResumePosition { scn: doc.scn, seq: doc.seq, offset: doc.offset }))
    }
}
