//! Message delivery.
//!
//! Writers take finished messages and return confirmation through a
//! shared watermark cell the rest of the pipeline reads without
//! locking. File and discard writers live in tree; Kafka and network
//! transports are external implementations of the same trait.

pub mod discard;
pub mod file;

pub use discard::DiscardWriter;
pub use file::FileWriter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::common::errors::Result;
use crate::common::types::Scn;

/// Latest `(scn, idx)` the downstream confirmed. Written by the
/// writer, read by the parser and the checkpointer.
#[derive(Debug, Default)]
pub struct ConfirmedWatermark {
    scn: AtomicU64,
    idx: AtomicU64,
}

impl ConfirmedWatermark {
    pub fn new() -> Arc<ConfirmedWatermark> {
        Arc::new(ConfirmedWatermark {
            scn: AtomicU64::new(Scn::none().value()),
            idx: AtomicU64::new(0),
        })
    }

    pub fn store(&self, scn: Scn, idx: u64) {
        // idx first: a reader pairing a newer scn with an older idx
        // would move the watermark backwards.
        self.idx.store(idx, Ordering::Release);
        self.scn.store(scn.value(), Ordering::Release);
    }

    pub fn load(&self) -> (Scn, u64) {
        let scn = Scn::new(self.scn.load(Ordering::Acquire));
        let idx = self.idx.load(Ordering::Acquire);
        (scn, idx)
    }

    pub fn is_set(&self) -> bool {
        !self.load().0.is_none()
    }
}

pub trait Writer: Send {
    /// Deliver one message. `(scn, idx)` identify it for confirmation.
    fn send(&mut self, scn: Scn, idx: u64, message: Bytes) -> Result<()>;

    /// Flush buffered output.
    fn flush(&mut self) -> Result<()>;
}
