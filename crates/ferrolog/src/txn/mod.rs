//! Transaction assembly.
//!
//! The parser routes every decoded redo vector here. Open transactions
//! keep their vectors in chains of 1 MiB chunks owned by the memory
//! manager; commit replays the surviving DML pairs in arrival order
//! and rollback-to-savepoint marks matched pairs dead in place.

pub mod buffer;
pub mod chunk;
pub mod record;
pub mod transaction;

pub use buffer::{ReplayEntry, TransactionBuffer};
pub use record::{record_flags, RecordMeta};
pub use transaction::{Transaction, TxState};
