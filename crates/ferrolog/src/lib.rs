//! # ferrolog - Change Data Capture for Oracle redo logs
//!
//! Ferrolog extracts committed row-level changes from an Oracle database
//! by reading and decoding the binary redo log files directly - no
//! LogMiner, no triggers, minimal impact on the source instance.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   blocks   ┌──────────┐   events   ┌──────────┐
//! │  Reader  ├───────────►│  Parser  ├───────────►│ Builder  │
//! └────┬─────┘            └────┬─────┘            └────┬─────┘
//!      │                       │                       │
//!      │ ring buffer           │ XID chains            │ messages
//!      ▼                       ▼                       ▼
//! ┌──────────┐            ┌──────────┐            ┌──────────┐
//! │  Memory  │◄───swap────┤   Txn    │            │  Writer  │
//! │  Manager │            │  Buffer  │            └────┬─────┘
//! └──────────┘            └──────────┘                 │
//!                              ▲            confirmed scn
//!                         ┌────┴─────┐◄────────────────┘
//!                         │ Metadata │
//!                         └──────────┘
//! ```
//!
//! The reader validates and streams redo blocks into a ring of memory
//! chunks. The parser groups physical redo vectors into log-write-network
//! (LWN) batches and drives a per-transaction state machine in the
//! transaction buffer. Committed transactions are replayed to a
//! [`builder::Builder`] in commit-SCN order; after every drained batch a
//! checkpoint ties the bytes-read position to the committed SCN
//! watermark so a restart resumes without loss or duplication beyond
//! at-least-once.

pub mod builder;
pub mod common;
pub mod metadata;
pub mod parser;
pub mod reader;
pub mod replicator;
pub mod txn;
pub mod writer;

pub use common::config::Config;
pub use common::errors::{ReplError, Result};
pub use common::types::{FileOffset, Scn, Seq, Xid};
pub use replicator::Replicator;
