//! Redo stream parsing.
//!
//! [`Parser`] consumes validated blocks from a reader, assembles LWN
//! batches, decodes vectors and drives the transaction state machine.
//! Committed transactions are replayed to the builder; after every
//! fully-drained batch a checkpoint is produced.

pub mod lwn;
pub mod opcode;
pub mod row;

mod engine;

pub use engine::{EmitTracker, Parser, ParserOptions};
pub use opcode::OpCode;
pub use row::{RowImage, RowOp};
