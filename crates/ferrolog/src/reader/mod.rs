//! Redo log file reading.
//!
//! The reader owns blocking file I/O on its own thread, validates
//! every block and publishes verified bytes into a ring of pool
//! chunks. The parser consumes the ring strictly in order and
//! confirms consumed bytes back, which is the reader's backpressure
//! signal.

pub mod block;
pub mod file;

pub use block::{BlockCheck, RedoHeader};
pub use file::{FileReader, WaitOutcome};

/// Terminal outcome of a reader interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoCode {
    Ok,
    /// Online log was rotated away while reading.
    Overwritten,
    /// End of file with a known next SCN; the sequence continues.
    Finished,
    /// End of data without a next SCN (in-progress or truncated log).
    Stopped,
    Shutdown,
    /// Nothing (new) to read yet.
    Empty,
    ErrorRead,
    ErrorWrite,
    ErrorSequence,
    ErrorCrc,
    ErrorBlock,
    ErrorBadData,
    Error,
}

impl RedoCode {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            RedoCode::ErrorRead
                | RedoCode::ErrorWrite
                | RedoCode::ErrorSequence
                | RedoCode::ErrorCrc
                | RedoCode::ErrorBlock
                | RedoCode::ErrorBadData
                | RedoCode::Error
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            RedoCode::Ok => "OK",
            RedoCode::Overwritten => "OVERWRITTEN",
            RedoCode::Finished => "FINISHED",
            RedoCode::Stopped => "STOPPED",
            RedoCode::Shutdown => "SHUTDOWN",
            RedoCode::Empty => "EMPTY",
            RedoCode::ErrorRead => "READ ERROR",
            RedoCode::ErrorWrite => "WRITE ERROR",
            RedoCode::ErrorSequence => "SEQUENCE ERROR",
            RedoCode::ErrorCrc => "CRC ERROR",
            RedoCode::ErrorBlock => "BLOCK ERROR",
            RedoCode::ErrorBadData => "BAD DATA ERROR",
            RedoCode::Error => "OTHER ERROR",
        }
    }
}
