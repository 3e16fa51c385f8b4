//! Error taxonomy.
//!
//! Every failure carries a numeric code in one of the documented
//! ranges: 10xxx runtime (I/O, threads, allocation), 20xxx data
//! (malformed JSON, bad identifiers), 30xxx configuration, 40xxx redo
//! stream, 50xxx internal. Recoverable anomalies (the 60xxx range) are
//! logged as warnings with their code and do not surface as `Err`
//! values.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReplError>;

/// Replication error with a numeric code.
#[derive(Error, Debug)]
pub enum ReplError {
    /// Runtime failure: I/O, thread spawn, memory, timezone (10xxx).
    #[error("[{code}] {msg}")]
    Runtime { code: u32, msg: String },

    /// I/O failure with the originating error attached (10xxx).
    #[error("[{code}] {context}: {source}")]
    Io {
        code: u32,
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed data: config/checkpoint JSON, identifiers (20xxx).
    #[error("[{code}] {msg}")]
    Data { code: u32, msg: String },

    /// JSON parse failure in a config or state document (20xxx).
    #[error("[{code}] {context}: {source}")]
    Json {
        code: u32,
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid configuration values or combinations (30xxx).
    #[error("[{code}] {msg}")]
    Config { code: u32, msg: String },

    /// Invalid redo stream content: block, header, checksum (40xxx).
    #[error("[{code}] {msg}")]
    Redo { code: u32, msg: String },

    /// Impossible state; always terminal (50xxx).
    #[error("[{code}] {msg} - please report this issue")]
    Internal { code: u32, msg: String },
}

impl ReplError {
    pub fn runtime(code: u32, msg: impl Into<String>) -> Self {
        Self::Runtime { code, msg: msg.into() }
    }

    pub fn io(code: u32, context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { code, context: context.into(), source }
    }

    pub fn data(code: u32, msg: impl Into<String>) -> Self {
        Self::Data { code, msg: msg.into() }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json { code: 20001, context: context.into(), source }
    }

    pub fn config(code: u32, msg: impl Into<String>) -> Self {
        Self::Config { code, msg: msg.into() }
    }

    pub fn redo(code: u32, msg: impl Into<String>) -> Self {
        Self::Redo { code, msg: msg.into() }
    }

    pub fn internal(code: u32, msg: impl Into<String>) -> Self {
        Self::Internal { code, msg: msg.into() }
    }

    /// Malformed XID string (20003).
    pub fn bad_xid(text: &str) -> Self {
        Self::data(20003, format!("bad XID value: {text}"))
    }

    /// Identifier exceeding the 128 character limit (20004).
    pub fn identifier_too_long(what: &str, value: &str) -> Self {
        Self::data(20004, format!("{what} too long ({} characters): {value}", value.len()))
    }

    /// The numeric error code.
    pub fn code(&self) -> u32 {
        match self {
            Self::Runtime { code, .. }
            | Self::Io { code, .. }
            | Self::Data { code, .. }
            | Self::Json { code, .. }
            | Self::Config { code, .. }
            | Self::Redo { code, .. }
            | Self::Internal { code, .. } => *code,
        }
    }

    /// Whether the error is in the redo range, meaning the current
    /// file is abandoned but the replicator may continue.
    pub fn is_redo(&self) -> bool {
        matches!(self, Self::Redo { .. })
    }

    /// Whether the error is survivable under `IGNORE_DATA_ERRORS`.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. } | Self::Json { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_land_in_their_ranges() {
        assert_eq!(ReplError::runtime(10006, "x").code(), 10006);
        assert_eq!(ReplError::bad_xid("zz").code(), 20003);
        assert_eq!(ReplError::config(30001, "x").code(), 30001);
        assert_eq!(ReplError::redo(40001, "x").code(), 40001);
        assert_eq!(ReplError::internal(50055, "x").code(), 50055);
    }

    #[test]
    fn display_carries_code_and_context() {
        let err = ReplError::redo(40005, "file: a.log - invalid block size: 600");
        assert_eq!(err.to_string(), "[40005] file: a.log - invalid block size: 600");

        let err = ReplError::internal(50055, "lwn overflow: 3/2");
        assert!(err.to_string().contains("please report"));
    }

    #[test]
    fn io_error_keeps_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = ReplError::io(10006, "file: redo01.log - open for reading", inner);
        assert!(err.to_string().contains("redo01.log"));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn classification() {
        assert!(ReplError::redo(40002, "x").is_redo());
        assert!(ReplError::data(20004, "x").is_data());
        assert!(!ReplError::config(30001, "x").is_data());
    }

    #[test]
    fn identifier_limit_message() {
        let long = "A".repeat(200);
        let err = ReplError::identifier_too_long("table name", &long);
        assert_eq!(err.code(), 20004);
        assert!(err.to_string().contains("200 characters"));
    }
}
