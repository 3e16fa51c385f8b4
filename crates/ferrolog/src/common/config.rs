//! Configuration model.
//!
//! The configuration is a single JSON document with a `version`, an
//! optional `log-level`, one `source` and one `target`. Field names
//! are kebab-case. Unknown tags at any level are rejected (error
//! 30002) unless the JSON-tags check is disabled, mirroring the
//! per-object allow-list validation of the state files.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::errors::{ReplError, Result};
use crate::common::types::{Scn, Seq};

/// Feature flags (`flags` bitmask in the source config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedoFlags(pub u32);

impl RedoFlags {
    pub const ARCH_ONLY: u32 = 1 << 0;
    pub const SCHEMALESS: u32 = 1 << 1;
    pub const ADAPTIVE_SCHEMA: u32 = 1 << 2;
    pub const DIRECT_DISABLE: u32 = 1 << 3;
    pub const IGNORE_DATA_ERRORS: u32 = 1 << 4;
    pub const SHOW_DDL: u32 = 1 << 5;
    pub const SHOW_HIDDEN_COLUMNS: u32 = 1 << 6;
    pub const SHOW_INCOMPLETE_TRANSACTIONS: u32 = 1 << 10;
    pub const SHOW_CHECKPOINT: u32 = 1 << 12;
    pub const CHECKPOINT_KEEP: u32 = 1 << 13;
    pub const RAW_COLUMN_DATA: u32 = 1 << 15;

    pub fn is_set(self, mask: u32) -> bool {
        self.0 & mask != 0
    }
}

/// Consistency checks that can be switched off (`disable-checks`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisableChecks(pub u32);

impl DisableChecks {
    pub const GRANTS: u32 = 1 << 0;
    pub const SUPPLEMENTAL_LOG: u32 = 1 << 1;
    pub const BLOCK_SUM: u32 = 1 << 2;
    pub const JSON_TAGS: u32 = 1 << 3;

    pub fn is_set(self, mask: u32) -> bool {
        self.0 & mask != 0
    }
}

/// Log verbosity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

/// Kind of redo source the reader attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderType {
    Online,
    Offline,
    Batch,
    Standby,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReaderConfig {
    #[serde(rename = "type")]
    pub reader_type: ReaderType,
    #[serde(default)]
    pub start_scn: Option<u64>,
    #[serde(default)]
    pub start_seq: Option<u32>,
    #[serde(default)]
    pub start_time: Option<String>,
    /// Explicit redo file paths for batch mode.
    #[serde(default)]
    pub redo_log: Vec<String>,
    /// Mirror validated blocks to this directory, one file per sequence.
    #[serde(default)]
    pub redo_copy_path: Option<String>,
    /// Sequence discovery directory for offline mode.
    #[serde(default)]
    pub log_archive_path: Option<String>,
    #[serde(default)]
    pub disable_checks: DisableChecks,
}

fn default_memory_min_mb() -> u64 {
    32
}

fn default_memory_max_mb() -> u64 {
    1024
}

fn default_swap_path() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemoryConfig {
    #[serde(default = "default_memory_min_mb")]
    pub min_mb: u64,
    #[serde(default = "default_memory_max_mb")]
    pub max_mb: u64,
    #[serde(default = "default_swap_path")]
    pub swap_path: String,
    /// Chunks reserved for the reader ring; defaults to a quarter of
    /// the maximum pool.
    #[serde(default)]
    pub read_buffer_max_mb: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            min_mb: default_memory_min_mb(),
            max_mb: default_memory_max_mb(),
            swap_path: default_swap_path(),
            read_buffer_max_mb: None,
        }
    }
}

fn default_state_type() -> String {
    "disk".to_string()
}

fn default_state_path() -> String {
    "checkpoint".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StateConfig {
    #[serde(rename = "type", default = "default_state_type")]
    pub state_type: String,
    #[serde(default = "default_state_path")]
    pub path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig { state_type: default_state_type(), path: default_state_path() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    #[default]
    Json,
    Protobuf,
}

/// One message per DML versus one message per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Single,
    Grouped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FormatConfig {
    #[serde(rename = "type", default)]
    pub format_type: FormatType,
    #[serde(default)]
    pub timestamp_format: Option<String>,
    #[serde(default)]
    pub timestamp_tz_format: Option<String>,
    /// Emit the commit SCN as a top-level key.
    #[serde(default)]
    pub scn_key: bool,
    /// Include session attributes captured from 5.11 vectors.
    #[serde(default)]
    pub attributes: bool,
    #[serde(default)]
    pub message_format: MessageFormat,
}

impl Default for FormatConfig {
    fn default() -> Self {
        FormatConfig {
            format_type: FormatType::Json,
            timestamp_format: None,
            timestamp_tz_format: None,
            scn_key: false,
            attributes: false,
            message_format: MessageFormat::Single,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableFilter {
    pub owner: String,
    pub table: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FilterConfig {
    #[serde(default)]
    pub table: Vec<TableFilter>,
}

fn default_redo_read_sleep_us() -> u64 {
    50_000
}

fn default_arch_read_tries() -> u32 {
    10
}

fn default_keep_checkpoints() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
    pub alias: String,
    /// Database name; state files and swap files derive from it.
    pub name: String,
    pub reader: ReaderConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub format: FormatConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub flags: RedoFlags,
    #[serde(default)]
    pub transaction_max_mb: u64,
    #[serde(default = "default_redo_read_sleep_us")]
    pub redo_read_sleep_us: u64,
    #[serde(default)]
    pub redo_verify_delay_us: u64,
    #[serde(default = "default_keep_checkpoints")]
    pub keep_checkpoints: u64,
    #[serde(default = "default_arch_read_tries")]
    pub arch_read_tries: u32,
    #[serde(default)]
    pub write_buffer_max_mb: u64,
}

impl SourceConfig {
    pub fn start_scn(&self) -> Scn {
        self.reader.start_scn.map(Scn::new).unwrap_or_else(Scn::none)
    }

    pub fn start_seq(&self) -> Seq {
        self.reader.start_seq.map(Seq::new).unwrap_or_else(Seq::none)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterType {
    File,
    Kafka,
    Network,
    Zeromq,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetConfig {
    pub alias: String,
    pub source: String,
    #[serde(rename = "type")]
    pub writer_type: WriterType,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub append: bool,
    #[serde(default = "default_new_line")]
    pub new_line: bool,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub max_message_mb: Option<u64>,
}

fn default_new_line() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub log_level: LogLevel,
    pub source: Vec<SourceConfig>,
    pub target: Vec<TargetConfig>,
}

impl Config {
    /// Parse and validate a configuration document.
    pub fn from_json(text: &str) -> Result<Config> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ReplError::json("config file", e))?;

        let config: Config = serde_json::from_value(value.clone())
            .map_err(|e| ReplError::json("config file", e))?;

        let json_tags_disabled = config
            .source
            .first()
            .map(|s| s.reader.disable_checks.is_set(DisableChecks::JSON_TAGS))
            .unwrap_or(false);
        if !json_tags_disabled {
            check_tags(&value, "")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReplError::io(10001, format!("file: {} - read", path.display()), e))?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.source.len() != 1 {
            return Err(ReplError::config(30001, "exactly one source is required"));
        }
        if self.target.len() != 1 {
            return Err(ReplError::config(30001, "exactly one target is required"));
        }
        let source = &self.source[0];
        let target = &self.target[0];

        if target.source != source.alias {
            return Err(ReplError::config(
                30001,
                format!("target references unknown source: {}", target.source),
            ));
        }
        if source.name.len() > 128 {
            return Err(ReplError::identifier_too_long("database name", &source.name));
        }
        if source.memory.min_mb > source.memory.max_mb {
            return Err(ReplError::config(
                30001,
                format!(
                    "memory min-mb: {} larger than max-mb: {}",
                    source.memory.min_mb, source.memory.max_mb
                ),
            ));
        }
        if source.state.state_type != "disk" {
            return Err(ReplError::config(
                30001,
                format!("unsupported state type: {}", source.state.state_type),
            ));
        }
        if source.reader.reader_type == ReaderType::Batch && source.reader.redo_log.is_empty() {
            return Err(ReplError::config(30001, "batch reader requires redo-log file list"));
        }
        for filter in &source.filter.table {
            if filter.owner.len() > 128 || filter.table.len() > 128 {
                return Err(ReplError::identifier_too_long(
                    "filter table",
                    &format!("{}.{}", filter.owner, filter.table),
                ));
            }
        }

        match target.writer_type {
            WriterType::File => {
                if target.max_file_size == Some(0) {
                    return Err(ReplError::config(
                        30001,
                        "file rotation requires a non-zero max-file-size",
                    ));
                }
                if target.max_file_size.is_some() && target.output.is_none() {
                    return Err(ReplError::config(
                        30001,
                        "file rotation requires an output path pattern",
                    ));
                }
            }
            WriterType::Discard => {}
            WriterType::Kafka | WriterType::Network | WriterType::Zeromq => {
                return Err(ReplError::config(
                    30001,
                    format!("writer type not available in this build: {:?}", target.writer_type),
                ));
            }
        }
        Ok(())
    }
}

/// Allow-list validation of every object key in the document, the same
/// way the state reader validates its files.
fn check_tags(value: &Value, path: &str) -> Result<()> {
    let allowed: &[&str] = match path {
        "" => &["version", "log-level", "source", "target"],
        "source" => &[
            "alias",
            "name",
            "reader",
            "memory",
            "state",
            "format",
            "filter",
            "flags",
            "transaction-max-mb",
            "redo-read-sleep-us",
            "redo-verify-delay-us",
            "keep-checkpoints",
            "arch-read-tries",
            "write-buffer-max-mb",
        ],
        "source.reader" => &[
            "type",
            "start-scn",
            "start-seq",
            "start-time",
            "redo-log",
            "redo-copy-path",
            "log-archive-path",
            "disable-checks",
        ],
        "source.memory" => &["min-mb", "max-mb", "swap-path", "read-buffer-max-mb"],
        "source.state" => &["type", "path"],
        "source.format" => &[
            "type",
            "timestamp-format",
            "timestamp-tz-format",
            "scn-key",
            "attributes",
            "message-format",
        ],
        "source.filter" => &["table"],
        "source.filter.table" => &["owner", "table", "key", "condition", "tag"],
        "target" => &[
            "alias",
            "source",
            "type",
            "output",
            "max-file-size",
            "append",
            "new-line",
            "topic",
            "uri",
            "max-message-mb",
            "properties",
        ],
        "target.properties" => return Ok(()),
        _ => return Ok(()),
    };

    if let Value::Object(map) = value {
        let known: HashSet<&str> = allowed.iter().copied().collect();
        for (key, child) in map {
            if !known.contains(key.as_str()) {
                return Err(ReplError::config(
                    30002,
                    format!("unknown tag: {key} at: /{path}"),
                ));
            }
            let child_path = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
            match child {
                Value::Object(_) => check_tags(child, &child_path)?,
                Value::Array(items) => {
                    for item in items {
                        if item.is_object() {
                            check_tags(item, &child_path)?;
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}
