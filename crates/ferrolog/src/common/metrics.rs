//! Metric names.
//!
//! Counters and gauges are emitted through the `metrics` facade; the
//! daemon decides whether a recorder (e.g. a Prometheus exporter) is
//! installed. Label conventions: `type` distinguishes sub-kinds,
//! `filter` distinguishes out/skip/partial outcomes.

/// Bytes read from redo log files (counter).
pub const BYTES_READ: &str = "ferrolog_bytes_read";
/// Bytes consumed by the parser (counter).
pub const BYTES_PARSED: &str = "ferrolog_bytes_parsed";
/// Bytes confirmed by the writer (counter).
pub const BYTES_CONFIRMED: &str = "ferrolog_bytes_confirmed";
/// Bytes handed to the writer (counter).
pub const BYTES_SENT: &str = "ferrolog_bytes_sent";

/// Messages handed to the writer (counter).
pub const MESSAGES_SENT: &str = "ferrolog_messages_sent";
/// Messages confirmed by the writer (counter).
pub const MESSAGES_CONFIRMED: &str = "ferrolog_messages_confirmed";

/// Checkpoints, labelled `filter` = `out` | `skip` (counter).
pub const CHECKPOINTS: &str = "ferrolog_checkpoints";
/// Seconds between an LWN timestamp and its processing (gauge).
pub const CHECKPOINT_LAG: &str = "ferrolog_checkpoint_lag";

/// Redo log switches, labelled `type` = `online` | `archived` (counter).
pub const LOG_SWITCHES: &str = "ferrolog_log_switches";
/// Switch lag in seconds, labelled like [`LOG_SWITCHES`] (gauge).
pub const LOG_SWITCHES_LAG: &str = "ferrolog_log_switches_lag";

/// Transactions, labelled `type` = `commit` | `rollback` and
/// `filter` = `out` | `partial` | `skip` (counter).
pub const TRANSACTIONS: &str = "ferrolog_transactions";
/// DML operations, labelled `type` and `filter` (counter).
pub const DML_OPS: &str = "ferrolog_dml_ops";
/// DDL operations, labelled `type` (counter).
pub const DDL_OPS: &str = "ferrolog_ddl_ops";

/// Pool size in MiB (gauge).
pub const MEMORY_ALLOCATED_MB: &str = "ferrolog_memory_allocated_mb";
/// Per-module pool usage in MiB, labelled `type` (gauge).
pub const MEMORY_USED_MB: &str = "ferrolog_memory_used_mb";

/// Swap traffic in MiB, labelled `type` = `read` | `write` | `discard`
/// (counter).
pub const SWAP_OPERATIONS_MB: &str = "ferrolog_swap_operations_mb";
/// Currently swapped-out MiB (gauge).
pub const SWAP_USAGE_MB: &str = "ferrolog_swap_usage_mb";
