//! ferrologd - the Ferrolog replication daemon.
//!
//! Loads a JSON configuration, wires writer -> builder -> replicator
//! and runs the pipeline until the redo stream ends or a signal asks
//! for shutdown. The first SIGINT/SIGTERM drains the current work
//! unit and writes a final checkpoint; the second aborts without one.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser as ClapParser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ferrolog::builder::{Builder, JsonBuilder};
use ferrolog::common::config::{Config, LogLevel, RedoFlags, WriterType};
use ferrolog::replicator::ShutdownHandle;
use ferrolog::writer::{ConfirmedWatermark, DiscardWriter, FileWriter, Writer};
use ferrolog::Replicator;

#[derive(ClapParser)]
#[command(name = "ferrologd")]
#[command(version)]
#[command(about = "Change data capture for Oracle redo logs")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "ferrolog.json")]
    file: PathBuf,

    /// Process name shown by the OS
    #[arg(short, long)]
    process: Option<String>,

    /// Allow running as the superuser (not recommended)
    #[arg(short, long)]
    root: bool,
}

/// SIGINT/SIGTERM arrivals; the handler must stay async-signal-safe.
static SIGNALS_SEEN: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALS_SEEN.fetch_add(1, Ordering::AcqRel);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn watch_signals(shutdown: Arc<ShutdownHandle>) {
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let mut handled = 0;
            loop {
                let seen = SIGNALS_SEEN.load(Ordering::Acquire);
                if seen > handled {
                    handled = seen;
                    if seen == 1 {
                        info!("shutdown requested, draining current work");
                        shutdown.stop_soft();
                    } else {
                        warn!("second signal, aborting without final checkpoint");
                        shutdown.stop_hard();
                        return;
                    }
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        })
        .expect("spawning signal watcher");
}

fn refuse_root(allow: bool) -> anyhow::Result<()> {
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        if !allow {
            bail!("[10020] program is run as root, you should never do that");
        }
        warn!(code = 10020, "program is run as root, you should never do that");
    }
    Ok(())
}

fn log_filter(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Silent => "off",
        LogLevel::Error => "error",
        LogLevel::Warning => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    }
}

/// Log timestamps honor `OLR_LOG_TIMEZONE` (e.g. `+05:30`).
struct OffsetTimer(chrono::FixedOffset);

impl tracing_subscriber::fmt::time::FormatTime for OffsetTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now().with_timezone(&self.0);
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

fn parse_log_timezone() -> chrono::FixedOffset {
    let fallback = chrono::FixedOffset::east_opt(0).expect("zero offset");
    let Ok(raw) = std::env::var("OLR_LOG_TIMEZONE") else {
        return fallback;
    };
    let (sign, rest) = match raw.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, raw.strip_prefix('+').unwrap_or(&raw)),
    };
    let seconds = match rest.split_once(':') {
        Some((h, m)) => h
            .parse::<i32>()
            .ok()
            .zip(m.parse::<i32>().ok())
            .map(|(h, m)| h * 3600 + m * 60),
        None => rest.parse::<i32>().ok().map(|h| h * 3600),
    };
    match seconds.and_then(|s| chrono::FixedOffset::east_opt(sign * s)) {
        Some(offset) => offset,
        None => {
            eprintln!("[10021] invalid OLR_LOG_TIMEZONE value: {raw}");
            fallback
        }
    }
}

fn set_process_name(name: &str) {
    #[cfg(target_os = "linux")]
    {
        let truncated: Vec<u8> = name.bytes().take(15).chain(std::iter::once(0)).collect();
        // SAFETY: buffer is NUL terminated and outlives the call.
        unsafe { libc::prctl(libc::PR_SET_NAME, truncated.as_ptr()) };
    }
    #[cfg(not(target_os = "linux"))]
    let _ = name;
}

fn build_pipeline(config: Config) -> anyhow::Result<Replicator> {
    let source = config.source.into_iter().next().context("source config")?;
    let target = config.target.into_iter().next().context("target config")?;

    let confirmed = ConfirmedWatermark::new();
    let writer: Box<dyn Writer> = match target.writer_type {
        WriterType::File => Box::new(FileWriter::new(
            target.output.clone(),
            target.max_file_size,
            target.append,
            target.new_line,
            Arc::clone(&confirmed),
        )?),
        WriterType::Discard => Box::new(DiscardWriter::new(Arc::clone(&confirmed))),
        other => bail!("[30001] writer type not available in this build: {other:?}"),
    };

    let emit_checkpoints = source.flags.is_set(RedoFlags::SHOW_CHECKPOINT);
    let builder: Box<dyn Builder> =
        Box::new(JsonBuilder::new(writer, source.format.clone(), emit_checkpoints));

    Ok(Replicator::new(source, builder)?)
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mock_locales = std::env::var("OLR_LOCALES").is_ok_and(|v| v == "MOCK");

    let config = Config::from_file(&cli.file)
        .with_context(|| format!("loading configuration: {}", cli.file.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_filter(config.log_level))),
        )
        .with_timer(OffsetTimer(parse_log_timezone()))
        .init();

    refuse_root(cli.root)?;
    if let Some(name) = &cli.process {
        set_process_name(name);
    }
    if mock_locales {
        info!("deterministic locales enabled");
    }

    info!(
        "ferrolog {} starting, database: {}",
        env!("CARGO_PKG_VERSION"),
        config.source[0].name
    );

    let mut replicator = build_pipeline(config)?;
    install_signal_handlers();
    watch_signals(replicator.shutdown_handle());

    replicator.run()?;
    info!("shutdown complete");
    Ok(())
}

fn main() {
    match run() {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            // The subscriber may not be installed yet; print both ways.
            error!("{e:#}");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_all_flags() {
        let cli = Cli::try_parse_from([
            "ferrologd",
            "-f",
            "/etc/ferrolog.json",
            "-p",
            "repl-orcl",
            "--root",
        ])
        .unwrap();
        assert_eq!(cli.file, PathBuf::from("/etc/ferrolog.json"));
        assert_eq!(cli.process.as_deref(), Some("repl-orcl"));
        assert!(cli.root);
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["ferrologd"]).unwrap();
        assert_eq!(cli.file, PathBuf::from("ferrolog.json"));
        assert!(cli.process.is_none());
        assert!(!cli.root);
    }

    #[test]
    fn log_filter_mapping() {
        assert_eq!(log_filter(LogLevel::Silent), "off");
        assert_eq!(log_filter(LogLevel::Warning), "warn");
        assert_eq!(log_filter(LogLevel::Debug), "debug");
    }

    #[test]
    fn timezone_offsets_parse() {
        for (raw, expected_secs) in [
            ("+05:30", 5 * 3600 + 30 * 60),
            ("-08:00", -8 * 3600),
            ("3", 3 * 3600),
        ] {
            std::env::set_var("OLR_LOG_TIMEZONE", raw);
            assert_eq!(parse_log_timezone().local_minus_utc(), expected_secs, "{raw}");
        }
        std::env::set_var("OLR_LOG_TIMEZONE", "garbage");
        assert_eq!(parse_log_timezone().local_minus_utc(), 0);
        std::env::remove_var("OLR_LOG_TIMEZONE");
    }

    #[test]
    fn pipeline_builds_from_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let text = format!(
            r#"{{
                "version": "0.4.1",
                "source": [{{"alias": "S1", "name": "ORCL",
                    "reader": {{"type": "batch", "redo-log": ["/x.arc"]}},
                    "memory": {{"min-mb": 4, "max-mb": 8, "swap-path": "{dir}"}},
                    "state": {{"type": "disk", "path": "{dir}/state"}}}}],
                "target": [{{"alias": "T1", "source": "S1", "type": "discard"}}]
            }}"#,
            dir = dir.path().display()
        );
        let config = Config::from_json(&text).unwrap();
        assert!(build_pipeline(config).is_ok());
    }
}
