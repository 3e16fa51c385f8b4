//! Pipeline orchestration.
//!
//! The replicator owns the long-lived pieces (memory manager,
//! metadata, transaction buffer, builder) and walks redo files in
//! sequence order, creating a reader and a parser per file. Batch
//! mode processes an explicit file list; offline mode discovers
//! archived logs in a directory. Online/standby attachment uses the
//! same reader contract and is provided by an external process
//! manager.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::builder::Builder;
use crate::common::config::{DisableChecks, ReaderType, RedoFlags, SourceConfig};
use crate::common::errors::{ReplError, Result};
use crate::common::memory::{MemoryManager, CHUNK_SIZE};
use crate::common::metrics as metric;
use crate::common::types::{FileOffset, Scn, Seq};
use crate::metadata::{Metadata, Status};
use crate::parser::{EmitTracker, Parser, ParserOptions};
use crate::reader::file::{FileReader, ReaderOptions};
use crate::reader::RedoCode;
use crate::txn::TransactionBuffer;

/// Two-phase shutdown control, shared with the signal handler.
#[derive(Default)]
pub struct ShutdownHandle {
    soft: AtomicBool,
    hard: AtomicBool,
    current_reader: Mutex<Option<Arc<FileReader>>>,
}

impl ShutdownHandle {
    /// Finish the current work unit, write a final checkpoint, exit.
    pub fn stop_soft(&self) {
        self.soft.store(true, Ordering::Release);
        if let Some(reader) = self.current_reader.lock().as_ref() {
            reader.initiate_shutdown();
        }
    }

    /// Exit at the next flag check; no final checkpoint.
    pub fn stop_hard(&self) {
        self.hard.store(true, Ordering::Release);
        self.stop_soft();
    }

    pub fn soft_requested(&self) -> bool {
        self.soft.load(Ordering::Acquire)
    }

    pub fn hard_requested(&self) -> bool {
        self.hard.load(Ordering::Acquire)
    }
}

pub struct Replicator {
    config: SourceConfig,
    mm: Arc<MemoryManager>,
    metadata: Arc<Metadata>,
    buffer: TransactionBuffer,
    builder: Box<dyn Builder>,
    tracker: EmitTracker,
    shutdown: Arc<ShutdownHandle>,
}

impl Replicator {
    pub fn new(config: SourceConfig, builder: Box<dyn Builder>) -> Result<Replicator> {
        let swap_path = PathBuf::from(&config.memory.swap_path);
        let mm = MemoryManager::new(
            &config.name,
            config.memory.min_mb,
            config.memory.max_mb,
            &swap_path,
            config.flags,
        )?;
        let metadata = Arc::new(Metadata::new(
            Path::new(&config.state.path),
            &config.name,
            config.keep_checkpoints,
        )?);
        let buffer = TransactionBuffer::new(Arc::clone(&mm));
        Ok(Replicator {
            config,
            mm,
            metadata,
            buffer,
            builder,
            tracker: EmitTracker::new(),
            shutdown: Arc::new(ShutdownHandle::default()),
        })
    }

    pub fn shutdown_handle(&self) -> Arc<ShutdownHandle> {
        Arc::clone(&self.shutdown)
    }

    pub fn metadata(&self) -> Arc<Metadata> {
        Arc::clone(&self.metadata)
    }

    pub fn memory(&self) -> Arc<MemoryManager> {
        Arc::clone(&self.mm)
    }

    /// Chunks reserved for each reader's ring.
    fn ring_chunks(&self) -> usize {
        let configured = self
            .config
            .memory
            .read_buffer_max_mb
            .unwrap_or(self.config.memory.max_mb / 4)
            .max(2);
        (configured as usize * 1024 * 1024 / CHUNK_SIZE).clamp(2, 64)
    }

    fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            database: self.config.name.clone(),
            group: 0,
            verify_checksum: !self
                .config
                .reader
                .disable_checks
                .is_set(DisableChecks::BLOCK_SUM),
            redo_read_sleep_us: self.config.redo_read_sleep_us,
            redo_verify_delay_us: self.config.redo_verify_delay_us,
            ring_chunks: self.ring_chunks(),
            copy_path: self.config.reader.redo_copy_path.as_ref().map(PathBuf::from),
        }
    }

    fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            flags: self.config.flags,
            transaction_max_mb: self.config.transaction_max_mb,
        }
    }

    /// Run the pipeline to completion (batch/offline) or until
    /// shutdown. Returns cleanly only after a drained stop.
    pub fn run(&mut self) -> Result<()> {
        let mm_handle = self.mm.spawn()?;
        self.metadata.set_status(Status::Start);

        let result = self.run_inner();

        self.mm.initiate_shutdown();
        if mm_handle.join().is_err() {
            warn!("memory manager thread panicked");
        }
        self.metadata.set_status(Status::Ready);
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        // Position: checkpoint first, then explicit start options.
        let requested_scn = self.config.start_scn();
        match self.metadata.resume(requested_scn)? {
            Some(position) => {
                info!(
                    "client requested start: {requested_scn}, resuming from checkpoint at scn: {}",
                    position.scn
                );
            }
            None => {
                let first_data = if requested_scn.is_none() { Scn::zero() } else { requested_scn };
                self.metadata.set_first_data_scn(first_data);
                if !self.config.start_seq().is_none() {
                    self.metadata.set_sequence(self.config.start_seq());
                }
                info!("starting fresh with first data scn: {first_data}");
            }
        }

        let files = self.discover_files()?;
        if files.is_empty() {
            return Err(ReplError::config(30001, "no redo log files to process"));
        }

        self.process_files(files)
    }

    /// Map file paths to their header sequence, checking every file.
    fn discover_files(&mut self) -> Result<BTreeMap<Seq, PathBuf>> {
        let mut paths: Vec<PathBuf> = match self.config.reader.reader_type {
            ReaderType::Batch => self.config.reader.redo_log.iter().map(PathBuf::from).collect(),
            ReaderType::Offline => {
                let dir = self.config.reader.log_archive_path.clone().ok_or_else(|| {
                    ReplError::config(30001, "offline reader requires log-archive-path")
                })?;
                let mut found = Vec::new();
                let entries = std::fs::read_dir(&dir)
                    .map_err(|e| ReplError::io(10012, format!("directory: {dir} - can't read"), e))?;
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "arc") {
                        found.push(path);
                    }
                }
                found
            }
            ReaderType::Online | ReaderType::Standby => {
                return Err(ReplError::config(
                    30001,
                    "online attachment requires a database connection, use batch or offline",
                ));
            }
        };
        paths.sort();

        let mut files = BTreeMap::new();
        for path in paths {
            let reader = FileReader::new(Arc::clone(&self.mm), self.reader_options());
            let handle = reader.spawn()?;
            let code = reader.check(&path, Seq::none());
            let sequence = reader.sequence();
            reader.initiate_shutdown();
            let _ = handle.join();

            match code {
                RedoCode::Ok => {
                    debug!("discovered redo log: {} seq: {sequence}", path.display());
                    files.insert(sequence, path);
                }
                RedoCode::Empty => {
                    debug!("skipping empty redo log: {}", path.display());
                }
                code => {
                    return Err(ReplError::redo(
                        40011,
                        format!("file: {} - header check failed: {}", path.display(), code.name()),
                    ));
                }
            }
        }
        Ok(files)
    }

    fn process_files(&mut self, files: BTreeMap<Seq, PathBuf>) -> Result<()> {
        let resume_seq = self.metadata.sequence();
        let mut expected: Option<Seq> = None;

        for (sequence, path) in files {
            if self.shutdown.soft_requested() {
                break;
            }
            if !resume_seq.is_none() && sequence < resume_seq {
                debug!("skipping already-processed sequence: {sequence}");
                continue;
            }
            if let Some(expected) = expected {
                if sequence != expected {
                    return Err(ReplError::runtime(
                        10065,
                        format!("files are missing for sequence: {expected}"),
                    ));
                }
            }

            let code = self.process_file(&path, sequence)?;
            counter!(metric::LOG_SWITCHES, "type" => "archived").increment(1);
            match code {
                RedoCode::Finished => {
                    self.metadata.set_sequence(sequence.next());
                    expected = Some(sequence.next());
                }
                RedoCode::Shutdown => break,
                RedoCode::Stopped | RedoCode::Overwritten => {
                    warn!(
                        code = 10065,
                        "redo log incomplete: {} at sequence: {sequence}",
                        path.display()
                    );
                    break;
                }
                code => {
                    return Err(ReplError::redo(
                        40011,
                        format!("file: {} - ended with: {}", path.display(), code.name()),
                    ));
                }
            }
        }
        Ok(())
    }

    fn process_file(&mut self, path: &Path, sequence: Seq) -> Result<RedoCode> {
        let reader = FileReader::new(Arc::clone(&self.mm), self.reader_options());
        let handle = reader.spawn()?;
        *self.shutdown.current_reader.lock() = Some(Arc::clone(&reader));

        let code = reader.check(path, Seq::none());
        if code != RedoCode::Ok {
            reader.initiate_shutdown();
            let _ = handle.join();
            return Err(ReplError::redo(
                40011,
                format!("file: {} - open failed: {}", path.display(), code.name()),
            ));
        }
        self.metadata.set_sequence(sequence);
        self.metadata.set_status(Status::Replicate);

        let parser_options = self.parser_options();
        let mut parser = Parser::new(
            Arc::clone(&self.mm),
            Arc::clone(&self.metadata),
            &self.buffer,
            self.builder.as_mut(),
            Arc::clone(&reader),
            &mut self.tracker,
            parser_options,
            0,
        );
        let result = parser.parse();

        *self.shutdown.current_reader.lock() = None;
        reader.initiate_shutdown();
        let _ = handle.join();
        gauge!(metric::LOG_SWITCHES_LAG, "type" => "archived").set(0.0);

        if self.shutdown.hard_requested() {
            return Ok(RedoCode::Shutdown);
        }
        result
    }
}
