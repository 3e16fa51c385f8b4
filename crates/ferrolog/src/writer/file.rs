//! File writer.
//!
//! Appends messages to a file (or standard output), optionally
//! rotating at `max-file-size`. Confirmation is immediate: a message
//! written to the file counts as delivered.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tracing::info;

use crate::common::errors::{ReplError, Result};
use crate::common::metrics as metric;
use crate::common::types::Scn;
use crate::writer::{ConfirmedWatermark, Writer};

#[derive(Debug)]
enum Output {
    Stdout,
    File { file: File, written: u64 },
}

#[derive(Debug)]
pub struct FileWriter {
    /// Output path; `%i` expands to the rotation counter.
    pattern: Option<String>,
    max_file_size: Option<u64>,
    append: bool,
    new_line: bool,
    rotation: u32,
    output: Option<Output>,
    confirmed: Arc<ConfirmedWatermark>,
}

impl FileWriter {
    pub fn new(
        pattern: Option<String>,
        max_file_size: Option<u64>,
        append: bool,
        new_line: bool,
        confirmed: Arc<ConfirmedWatermark>,
    ) -> Result<FileWriter> {
        if max_file_size.is_some() {
            let pattern_ok = pattern.as_deref().is_some_and(|p| p.contains("%i"));
            if !pattern_ok {
                return Err(ReplError::config(
                    30001,
                    "max-file-size requires an output pattern containing %i",
                ));
            }
        }
        Ok(FileWriter {
            pattern,
            max_file_size,
            append,
            new_line,
            rotation: 0,
            output: None,
            confirmed,
        })
    }

    fn current_path(&self) -> Option<PathBuf> {
        self.pattern
            .as_ref()
            .map(|p| PathBuf::from(p.replace("%i", &self.rotation.to_string())))
    }

    fn open_output(&mut self) -> Result<&mut Output> {
        if self.output.is_none() {
            let output = match self.current_path() {
                None => Output::Stdout,
                Some(path) => {
                    let file = OpenOptions::new()
                        .create(true)
                        .write(true)
                        .append(self.append)
                        .truncate(!self.append)
                        .open(&path)
                        .map_err(|e| {
                            ReplError::io(
                                10006,
                                format!("file: {} - open for writing", path.display()),
                                e,
                            )
                        })?;
                    let written = if self.append {
                        file.metadata().map(|m| m.len()).unwrap_or(0)
                    } else {
                        0
                    };
                    info!("output file: {}", path.display());
                    Output::File { file, written }
                }
            };
            self.output = Some(output);
        }
        Ok(self.output.as_mut().expect("just opened"))
    }

    fn rotate_if_needed(&mut self, next_len: u64) -> Result<()> {
        let Some(max) = self.max_file_size else {
            return Ok(());
        };
        let should_rotate = matches!(
            self.output,
            Some(Output::File { written, .. }) if written + next_len > max
        );
        if should_rotate {
            self.output = None;
            self.rotation += 1;
        }
        Ok(())
    }
}

impl Writer for FileWriter {
    fn send(&mut self, scn: Scn, idx: u64, message: Bytes) -> Result<()> {
        let extra = if self.new_line { 1 } else { 0 };
        self.rotate_if_needed(message.len() as u64 + extra)?;

        let new_line = self.new_line;
        match self.open_output()? {
            Output::Stdout => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                lock.write_all(&message)
                    .and_then(|()| if new_line { lock.write_all(b"\n") } else { Ok(()) })
                    .map_err(|e| ReplError::io(10007, "stdout - write", e))?;
            }
            Output::File { file, written } => {
                file.write_all(&message)
                    .and_then(|()| if new_line { file.write_all(b"\n") } else { Ok(()) })
                    .map_err(|e| ReplError::io(10007, "output file - write", e))?;
                *written += message.len() as u64 + extra;
            }
        }

        counter!(metric::MESSAGES_SENT).increment(1);
        counter!(metric::BYTES_SENT).increment(message.len() as u64);
        counter!(metric::MESSAGES_CONFIRMED).increment(1);
        counter!(metric::BYTES_CONFIRMED).increment(message.len() as u64);
        self.confirmed.store(scn, idx);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(Output::File { file, .. }) = self.output.as_mut() {
            file.flush().map_err(|e| ReplError::io(10007, "output file - flush", e))?;
        }
        Ok(())
    }
}
