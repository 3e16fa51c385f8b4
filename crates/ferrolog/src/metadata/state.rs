//! Disk-backed state store.
//!
//! Checkpoint documents are plain files under the configured state
//! path. Writes go to a temporary file first and are renamed into
//! place, so a crash never leaves a half-written document behind.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::common::errors::{ReplError, Result};

pub struct DiskState {
    dir: PathBuf,
}

impl DiskState {
    pub fn new(dir: impl AsRef<Path>) -> Result<DiskState> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| ReplError::io(10012, format!("directory: {} - create", dir.display()), e))?;
        Ok(DiskState { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Atomically persist `content` under `name`.
    pub fn write(&self, name: &str, content: &str) -> Result<()> {
        let target = self.path_for(name);
        let temp = self.dir.join(format!("{name}.json.tmp"));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .map_err(|e| ReplError::io(10006, format!("file: {} - open for writing", temp.display()), e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| ReplError::io(10007, format!("file: {} - write", temp.display()), e))?;
        file.sync_all()
            .map_err(|e| ReplError::io(10007, format!("file: {} - sync", temp.display()), e))?;
        drop(file);

        fs::rename(&temp, &target)
            .map_err(|e| ReplError::io(10007, format!("file: {} - rename", target.display()), e))?;
        debug!("state written: {}", target.display());
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    /// Read a document, bounded by `max_size` bytes.
    pub fn read(&self, name: &str, max_size: u64) -> Result<String> {
        let path = self.path_for(name);
        let file = File::open(&path)
            .map_err(|e| ReplError::io(10001, format!("file: {} - open for reading", path.display()), e))?;
        let meta = file
            .metadata()
            .map_err(|e| ReplError::io(10003, format!("file: {} - get metadata", path.display()), e))?;
        if meta.len() > max_size {
            return Err(ReplError::data(
                20002,
                format!("file: {} - too big: {} bytes", path.display(), meta.len()),
            ));
        }
        let mut content = String::with_capacity(meta.len() as usize);
        let mut file = file;
        file.read_to_string(&mut content)
            .map_err(|e| ReplError::io(10001, format!("file: {} - read", path.display()), e))?;
        Ok(content)
    }

    pub fn drop_file(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        fs::remove_file(&path)
            .map_err(|e| ReplError::io(10010, format!("file: {} - delete", path.display()), e))?;
        Ok(())
    }

    /// Names of all documents starting with `prefix`, without the
    /// `.json` suffix.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ReplError::io(10012, format!("directory: {} - can't read", self.dir.display()), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if stem.starts_with(prefix) {
                    names.push(stem.to_string());
                }
            }
        }
        Ok(names)
    }
}
