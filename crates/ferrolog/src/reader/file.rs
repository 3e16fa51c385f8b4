//! The file reader thread.
//!
//! Status cycle: `Sleeping -> Check -> Sleeping -> Read -> Sleeping`,
//! with `Update` re-reading the header of an online log in place. The
//! parser drives the transitions and blocks on the published
//! `buffer_end` watermark; the reader blocks when the ring is full
//! until the parser confirms consumed bytes.
//!
//! Two-phase reads tolerate online logs being written concurrently:
//! with a verify delay configured, freshly validated blocks are only
//! scanned (stamped with the read time) and re-read once the delay
//! has passed; blocks that match twice are published.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metrics::counter;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::common::errors::{ReplError, Result};
use crate::common::memory::{Chunk, MemoryManager, MemoryModule, CHUNK_SIZE};
use crate::common::metrics as metric;
use crate::common::types::{Endian, FileOffset, Scn, Seq, ZERO_BLOCK};
use crate::reader::block::{
    self, BlockCheck, BlockExpectation, RedoHeader,
};
use crate::reader::RedoCode;

/// CRC failures tolerated per position before giving up (the block
/// may be mid-write on an online log).
const CRC_RETRY_MAX: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Sleeping,
    Check,
    Update,
    Read,
}

/// Result of waiting for the published watermark to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// New bytes available up to this end offset.
    Data(u64),
    /// The reader finished the file with this code.
    Done(RedoCode),
}

pub struct ReaderOptions {
    pub database: String,
    /// 0 for archived/batch files, the group number for online logs.
    pub group: i64,
    pub verify_checksum: bool,
    pub redo_read_sleep_us: u64,
    pub redo_verify_delay_us: u64,
    /// Ring capacity in chunks.
    pub ring_chunks: usize,
    /// Mirror validated bytes to `<path>/<database>_<seq>.arc`.
    pub copy_path: Option<PathBuf>,
}

struct Shared {
    status: Status,
    ret: RedoCode,
    path: PathBuf,
    file: Option<File>,
    file_size: u64,
    header: Option<RedoHeader>,
    /// Sequence the caller expects; adopted from the header when none.
    sequence: Seq,
    buffer_start: u64,
    buffer_end: u64,
    buffer_scan: u64,
    ring: Vec<Option<Chunk>>,
    /// Read timestamps (micros) per ring block, for the verify delay.
    stamps: Vec<u64>,
}

/// Redo copy target; touched only by the reader thread, so its lock
/// never contends and is never held together with `shared`.
struct CopyState {
    file: Option<File>,
    sequence: Seq,
}

pub struct FileReader {
    mm: Arc<MemoryManager>,
    opts: ReaderOptions,
    shared: Mutex<Shared>,
    copy: Mutex<CopyState>,
    cond_reader: Condvar,
    cond_parser: Condvar,
    cond_buffer_full: Condvar,
    shutdown: AtomicBool,
}

impl FileReader {
    pub fn new(mm: Arc<MemoryManager>, opts: ReaderOptions) -> Arc<FileReader> {
        Arc::new(FileReader {
            mm,
            opts,
            shared: Mutex::new(Shared {
                status: Status::Sleeping,
                ret: RedoCode::Ok,
                path: PathBuf::new(),
                file: None,
                file_size: 0,
                header: None,
                sequence: Seq::none(),
                buffer_start: 0,
                buffer_end: 0,
                buffer_scan: 0,
                ring: Vec::new(),
                stamps: Vec::new(),
            }),
            copy: Mutex::new(CopyState { file: None, sequence: Seq::none() }),
            cond_reader: Condvar::new(),
            cond_parser: Condvar::new(),
            cond_buffer_full: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn spawn(self: &Arc<Self>) -> Result<std::thread::JoinHandle<()>> {
        let reader = Arc::clone(self);
        std::thread::Builder::new()
            .name("reader".to_string())
            .spawn(move || reader.run())
            .map_err(|e| ReplError::io(10013, "spawning reader thread", e))
    }

    pub fn initiate_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond_reader.notify_all();
        self.cond_parser.notify_all();
        self.cond_buffer_full.notify_all();
    }

    // --- parser-facing control ------------------------------------------

    /// Attach to a file and validate its header. Blocks until done.
    pub fn check(&self, path: &Path, sequence: Seq) -> RedoCode {
        {
            let mut shared = self.shared.lock();
            shared.path = path.to_path_buf();
            shared.sequence = sequence;
            shared.status = Status::Check;
        }
        self.cond_reader.notify_all();
        self.wait_sleeping()
    }

    /// Re-read the header of the attached file.
    pub fn update(&self) -> RedoCode {
        self.shared.lock().status = Status::Update;
        self.cond_reader.notify_all();
        self.wait_sleeping()
    }

    /// Begin streaming from `start`, which must be block-aligned.
    pub fn start_read(&self, start: FileOffset) {
        {
            let mut shared = self.shared.lock();
            shared.buffer_start = start.value();
            shared.buffer_end = start.value();
            shared.buffer_scan = start.value();
            shared.status = Status::Read;
        }
        self.cond_reader.notify_all();
    }

    fn wait_sleeping(&self) -> RedoCode {
        let mut shared = self.shared.lock();
        while shared.status != Status::Sleeping && !self.shutdown.load(Ordering::Acquire) {
            self.cond_parser.wait_for(&mut shared, Duration::from_millis(100));
        }
        if self.shutdown.load(Ordering::Acquire) {
            return RedoCode::Shutdown;
        }
        shared.ret
    }

    /// Wait until bytes beyond `confirmed` are published, or the file
    /// ends.
    pub fn wait_for_data(&self, confirmed: u64) -> WaitOutcome {
        let mut shared = self.shared.lock();
        loop {
            if shared.buffer_end > confirmed {
                return WaitOutcome::Data(shared.buffer_end);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return WaitOutcome::Done(RedoCode::Shutdown);
            }
            if shared.status != Status::Read {
                return WaitOutcome::Done(shared.ret);
            }
            self.cond_parser.wait_for(&mut shared, Duration::from_millis(100));
        }
    }

    /// Confirm consumption up to `new_start`; frees fully consumed
    /// ring chunks and unblocks a full reader.
    pub fn confirm_read_data(&self, new_start: u64) {
        let mut freed = Vec::new();
        {
            let mut shared = self.shared.lock();
            if new_start <= shared.buffer_start {
                return;
            }
            let ring_len = shared.ring.len().max(1);
            let old_chunk = shared.buffer_start / CHUNK_SIZE as u64;
            let new_chunk = new_start / CHUNK_SIZE as u64;
            for chunk_no in old_chunk..new_chunk {
                let slot = (chunk_no as usize) % ring_len;
                if let Some(chunk) = shared.ring[slot].take() {
                    freed.push(chunk);
                }
            }
            shared.buffer_start = new_start;
        }
        for chunk in freed {
            self.mm.chunk_free(MemoryModule::Reader, chunk);
        }
        self.cond_buffer_full.notify_all();
    }

    /// Copy one published block out of the ring.
    pub fn copy_block(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let shared = self.shared.lock();
        if offset < shared.buffer_start || offset + out.len() as u64 > shared.buffer_end {
            return Err(ReplError::internal(
                50056,
                format!(
                    "block read outside window: {offset} not in {}-{}",
                    shared.buffer_start, shared.buffer_end
                ),
            ));
        }
        let ring_len = shared.ring.len();
        let slot = ((offset / CHUNK_SIZE as u64) as usize) % ring_len;
        let pos = (offset % CHUNK_SIZE as u64) as usize;
        match &shared.ring[slot] {
            Some(chunk) => {
                out.copy_from_slice(&chunk[pos..pos + out.len()]);
                Ok(())
            }
            None => Err(ReplError::internal(50056, format!("ring chunk missing at offset {offset}"))),
        }
    }

    pub fn header(&self) -> Option<RedoHeader> {
        self.shared.lock().header.clone()
    }

    pub fn block_size(&self) -> u32 {
        self.shared.lock().header.as_ref().map(|h| h.block_size).unwrap_or(0)
    }

    pub fn sequence(&self) -> Seq {
        self.shared.lock().sequence
    }

    pub fn next_scn(&self) -> Scn {
        self.shared.lock().header.as_ref().map(|h| h.next_scn).unwrap_or_else(Scn::none)
    }

    pub fn ret(&self) -> RedoCode {
        self.shared.lock().ret
    }

    pub fn buffer_start(&self) -> u64 {
        self.shared.lock().buffer_start
    }

    pub fn buffer_end(&self) -> u64 {
        self.shared.lock().buffer_end
    }

    // --- reader thread ---------------------------------------------------

    fn run(&self) {
        debug!("reader started");
        while !self.shutdown.load(Ordering::Acquire) {
            let status = {
                let mut shared = self.shared.lock();
                while shared.status == Status::Sleeping && !self.shutdown.load(Ordering::Acquire) {
                    self.cond_reader.wait_for(&mut shared, Duration::from_millis(100));
                }
                shared.status
            };
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let ret = match status {
                Status::Sleeping => continue,
                Status::Check => self.do_check(),
                Status::Update => self.do_update(),
                Status::Read => {
                    self.read_loop();
                    {
                        let mut shared = self.shared.lock();
                        shared.status = Status::Sleeping;
                    }
                    self.cond_parser.notify_all();
                    continue;
                }
            };
            {
                let mut shared = self.shared.lock();
                shared.ret = ret;
                shared.status = Status::Sleeping;
            }
            self.cond_parser.notify_all();
        }
        self.release_ring();
        debug!("reader stopped");
    }

    fn release_ring(&self) {
        let mut freed = Vec::new();
        {
            let mut shared = self.shared.lock();
            for slot in shared.ring.iter_mut() {
                if let Some(chunk) = slot.take() {
                    freed.push(chunk);
                }
            }
            shared.file = None;
        }
        self.copy.lock().file = None;
        for chunk in freed {
            self.mm.chunk_free(MemoryModule::Reader, chunk);
        }
    }

    fn do_check(&self) -> RedoCode {
        let path = self.shared.lock().path.clone();
        trace!("trying to open: {}", path.display());
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!(code = 10001, "file: {} - open for reading returned: {e}", path.display());
                return RedoCode::ErrorRead;
            }
        };
        let file_size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(code = 10003, "file: {} - get metadata returned: {e}", path.display());
                return RedoCode::ErrorRead;
            }
        };

        let ret = self.load_header(&file, file_size, &path);
        if let Ok(Some(_)) = ret.as_ref() {
            let mut shared = self.shared.lock();
            shared.file = Some(file);
        }
        match ret {
            Ok(Some(())) => RedoCode::Ok,
            Ok(None) => RedoCode::Empty,
            Err(code) => code,
        }
    }

    fn do_update(&self) -> RedoCode {
        let (file, file_size, path, block_size) = {
            self.copy.lock().file = None;
            let mut shared = self.shared.lock();
            let Some(file) = shared.file.take() else {
                return RedoCode::ErrorRead;
            };
            let block_size = shared.header.as_ref().map(|h| h.block_size).unwrap_or(0);
            (file, shared.file_size, shared.path.clone(), block_size)
        };
        let ret = self.load_header(&file, file_size, &path);
        {
            let mut shared = self.shared.lock();
            shared.file = Some(file);
            if matches!(ret, Ok(Some(()))) && block_size > 0 {
                let start = 2 * block_size as u64;
                shared.buffer_start = start;
                shared.buffer_end = start;
                shared.buffer_scan = start;
            }
        }
        self.release_published_ring();
        match ret {
            Ok(Some(())) => RedoCode::Ok,
            Ok(None) => RedoCode::Empty,
            Err(code) => code,
        }
    }

    fn release_published_ring(&self) {
        let mut freed = Vec::new();
        {
            let mut shared = self.shared.lock();
            for slot in shared.ring.iter_mut() {
                if let Some(chunk) = slot.take() {
                    freed.push(chunk);
                }
            }
        }
        for chunk in freed {
            self.mm.chunk_free(MemoryModule::Reader, chunk);
        }
    }

    /// Read and validate blocks 0 and 1; `Ok(None)` means the file is
    /// still empty (online log before first write).
    fn load_header(
        &self,
        file: &File,
        file_size: u64,
        path: &Path,
    ) -> std::result::Result<Option<()>, RedoCode> {
        let mut head = vec![0u8; 4096 * 2];
        let got = read_at(file, &mut head, 0).map_err(|e| {
            warn!(code = 40003, "file: {} - {e}", path.display());
            RedoCode::ErrorRead
        })?;
        if got < 512 {
            warn!(code = 40003, "file: {} - too short: {got} bytes", path.display());
            return Err(RedoCode::ErrorRead);
        }

        // Block size first (its offsets all sit inside the first 512
        // bytes), then slice the header block accordingly.
        let file_name = path.to_string_lossy();
        let endian = match block::detect_endian(&head[..512], file_name.as_ref()) {
            Ok(endian) => endian,
            Err(e) => {
                warn!(code = e.code(), "{e}");
                return Err(RedoCode::ErrorBadData);
            }
        };
        let bs = endian.read_u32(&head[20..]) as usize;
        if !block::BLOCK_SIZES.contains(&(bs as u32)) {
            warn!(code = 40005, "file: {} - invalid block size: {bs}", path.display());
            return Err(RedoCode::ErrorBadData);
        }
        if got < bs * 2 {
            warn!(code = 40003, "file: {} - short header read: {got} bytes", path.display());
            return Err(RedoCode::ErrorRead);
        }
        let header = match block::parse_header(&head[..bs], &head[bs..bs * 2], file_name.as_ref()) {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(code = e.code(), "{e}");
                return Err(RedoCode::ErrorBadData);
            }
        };
        counter!(metric::BYTES_READ).increment(got as u64);

        let block_size = header.block_size;
        let mut truncated_size = file_size;
        if file_size % block_size as u64 != 0 {
            truncated_size = file_size - (file_size % block_size as u64);
            warn!(
                code = 10071,
                "file: {} - size: {file_size} is not a multiple of block size: {block_size}, reading {truncated_size} bytes",
                path.display()
            );
        }

        let mut shared = self.shared.lock();
        if shared.sequence.is_none() {
            shared.sequence = header.sequence;
        } else if shared.sequence != header.sequence {
            warn!(
                code = 60024,
                "file: {} - invalid header sequence, found: {}, expected: {}",
                path.display(),
                header.sequence,
                shared.sequence
            );
            return Err(RedoCode::ErrorSequence);
        }
        // Header block count bounds the readable range of online logs.
        if header.num_blocks != ZERO_BLOCK {
            let bounded = header.num_blocks as u64 * block_size as u64;
            if bounded < truncated_size {
                truncated_size = bounded;
            }
        }
        if shared.ring.is_empty() {
            shared.ring = (0..self.opts.ring_chunks).map(|_| None).collect();
        }
        shared.stamps = vec![0; self.opts.ring_chunks * (CHUNK_SIZE / block_size as usize)];
        shared.file_size = truncated_size;
        info!(
            "found redo log version: {}, activation: {}, resetlogs: {}, page: {}, sequence: {}, SID: {}, endian: {}",
            header.version_str,
            header.activation,
            header.resetlogs,
            block_size,
            header.sequence,
            header.sid,
            if header.endian == Endian::Big { "BIG" } else { "LITTLE" }
        );
        shared.header = Some(header);
        Ok(Some(()))
    }

    fn expectation(&self, shared: &Shared) -> BlockExpectation {
        let header = shared.header.as_ref().expect("header after check");
        BlockExpectation {
            block_size: header.block_size,
            endian: header.endian,
            sequence: shared.sequence,
            group: self.opts.group,
            verify_checksum: self.opts.verify_checksum,
        }
    }

    fn read_loop(&self) {
        let (block_size, file_size) = {
            let shared = self.shared.lock();
            let Some(header) = shared.header.as_ref() else {
                drop(shared);
                self.shared.lock().ret = RedoCode::Error;
                return;
            };
            (header.block_size as u64, shared.file_size)
        };
        let buffer_size_max = (self.opts.ring_chunks * CHUNK_SIZE) as u64;
        let mut crc_retries = 0u32;
        let mut last_read = block_size;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.shared.lock().ret = RedoCode::Shutdown;
                return;
            }
            let (buffer_start, buffer_end, buffer_scan) = {
                let shared = self.shared.lock();
                (shared.buffer_start, shared.buffer_end, shared.buffer_scan)
            };

            if buffer_end == file_size {
                self.finish_eof();
                return;
            }

            // Ring full: wait for the parser to confirm consumption.
            if buffer_start + buffer_size_max == buffer_end {
                let mut shared = self.shared.lock();
                if shared.buffer_start + buffer_size_max == shared.buffer_end
                    && !self.shutdown.load(Ordering::Acquire)
                {
                    trace!("reader buffer full");
                    self.cond_buffer_full.wait_for(&mut shared, Duration::from_millis(100));
                }
                continue;
            }

            let mut read_blocks = false;
            if buffer_end < buffer_scan {
                match self.read_phase2(block_size) {
                    Ok(advanced) => read_blocks = advanced,
                    Err(ret) => {
                        self.shared.lock().ret = ret;
                        return;
                    }
                }
            }

            let scan = self.shared.lock().buffer_scan;
            if scan < file_size {
                match self.read_phase1(block_size, file_size, last_read) {
                    Ok(Phase1 { advanced, bytes_read, crc_failed }) => {
                        if advanced {
                            read_blocks = true;
                            crc_retries = 0;
                            last_read = bytes_read.max(block_size);
                        } else if crc_failed {
                            // The block may be mid-write; re-read a
                            // bounded number of times before failing.
                            crc_retries += 1;
                            if crc_retries >= CRC_RETRY_MAX {
                                self.shared.lock().ret = RedoCode::ErrorCrc;
                                return;
                            }
                            std::thread::sleep(Duration::from_micros(
                                self.opts.redo_read_sleep_us,
                            ));
                            continue;
                        }
                    }
                    Err(ret) => {
                        self.shared.lock().ret = ret;
                        return;
                    }
                }
            }

            if !read_blocks {
                let end = self.shared.lock().buffer_end;
                if end == file_size {
                    self.finish_eof();
                    return;
                }
                if self.opts.group == 0 {
                    // Offline logs do not grow; stop at the last good
                    // block instead of spinning.
                    self.finish_eof();
                    return;
                }
                std::thread::sleep(Duration::from_micros(self.opts.redo_read_sleep_us));
            }
        }
    }

    fn finish_eof(&self) {
        let mut shared = self.shared.lock();
        let next_scn = shared.header.as_ref().map(|h| h.next_scn).unwrap_or_else(Scn::none);
        if !next_scn.is_none() {
            shared.ret = RedoCode::Finished;
        } else {
            warn!(
                code = 60023,
                "file: {} - position: {} - unexpected end of file",
                shared.path.display(),
                shared.buffer_scan
            );
            shared.ret = RedoCode::Stopped;
        }
    }

    /// Phase 1: read fresh bytes at `buffer_scan`, validate, then
    /// either publish (no delay / group 0) or stamp for phase 2.
    fn read_phase1(
        &self,
        block_size: u64,
        file_size: u64,
        last_read: u64,
    ) -> std::result::Result<Phase1, RedoCode> {
        let (scan, ring_len) = {
            let shared = self.shared.lock();
            (shared.buffer_scan, shared.ring.len())
        };

        let mut to_read = (last_read * 2).clamp(block_size, CHUNK_SIZE as u64);
        if scan + to_read > file_size {
            to_read = file_size - scan;
        }
        let ring_pos = scan % CHUNK_SIZE as u64;
        if ring_pos + to_read > CHUNK_SIZE as u64 {
            to_read = CHUNK_SIZE as u64 - ring_pos;
        }
        if to_read == 0 {
            warn!(code = 40010, "zero to read at scan: {scan}");
            return Err(RedoCode::Error);
        }

        let slot = ((scan / CHUNK_SIZE as u64) as usize) % ring_len;
        self.ensure_ring_chunk(slot)?;

        let mut local = vec![0u8; to_read as usize];
        let actual = {
            let shared = self.shared.lock();
            let Some(file) = shared.file.as_ref() else {
                return Err(RedoCode::ErrorRead);
            };
            read_at(file, &mut local, scan).map_err(|e| {
                warn!(code = 40003, "file: {} - {e}", shared.path.display());
                RedoCode::ErrorRead
            })?
        };
        counter!(metric::BYTES_READ).increment(actual as u64);

        let full_blocks = actual as u64 / block_size;
        if full_blocks == 0 {
            return Ok(Phase1 { advanced: false, bytes_read: 0, crc_failed: false });
        }

        let mut shared = self.shared.lock();
        let exp = self.expectation(&shared);
        let first_block = (scan / block_size) as u32;
        let mut good_blocks = 0u64;
        let mut failure = BlockCheck::Ok;
        for i in 0..full_blocks {
            let range = (i * block_size) as usize..((i + 1) * block_size) as usize;
            match block::check_block(&local[range], first_block + i as u32, &exp) {
                BlockCheck::Ok => good_blocks += 1,
                other => {
                    failure = other;
                    break;
                }
            }
        }

        if good_blocks == 0 {
            return match failure {
                BlockCheck::Empty => Ok(Phase1 { advanced: false, bytes_read: 0, crc_failed: false }),
                BlockCheck::BadChecksum => {
                    Ok(Phase1 { advanced: false, bytes_read: 0, crc_failed: true })
                }
                BlockCheck::Overwritten => Err(RedoCode::Overwritten),
                BlockCheck::BadSequence => Err(RedoCode::ErrorSequence),
                BlockCheck::BadBlockNumber => Err(RedoCode::ErrorBlock),
                BlockCheck::BadData => Err(RedoCode::ErrorBadData),
                BlockCheck::Ok => unreachable!(),
            };
        }

        let good_bytes = good_blocks * block_size;
        let chunk = shared.ring[slot].as_mut().expect("ring chunk allocated");
        chunk[ring_pos as usize..(ring_pos + good_bytes) as usize]
            .copy_from_slice(&local[..good_bytes as usize]);

        if self.opts.redo_verify_delay_us > 0 && self.opts.group != 0 {
            let now = now_micros();
            let stamp_base = (scan / block_size) as usize;
            let stamp_len = shared.stamps.len();
            for i in 0..good_blocks as usize {
                shared.stamps[(stamp_base + i) % stamp_len] = now;
            }
            shared.buffer_scan += good_bytes;
        } else {
            shared.buffer_scan += good_bytes;
            shared.buffer_end = shared.buffer_scan;
            let sequence = shared.sequence;
            drop(shared);
            self.cond_parser.notify_all();
            self.write_copy(sequence, scan, &local[..good_bytes as usize])?;
        }

        Ok(Phase1 { advanced: true, bytes_read: good_bytes, crc_failed: false })
    }

    /// Phase 2: re-read stamped blocks whose delay has expired and
    /// publish them.
    fn read_phase2(&self, block_size: u64) -> std::result::Result<bool, RedoCode> {
        let (end, scan, ring_len, stamp_len) = {
            let shared = self.shared.lock();
            (shared.buffer_end, shared.buffer_scan, shared.ring.len(), shared.stamps.len())
        };
        let now = now_micros();
        let mut ready_blocks = 0u64;
        {
            let shared = self.shared.lock();
            let max_blocks =
                ((scan - end) / block_size).min(CHUNK_SIZE as u64 / block_size);
            for i in 0..max_blocks {
                let stamp_idx = ((end / block_size + i) as usize) % stamp_len;
                if shared.stamps[stamp_idx] + self.opts.redo_verify_delay_us < now {
                    ready_blocks += 1;
                } else {
                    break;
                }
            }
        }
        if ready_blocks == 0 {
            return Ok(false);
        }

        let ring_pos = end % CHUNK_SIZE as u64;
        let mut to_read = ready_blocks * block_size;
        if ring_pos + to_read > CHUNK_SIZE as u64 {
            to_read = CHUNK_SIZE as u64 - ring_pos;
        }

        let mut local = vec![0u8; to_read as usize];
        let actual = {
            let shared = self.shared.lock();
            let Some(file) = shared.file.as_ref() else {
                return Err(RedoCode::ErrorRead);
            };
            read_at(file, &mut local, end).map_err(|e| {
                warn!(code = 40003, "file: {} - {e}", shared.path.display());
                RedoCode::ErrorRead
            })?
        };
        counter!(metric::BYTES_READ).increment(actual as u64);

        let full_blocks = actual as u64 / block_size;
        if full_blocks == 0 {
            return Ok(false);
        }

        let mut shared = self.shared.lock();
        let exp = self.expectation(&shared);
        let first_block = (end / block_size) as u32;
        for i in 0..full_blocks {
            let range = (i * block_size) as usize..((i + 1) * block_size) as usize;
            match block::check_block(&local[range], first_block + i as u32, &exp) {
                BlockCheck::Ok => {}
                BlockCheck::Empty => return Ok(false),
                BlockCheck::BadChecksum => return Err(RedoCode::ErrorCrc),
                BlockCheck::Overwritten => return Err(RedoCode::Overwritten),
                BlockCheck::BadSequence => return Err(RedoCode::ErrorSequence),
                BlockCheck::BadBlockNumber => return Err(RedoCode::ErrorBlock),
                BlockCheck::BadData => return Err(RedoCode::ErrorBadData),
            }
        }

        let good_bytes = full_blocks * block_size;
        let slot = ((end / CHUNK_SIZE as u64) as usize) % ring_len;
        let chunk = shared.ring[slot].as_mut().expect("ring chunk allocated");
        chunk[ring_pos as usize..(ring_pos + good_bytes) as usize]
            .copy_from_slice(&local[..good_bytes as usize]);
        shared.buffer_end += good_bytes;
        let sequence = shared.sequence;
        drop(shared);
        self.cond_parser.notify_all();
        self.write_copy(sequence, end, &local[..good_bytes as usize])?;
        Ok(true)
    }

    fn ensure_ring_chunk(&self, slot: usize) -> std::result::Result<(), RedoCode> {
        {
            let shared = self.shared.lock();
            if shared.ring[slot].is_some() {
                return Ok(());
            }
        }
        let chunk = self.mm.chunk_alloc(MemoryModule::Reader).map_err(|e| {
            warn!(code = e.code(), "{e}");
            RedoCode::Error
        })?;
        self.shared.lock().ring[slot] = Some(chunk);
        Ok(())
    }

    /// Mirror validated bytes to the copy file, switching files per
    /// source sequence.
    fn write_copy(
        &self,
        sequence: Seq,
        offset: u64,
        bytes: &[u8],
    ) -> std::result::Result<(), RedoCode> {
        let Some(copy_dir) = self.opts.copy_path.as_ref() else {
            return Ok(());
        };
        let mut copy = self.copy.lock();
        if copy.sequence != sequence || copy.file.is_none() {
            let name = copy_dir.join(format!("{}_{}.arc", self.opts.database, sequence));
            match std::fs::OpenOptions::new().create(true).write(true).open(&name) {
                Ok(file) => {
                    info!("writing redo log copy to: {}", name.display());
                    copy.file = Some(file);
                    copy.sequence = sequence;
                }
                Err(e) => {
                    warn!(code = 10006, "file: {} - open for writing returned: {e}", name.display());
                    return Err(RedoCode::ErrorWrite);
                }
            }
        }
        if let Some(file) = copy.file.as_ref() {
            if let Err(e) = write_at(file, bytes, offset) {
                warn!(code = 10007, "redo copy write failed: {e}");
                return Err(RedoCode::ErrorWrite);
            }
        }
        Ok(())
    }
}

struct Phase1 {
    advanced: bool,
    bytes_read: u64,
    crc_failed: bool,
}

fn now_micros() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}
