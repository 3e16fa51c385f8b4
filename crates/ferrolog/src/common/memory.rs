//! Chunked memory pool and disk swap.
//!
//! All large buffers in the pipeline come from one pool of fixed
//! 1 MiB chunks bounded by `[min-mb, max-mb]`. The pool is shared
//! between the reader ring, the parser's LWN arena, the builder and
//! the per-transaction chains. Transaction chains are additionally
//! registered here so that, under pressure, a dedicated thread can
//! swap their interior chunks to `<swap-path>/<xid>.swap` and restore
//! them on demand during commit replay.
//!
//! Chunks are 4 KiB aligned so swap I/O can use O_DIRECT.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::common::config::RedoFlags;
use crate::common::errors::{ReplError, Result};
use crate::common::metrics as metric;
use crate::common::types::Xid;

/// Chunk size in bytes. Records, LWN arenas and swap files are all
/// sized in these units; a swap file length must be a multiple of it.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk size in MiB, for config arithmetic.
pub const CHUNK_SIZE_MB: u64 = 1;

const CHUNK_ALIGN: usize = 4096;

/// Pool owners, for accounting and high-water marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryModule {
    Builder = 0,
    Misc = 1,
    Parser = 2,
    Reader = 3,
    Transactions = 4,
    Writer = 5,
}

impl MemoryModule {
    pub const COUNT: usize = 6;

    pub fn name(self) -> &'static str {
        match self {
            MemoryModule::Builder => "builder",
            MemoryModule::Misc => "misc",
            MemoryModule::Parser => "parser",
            MemoryModule::Reader => "reader",
            MemoryModule::Transactions => "transactions",
            MemoryModule::Writer => "writer",
        }
    }
}

/// A 1 MiB buffer aligned for O_DIRECT transfers.
pub struct Chunk {
    ptr: std::ptr::NonNull<u8>,
}

// The chunk exclusively owns its allocation.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn layout() -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(CHUNK_SIZE, CHUNK_ALIGN).expect("static layout")
    }

    fn alloc_zeroed() -> Result<Chunk> {
        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(Self::layout()) };
        match std::ptr::NonNull::new(raw) {
            Some(ptr) => Ok(Chunk { ptr }),
            None => Err(ReplError::runtime(10018, "memory allocation failed for 1 MiB chunk")),
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: allocated with the same layout in alloc_zeroed.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), Self::layout()) };
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the allocation is CHUNK_SIZE bytes and lives as long
        // as self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), CHUNK_SIZE) }
    }
}

impl DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), CHUNK_SIZE) }
    }
}

struct PoolState {
    free: Vec<Chunk>,
    allocated: u64,
    max_chunks: u64,
    module_allocated: [u64; MemoryModule::COUNT],
    module_hwm: [u64; MemoryModule::COUNT],
    hwm: u64,
    waiters: u32,
}

enum Slot {
    Resident(Chunk),
    Swapped,
    /// Processed during commit replay and returned to the pool.
    Released,
}

impl Slot {
    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Slot::Resident(chunk) => Some(chunk),
            _ => None,
        }
    }
}

/// One registered transaction chain. Swapped slots form the contiguous
/// on-disk range `swapped_min..=swapped_max`.
struct SwapChain {
    chunks: Vec<Slot>,
    swapped_min: i64,
    swapped_max: i64,
    /// Chain is being replayed or torn down; not an eviction victim.
    release: bool,
}

impl SwapChain {
    fn new() -> Self {
        SwapChain { chunks: Vec::new(), swapped_min: -1, swapped_max: -1, release: false }
    }

    fn swapped_count(&self) -> u64 {
        if self.swapped_max < 0 {
            0
        } else {
            (self.swapped_max - self.swapped_min + 1) as u64
        }
    }
}

struct SwapState {
    chains: HashMap<Xid, SwapChain>,
    /// Registration order, for oldest-first victim selection.
    order: Vec<Xid>,
    /// XIDs whose chains were removed; their swap files await deletion.
    committed: Vec<Xid>,
    /// Transaction being restored for replay; unswap takes priority.
    flush_xid: Option<Xid>,
}

/// The shared chunk pool and swap registry.
pub struct MemoryManager {
    pool: Mutex<PoolState>,
    cond_out_of_memory: Condvar,
    swap: Mutex<SwapState>,
    /// Predicate: a swap or unswap candidate may exist, or shutdown.
    cond_manager: Condvar,
    /// Predicate: a flush chunk became resident.
    cond_transaction: Condvar,
    swap_path: PathBuf,
    database: String,
    direct_io: bool,
    min_chunks: u64,
    shutdown: AtomicBool,
    swap_writes: std::sync::atomic::AtomicU64,
    swap_reads: std::sync::atomic::AtomicU64,
}

impl MemoryManager {
    pub fn new(
        database: &str,
        min_mb: u64,
        max_mb: u64,
        swap_path: &Path,
        flags: RedoFlags,
    ) -> Result<Arc<MemoryManager>> {
        let min_chunks = (min_mb / CHUNK_SIZE_MB).max(1);
        let max_chunks = (max_mb / CHUNK_SIZE_MB).max(min_chunks);

        let mut free = Vec::with_capacity(min_chunks as usize);
        for _ in 0..min_chunks {
            free.push(Chunk::alloc_zeroed()?);
        }
        gauge!(metric::MEMORY_ALLOCATED_MB).set(min_chunks as f64);

        let manager = Arc::new(MemoryManager {
            pool: Mutex::new(PoolState {
                free,
                allocated: min_chunks,
                max_chunks,
                module_allocated: [0; MemoryModule::COUNT],
                module_hwm: [0; MemoryModule::COUNT],
                hwm: min_chunks,
                waiters: 0,
            }),
            cond_out_of_memory: Condvar::new(),
            swap: Mutex::new(SwapState {
                chains: HashMap::new(),
                order: Vec::new(),
                committed: Vec::new(),
                flush_xid: None,
            }),
            cond_manager: Condvar::new(),
            cond_transaction: Condvar::new(),
            swap_path: swap_path.to_path_buf(),
            database: database.to_string(),
            direct_io: !flags.is_set(RedoFlags::DIRECT_DISABLE),
            min_chunks,
            shutdown: AtomicBool::new(false),
            swap_writes: std::sync::atomic::AtomicU64::new(0),
            swap_reads: std::sync::atomic::AtomicU64::new(0),
        });
        manager.delete_stale_swap_files()?;
        Ok(manager)
    }

    /// Remove `*.swap` files left behind by a previous run.
    fn delete_stale_swap_files(&self) -> Result<()> {
        let entries = match std::fs::read_dir(&self.swap_path) {
            Ok(entries) => entries,
            Err(e) => {
                return Err(ReplError::io(
                    10012,
                    format!("directory: {} - can't read", self.swap_path.display()),
                    e,
                ))
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "swap") {
                warn!(
                    code = 10067,
                    "deleting swap file left behind by previous run: {}",
                    path.display()
                );
                std::fs::remove_file(&path).map_err(|e| {
                    ReplError::io(10010, format!("file: {} - delete", path.display()), e)
                })?;
            }
        }
        Ok(())
    }

    fn swap_file_name(&self, xid: Xid) -> PathBuf {
        self.swap_path.join(format!("{}-{xid}.swap", self.database))
    }

    /// Take one chunk from the pool for `module`. When the pool is at
    /// its cap the call blocks and wakes the swap thread so the wait
    /// can be satisfied by eviction.
    pub fn chunk_alloc(&self, module: MemoryModule) -> Result<Chunk> {
        let mut pool = self.pool.lock();
        loop {
            if let Some(chunk) = pool.free.pop() {
                pool.module_allocated[module as usize] += 1;
                pool.module_hwm[module as usize] =
                    pool.module_hwm[module as usize].max(pool.module_allocated[module as usize]);
                gauge!(metric::MEMORY_USED_MB, "type" => module.name())
                    .set(pool.module_allocated[module as usize] as f64);
                return Ok(chunk);
            }
            if pool.allocated < pool.max_chunks {
                pool.allocated += 1;
                pool.hwm = pool.hwm.max(pool.allocated);
                pool.module_allocated[module as usize] += 1;
                pool.module_hwm[module as usize] =
                    pool.module_hwm[module as usize].max(pool.module_allocated[module as usize]);
                gauge!(metric::MEMORY_ALLOCATED_MB).set(pool.allocated as f64);
                gauge!(metric::MEMORY_USED_MB, "type" => module.name())
                    .set(pool.module_allocated[module as usize] as f64);
                drop(pool);
                return Chunk::alloc_zeroed();
            }

            if self.shutdown.load(Ordering::Acquire) {
                return Err(ReplError::runtime(10018, "memory pool exhausted during shutdown"));
            }

            trace!(module = module.name(), "memory pool exhausted, waiting");
            pool.waiters += 1;
            self.cond_manager.notify_all();
            self.cond_out_of_memory.wait_for(&mut pool, Duration::from_millis(100));
            pool.waiters -= 1;
        }
    }

    /// Return a chunk to the pool. Shrinks back toward `min-mb`.
    pub fn chunk_free(&self, module: MemoryModule, chunk: Chunk) {
        let mut pool = self.pool.lock();
        pool.module_allocated[module as usize] =
            pool.module_allocated[module as usize].saturating_sub(1);
        gauge!(metric::MEMORY_USED_MB, "type" => module.name())
            .set(pool.module_allocated[module as usize] as f64);
        if pool.allocated > self.min_chunks {
            pool.allocated -= 1;
            gauge!(metric::MEMORY_ALLOCATED_MB).set(pool.allocated as f64);
            drop(chunk);
        } else {
            pool.free.push(chunk);
        }
        drop(pool);
        self.cond_out_of_memory.notify_all();
    }

    /// True when allocations are currently blocked on the pool.
    fn under_pressure(&self) -> bool {
        let pool = self.pool.lock();
        pool.waiters > 0 || (pool.free.is_empty() && pool.allocated >= pool.max_chunks)
    }

    pub fn memory_hwm_mb(&self) -> u64 {
        self.pool.lock().hwm
    }

    /// MiB ever written to swap files.
    pub fn swap_written_mb(&self) -> u64 {
        self.swap_writes.load(Ordering::Relaxed)
    }

    /// MiB ever restored from swap files.
    pub fn swap_read_mb(&self) -> u64 {
        self.swap_reads.load(Ordering::Relaxed)
    }

    // --- transaction chain registry -------------------------------------

    /// Register a transaction chain.
    pub fn chain_init(&self, xid: Xid) {
        let mut swap = self.swap.lock();
        if !swap.chains.contains_key(&xid) {
            swap.chains.insert(xid, SwapChain::new());
            swap.order.push(xid);
        }
    }

    /// Append a fresh chunk to the chain and return its index.
    pub fn chain_grow(&self, xid: Xid) -> Result<usize> {
        let chunk = self.chunk_alloc(MemoryModule::Transactions)?;
        let mut swap = self.swap.lock();
        let chain = swap
            .chains
            .get_mut(&xid)
            .ok_or_else(|| ReplError::internal(50070, format!("swap chunk not found for xid: {xid}")))?;
        chain.chunks.push(Slot::Resident(chunk));
        Ok(chain.chunks.len() - 1)
    }

    pub fn chain_len(&self, xid: Xid) -> usize {
        self.swap.lock().chains.get(&xid).map(|c| c.chunks.len()).unwrap_or(0)
    }

    /// Number of chunks currently evicted to disk.
    pub fn chain_swapped(&self, xid: Xid) -> u64 {
        self.swap.lock().chains.get(&xid).map(SwapChain::swapped_count).unwrap_or(0)
    }

    /// Run `f` over the resident chunk at `idx`.
    pub fn with_chunk<R>(&self, xid: Xid, idx: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let swap = self.swap.lock();
        let chain = swap
            .chains
            .get(&xid)
            .ok_or_else(|| ReplError::internal(50070, format!("swap chunk not found for xid: {xid}")))?;
        match chain.chunks.get(idx).and_then(Slot::as_bytes) {
            Some(bytes) => Ok(f(bytes)),
            None => Err(ReplError::internal(
                50072,
                format!("chunk {idx} of xid: {xid} accessed while not resident"),
            )),
        }
    }

    /// Run `f` over the resident chunk at `idx`, mutably.
    pub fn with_chunk_mut<R>(
        &self,
        xid: Xid,
        idx: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut swap = self.swap.lock();
        let chain = swap
            .chains
            .get_mut(&xid)
            .ok_or_else(|| ReplError::internal(50070, format!("swap chunk not found for xid: {xid}")))?;
        match chain.chunks.get_mut(idx) {
            Some(Slot::Resident(chunk)) => Ok(f(chunk)),
            _ => Err(ReplError::internal(
                50072,
                format!("chunk {idx} of xid: {xid} accessed while not resident"),
            )),
        }
    }

    /// Run `f` over the mutable tail chunk.
    pub fn with_tail_mut<R>(&self, xid: Xid, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut swap = self.swap.lock();
        let chain = swap
            .chains
            .get_mut(&xid)
            .ok_or_else(|| ReplError::internal(50070, format!("swap chunk not found for xid: {xid}")))?;
        match chain.chunks.last_mut() {
            Some(Slot::Resident(chunk)) => Ok(f(chunk)),
            _ => Err(ReplError::internal(50072, format!("tail chunk of xid: {xid} is not resident"))),
        }
    }

    /// Mark a chain as replaying; the swap thread stops evicting it.
    pub fn chain_mark_release(&self, xid: Xid) {
        if let Some(chain) = self.swap.lock().chains.get_mut(&xid) {
            chain.release = true;
        }
    }

    /// Block until the chunk at `idx` is resident. Restores run on the
    /// manager thread from the low end of the swapped range upward, so
    /// replay in arrival order never waits for more than the range up
    /// to `idx`.
    pub fn require_resident(&self, xid: Xid, idx: usize) -> Result<()> {
        let mut swap = self.swap.lock();
        loop {
            let chain = swap
                .chains
                .get(&xid)
                .ok_or_else(|| ReplError::internal(50070, format!("swap chunk not found for xid: {xid}")))?;
            match chain.chunks.get(idx) {
                Some(Slot::Resident(_)) => {
                    if swap.flush_xid == Some(xid) {
                        let done = swap
                            .chains
                            .get(&xid)
                            .map(|c| c.swapped_max < 0)
                            .unwrap_or(true);
                        if done {
                            swap.flush_xid = None;
                        }
                    }
                    return Ok(());
                }
                Some(Slot::Swapped) => {
                    swap.flush_xid = Some(xid);
                    self.cond_manager.notify_all();
                    self.cond_transaction.wait_for(&mut swap, Duration::from_millis(100));
                    if self.shutdown.load(Ordering::Acquire) {
                        return Err(ReplError::runtime(
                            10018,
                            "shutdown while restoring swapped chunks",
                        ));
                    }
                }
                Some(Slot::Released) => {
                    return Err(ReplError::internal(
                        50072,
                        format!("chunk {idx} of xid: {xid} already released"),
                    ))
                }
                None => {
                    return Err(ReplError::internal(
                        50072,
                        format!("chunk {idx} of xid: {xid} out of range"),
                    ))
                }
            }
        }
    }

    /// Return a processed chunk to the pool during commit replay.
    pub fn chain_release_chunk(&self, xid: Xid, idx: usize) -> Result<()> {
        let chunk = {
            let mut swap = self.swap.lock();
            let chain = swap
                .chains
                .get_mut(&xid)
                .ok_or_else(|| ReplError::internal(50070, format!("swap chunk not found for xid: {xid}")))?;
            match chain.chunks.get_mut(idx) {
                Some(slot) if matches!(slot, Slot::Resident(_)) => {
                    match std::mem::replace(slot, Slot::Released) {
                        Slot::Resident(chunk) => chunk,
                        _ => unreachable!(),
                    }
                }
                _ => {
                    return Err(ReplError::internal(
                        50072,
                        format!("chunk {idx} of xid: {xid} released while not resident"),
                    ))
                }
            }
        };
        self.chunk_free(MemoryModule::Transactions, chunk);
        Ok(())
    }

    /// Drop the chain. Resident chunks go back to the pool; a leftover
    /// swap file is queued for deletion by the manager thread.
    pub fn chain_remove(&self, xid: Xid) {
        let mut freed = Vec::new();
        {
            let mut swap = self.swap.lock();
            if let Some(mut chain) = swap.chains.remove(&xid) {
                chain.release = true;
                for slot in chain.chunks.drain(..) {
                    if let Slot::Resident(chunk) = slot {
                        freed.push(chunk);
                    }
                }
                swap.order.retain(|x| *x != xid);
                swap.committed.push(xid);
                if swap.flush_xid == Some(xid) {
                    swap.flush_xid = None;
                }
            }
        }
        for chunk in freed {
            self.chunk_free(MemoryModule::Transactions, chunk);
        }
        self.cond_manager.notify_all();
    }

    // --- swap thread -----------------------------------------------------

    /// Spawn the swap/unswap thread.
    pub fn spawn(self: &Arc<Self>) -> Result<std::thread::JoinHandle<()>> {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("memory-manager".to_string())
            .spawn(move || manager.run())
            .map_err(|e| ReplError::io(10013, "spawning memory manager thread", e))
    }

    pub fn initiate_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond_manager.notify_all();
        self.cond_out_of_memory.notify_all();
        self.cond_transaction.notify_all();
    }

    fn run(&self) {
        debug!("memory manager started");
        while !self.shutdown.load(Ordering::Acquire) {
            let discarded = self.clean_committed();
            if discarded > 0 {
                counter!(metric::SWAP_OPERATIONS_MB, "type" => "discard").increment(discarded);
            }

            let (unswap_job, swap_job) = {
                let mut swap = self.swap.lock();
                let unswap_job = pick_unswap(&swap);
                let swap_job = if self.under_pressure() { pick_swap(&swap) } else { None };

                if unswap_job.is_none() && swap_job.is_none() {
                    self.cond_manager.wait_for(&mut swap, Duration::from_secs(10));
                    continue;
                }
                (unswap_job, swap_job)
            };

            if let Some((xid, idx)) = unswap_job {
                match self.unswap(xid, idx) {
                    Ok(true) => {
                        counter!(metric::SWAP_OPERATIONS_MB, "type" => "read").increment(1);
                        self.cond_transaction.notify_all();
                    }
                    Ok(false) => {}
                    Err(e) => warn!(code = e.code(), "unswap failed: {e}"),
                }
            }
            if let Some((xid, idx)) = swap_job {
                match self.swap_out(xid, idx) {
                    Ok(true) => {
                        counter!(metric::SWAP_OPERATIONS_MB, "type" => "write").increment(1);
                        self.cond_out_of_memory.notify_all();
                    }
                    Ok(false) => {}
                    Err(e) => warn!(code = e.code(), "swap failed: {e}"),
                }
            }
            self.update_swap_usage();
        }
        let discarded = self.clean_committed();
        if discarded > 0 {
            counter!(metric::SWAP_OPERATIONS_MB, "type" => "discard").increment(discarded);
        }
        debug!("memory manager stopped");
    }

    fn update_swap_usage(&self) {
        let swap = self.swap.lock();
        let total: u64 = swap.chains.values().map(SwapChain::swapped_count).sum();
        gauge!(metric::SWAP_USAGE_MB).set(total as f64);
    }

    /// Delete swap files of transactions that finished; returns MiB
    /// that were written but never read back.
    fn clean_committed(&self) -> u64 {
        let mut discarded = 0;
        loop {
            let xid = {
                let mut swap = self.swap.lock();
                match swap.committed.pop() {
                    Some(xid) => xid,
                    None => return discarded,
                }
            };
            let file = self.swap_file_name(xid);
            if let Ok(meta) = std::fs::metadata(&file) {
                discarded += meta.len() / CHUNK_SIZE as u64;
                if let Err(e) = std::fs::remove_file(&file) {
                    warn!(code = 10010, "file: {} - delete returned: {e}", file.display());
                }
            }
        }
    }

    fn open_swap(&self, path: &Path, write: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        if write {
            options.write(true).create(true);
        } else {
            options.read(true);
        }
        #[cfg(target_os = "linux")]
        if self.direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = self.direct_io;
        options
            .open(path)
            .map_err(|e| ReplError::io(50072, format!("swap file: {} - open", path.display()), e))
    }

    /// Evict chunk `idx` of `xid` to disk and return it to the pool.
    fn swap_out(&self, xid: Xid, idx: i64) -> Result<bool> {
        let chunk = {
            let mut swap = self.swap.lock();
            let chain = match swap.chains.get_mut(&xid) {
                Some(chain) => chain,
                None => return Ok(false),
            };
            // Revalidate under the lock; the chain may have grown,
            // entered release or been picked concurrently.
            let expected = if chain.swapped_max < 0 { 1 } else { chain.swapped_max + 1 };
            if chain.release
                || chain.chunks.len() <= 2
                || idx < 1
                || idx >= chain.chunks.len() as i64 - 1
                || idx != expected
            {
                return Ok(false);
            }
            let slot = &mut chain.chunks[idx as usize];
            if !matches!(slot, Slot::Resident(_)) {
                return Ok(false);
            }
            let chunk = match std::mem::replace(slot, Slot::Swapped) {
                Slot::Resident(chunk) => chunk,
                _ => unreachable!(),
            };
            chain.swapped_max = idx;
            if chain.swapped_min < 0 {
                chain.swapped_min = idx;
            }
            chunk
        };

        let path = self.swap_file_name(xid);
        let write_result = self.open_swap(&path, true).and_then(|mut file| {
            file.seek(SeekFrom::Start(idx as u64 * CHUNK_SIZE as u64)).map_err(|e| {
                ReplError::io(50072, format!("swap file: {} - seek", path.display()), e)
            })?;
            file.write_all(&chunk).map_err(|e| {
                ReplError::io(50072, format!("swap file: {} - write", path.display()), e)
            })
        });
        if let Err(e) = write_result {
            // Undo the eviction so the chain stays consistent.
            let mut swap = self.swap.lock();
            if let Some(chain) = swap.chains.get_mut(&xid) {
                chain.chunks[idx as usize] = Slot::Resident(chunk);
                chain.swapped_max = idx - 1;
                if chain.swapped_max < chain.swapped_min {
                    chain.swapped_min = -1;
                    chain.swapped_max = -1;
                }
            }
            return Err(e);
        }
        self.swap_writes.fetch_add(1, Ordering::Relaxed);
        trace!(%xid, idx, "swapped chunk out");

        self.chunk_free(MemoryModule::Transactions, chunk);
        Ok(true)
    }

    /// Restore the lowest swapped chunk of `xid` from disk.
    fn unswap(&self, xid: Xid, idx: i64) -> Result<bool> {
        let mut chunk = self.chunk_alloc(MemoryModule::Transactions)?;

        let path = self.swap_file_name(xid);
        let meta = std::fs::metadata(&path).map_err(|e| {
            ReplError::io(50072, format!("swap file: {} - get metadata", path.display()), e)
        })?;
        if meta.len() % CHUNK_SIZE as u64 != 0 {
            self.chunk_free(MemoryModule::Transactions, chunk);
            return Err(ReplError::internal(
                50072,
                format!("swap file: {} - wrong file size: {}", path.display(), meta.len()),
            ));
        }
        if meta.len() < (idx as u64 + 1) * CHUNK_SIZE as u64 {
            self.chunk_free(MemoryModule::Transactions, chunk);
            return Err(ReplError::internal(
                50072,
                format!(
                    "swap file: {} - too small file size: {} to read chunk: {idx}",
                    path.display(),
                    meta.len()
                ),
            ));
        }

        let mut file = self.open_swap(&path, false)?;
        file.seek(SeekFrom::Start(idx as u64 * CHUNK_SIZE as u64))
            .map_err(|e| ReplError::io(50072, format!("swap file: {} - seek", path.display()), e))?;
        file.read_exact(&mut chunk)
            .map_err(|e| ReplError::io(50072, format!("swap file: {} - read", path.display()), e))?;
        drop(file);

        let mut swap = self.swap.lock();
        let chain = match swap.chains.get_mut(&xid) {
            Some(chain) => chain,
            None => {
                drop(swap);
                self.chunk_free(MemoryModule::Transactions, chunk);
                return Ok(false);
            }
        };
        if chain.swapped_min != idx {
            let swapped_min = chain.swapped_min;
            let swapped_max = chain.swapped_max;
            drop(swap);
            self.chunk_free(MemoryModule::Transactions, chunk);
            return Err(ReplError::internal(
                50072,
                format!(
                    "swap file: {} - unswapping: {idx} not in range {}-{}",
                    path.display(),
                    swapped_min,
                    swapped_max
                ),
            ));
        }
        chain.chunks[idx as usize] = Slot::Resident(chunk);
        if chain.swapped_min == chain.swapped_max {
            chain.swapped_min = -1;
            chain.swapped_max = -1;
        } else {
            chain.swapped_min += 1;
        }
        self.swap_reads.fetch_add(1, Ordering::Relaxed);
        trace!(%xid, idx, "restored swapped chunk");
        Ok(true)
    }
}

/// Flush restores win over eviction; restore from the low end so the
/// commit replay walks the chain in order.
fn pick_unswap(swap: &SwapState) -> Option<(Xid, i64)> {
    let xid = swap.flush_xid?;
    let chain = swap.chains.get(&xid)?;
    if chain.swapped_min < 0 {
        return None;
    }
    Some((xid, chain.swapped_min))
}

/// Oldest registered transaction with more than one interior chunk and
/// something left to evict. Never touches the first or the tail chunk.
fn pick_swap(swap: &SwapState) -> Option<(Xid, i64)> {
    for xid in &swap.order {
        if swap.flush_xid == Some(*xid) {
            continue;
        }
        let chain = match swap.chains.get(xid) {
            Some(chain) => chain,
            None => continue,
        };
        if chain.release || chain.chunks.len() <= 2 {
            continue;
        }
        let candidate = if chain.swapped_max < 0 { 1 } else { chain.swapped_max + 1 };
        if candidate < chain.chunks.len() as i64 - 1 {
            return Some((*xid, candidate));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(min_mb: u64, max_mb: u64, dir: &Path) -> Arc<MemoryManager> {
        MemoryManager::new("TESTDB", min_mb, max_mb, dir, RedoFlags(RedoFlags::DIRECT_DISABLE))
            .unwrap()
    }

    #[test]
    fn alloc_and_free_cycle() {
        let dir = tempdir().unwrap();
        let mm = manager(2, 4, dir.path());
        let a = mm.chunk_alloc(MemoryModule::Reader).unwrap();
        let b = mm.chunk_alloc(MemoryModule::Parser).unwrap();
        let c = mm.chunk_alloc(MemoryModule::Parser).unwrap();
        assert_eq!(a.len(), CHUNK_SIZE);
        mm.chunk_free(MemoryModule::Reader, a);
        mm.chunk_free(MemoryModule::Parser, b);
        mm.chunk_free(MemoryModule::Parser, c);
        assert!(mm.memory_hwm_mb() >= 3);
    }

    #[test]
    fn chunk_is_aligned_for_direct_io() {
        let dir = tempdir().unwrap();
        let mm = manager(1, 2, dir.path());
        let chunk = mm.chunk_alloc(MemoryModule::Misc).unwrap();
        assert_eq!(chunk.as_ptr() as usize % CHUNK_ALIGN, 0);
        mm.chunk_free(MemoryModule::Misc, chunk);
    }

    #[test]
    fn stale_swap_files_deleted_on_startup() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("TESTDB-0x0001.002.00000003.swap");
        std::fs::write(&stale, vec![0u8; CHUNK_SIZE]).unwrap();
        let _mm = manager(1, 2, dir.path());
        assert!(!stale.exists());
    }

    #[test]
    fn chain_grow_and_access() {
        let dir = tempdir().unwrap();
        let mm = manager(4, 8, dir.path());
        let xid = Xid::new(1, 2, 3);
        mm.chain_init(xid);
        assert_eq!(mm.chain_grow(xid).unwrap(), 0);
        assert_eq!(mm.chain_grow(xid).unwrap(), 1);
        mm.with_tail_mut(xid, |chunk| chunk[0] = 0xAB).unwrap();
        let byte = mm.with_chunk(xid, 1, |chunk| chunk[0]).unwrap();
        assert_eq!(byte, 0xAB);
        mm.chain_remove(xid);
        assert_eq!(mm.chain_len(xid), 0);
    }

    #[test]
    fn swap_out_and_restore_roundtrip() {
        let dir = tempdir().unwrap();
        let mm = manager(4, 8, dir.path());
        let xid = Xid::new(4, 0, 9);
        mm.chain_init(xid);
        for i in 0..4u8 {
            mm.chain_grow(xid).unwrap();
            mm.with_tail_mut(xid, |chunk| chunk[..4].copy_from_slice(&[i, i, i, i])).unwrap();
        }
        // Interior chunks are 1 and 2; evict both.
        assert!(mm.swap_out(xid, 1).unwrap());
        assert!(mm.swap_out(xid, 2).unwrap());
        assert_eq!(mm.chain_swapped(xid), 2);
        assert!(mm.swap_file_name(xid).exists());
        assert!(mm.with_chunk(xid, 1, |_| ()).is_err());

        assert!(mm.unswap(xid, 1).unwrap());
        assert!(mm.unswap(xid, 2).unwrap());
        let byte = mm.with_chunk(xid, 2, |chunk| chunk[0]).unwrap();
        assert_eq!(byte, 2);

        mm.chain_remove(xid);
        // Chunks 1 and 2 were written, so the file spans three units.
        assert_eq!(mm.clean_committed(), 3);
        assert!(!mm.swap_file_name(xid).exists());
    }

    #[test]
    fn swap_never_takes_first_or_tail() {
        let dir = tempdir().unwrap();
        let mm = manager(4, 8, dir.path());
        let xid = Xid::new(7, 0, 1);
        mm.chain_init(xid);
        for _ in 0..3 {
            mm.chain_grow(xid).unwrap();
        }
        assert!(!mm.swap_out(xid, 0).unwrap());
        assert!(!mm.swap_out(xid, 2).unwrap());
        assert!(mm.swap_out(xid, 1).unwrap());
        mm.chain_remove(xid);
    }

    #[test]
    fn require_resident_restores_through_manager_thread() {
        let dir = tempdir().unwrap();
        let mm = manager(4, 16, dir.path());
        let xid = Xid::new(2, 1, 5);
        mm.chain_init(xid);
        for i in 0..4u8 {
            mm.chain_grow(xid).unwrap();
            mm.with_tail_mut(xid, |chunk| chunk[0] = i).unwrap();
        }
        mm.swap_out(xid, 1).unwrap();
        mm.swap_out(xid, 2).unwrap();

        let handle = mm.spawn().unwrap();
        mm.require_resident(xid, 1).unwrap();
        assert_eq!(mm.with_chunk(xid, 1, |c| c[0]).unwrap(), 1);
        mm.require_resident(xid, 2).unwrap();
        assert_eq!(mm.with_chunk(xid, 2, |c| c[0]).unwrap(), 2);
        mm.chain_remove(xid);
        mm.initiate_shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn release_returns_chunk_and_blocks_future_access() {
        let dir = tempdir().unwrap();
        let mm = manager(4, 8, dir.path());
        let xid = Xid::new(3, 3, 3);
        mm.chain_init(xid);
        mm.chain_grow(xid).unwrap();
        mm.chain_grow(xid).unwrap();
        mm.chain_mark_release(xid);
        mm.chain_release_chunk(xid, 0).unwrap();
        assert!(mm.with_chunk(xid, 0, |_| ()).is_err());
        assert!(mm.require_resident(xid, 0).is_err());
        assert!(mm.with_chunk(xid, 1, |_| ()).is_ok());
        mm.chain_remove(xid);
    }
}
