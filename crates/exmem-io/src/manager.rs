//! The block manager: block allocation across disks plus request
//! submission.
//!
//! The manager owns the configured disk files, a free-extent map per
//! disk, and the per-disk request queues. Striping strategies decide
//! which disk serves each allocation; within a disk, extents are
//! handed out first-fit (or at a random slot for the fully random
//! strategy) and coalesced on free.

use crate::file::DiskFile;
use crate::queue::RequestQueue;
use crate::request::{BlockBuf, Request, RequestHandle};
use crate::strategy::AllocStrategy;
use exmem_common::{Bid, DiskConfig, ExmemError, Result};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Free space of one disk as an ordered offset -> length map.
struct ExtentMap {
    free: BTreeMap<u64, u64>,
    free_bytes: u64,
}

impl ExtentMap {
    fn new(capacity: u64) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            free,
            free_bytes: capacity,
        }
    }

    fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// First-fit allocation.
    fn allocate(&mut self, size: u64) -> Option<u64> {
        let (&start, &len) = self.free.iter().find(|(_, &len)| len >= size)?;
        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        self.free_bytes -= size;
        Some(start)
    }

    /// Allocation at a random block-aligned slot of a random eligible
    /// extent.
    fn allocate_random(&mut self, size: u64, rng: &mut impl Rng) -> Option<u64> {
        let candidates: Vec<u64> = self
            .free
            .iter()
            .filter(|(_, &len)| len >= size)
            .map(|(&start, _)| start)
            .collect();
        let &start = candidates.choose(rng)?;
        let len = self.free.remove(&start).unwrap();

        let slots = (len - size) / size + 1;
        let slot = rng.gen_range(0..slots);
        let offset = start + slot * size;

        if offset > start {
            self.free.insert(start, offset - start);
        }
        let tail = start + len - (offset + size);
        if tail > 0 {
            self.free.insert(offset + size, tail);
        }
        self.free_bytes -= size;
        Some(offset)
    }

    /// Returns an extent, merging with adjacent free neighbours.
    fn release(&mut self, offset: u64, size: u64) {
        let mut start = offset;
        let mut len = size;

        if let Some((&prev_start, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_start + prev_len == offset {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + size)) {
            self.free.remove(&(offset + size));
            len += next_len;
        }

        self.free.insert(start, len);
        self.free_bytes += size;
    }
}

struct DiskState {
    file: Arc<DiskFile>,
    free: Mutex<ExtentMap>,
}

/// Allocates and frees fixed-size blocks across the configured disks
/// and routes block transfers to the per-disk request queues.
///
/// Thread-safe: allocation takes only the target disk's extent lock.
pub struct BlockManager {
    disks: Vec<DiskState>,
    queue: RequestQueue,
    counter: AtomicU64,
    total_bytes: u64,
}

static GLOBAL: Mutex<Option<Arc<BlockManager>>> = Mutex::new(None);

impl BlockManager {
    /// Opens the configured disks and spawns their I/O workers.
    pub fn new(config: &DiskConfig) -> Result<Arc<Self>> {
        let mut disks = Vec::with_capacity(config.disks.len());
        for (index, spec) in config.disks.iter().enumerate() {
            let file = Arc::new(DiskFile::open(index as u32, spec)?);
            disks.push(DiskState {
                file: Arc::clone(&file),
                free: Mutex::new(ExtentMap::new(spec.size)),
            });
        }

        let queue = RequestQueue::new(disks.iter().map(|d| Arc::clone(&d.file)).collect());

        debug!(
            disks = disks.len(),
            total_bytes = config.total_bytes(),
            "block manager started"
        );

        Ok(Arc::new(Self {
            disks,
            queue,
            counter: AtomicU64::new(0),
            total_bytes: config.total_bytes(),
        }))
    }

    /// The process-wide block manager, created on first use from the
    /// environment's disk configuration (`DISKFILES`).
    pub fn global() -> Result<Arc<Self>> {
        let mut slot = GLOBAL.lock();
        if let Some(manager) = slot.as_ref() {
            return Ok(Arc::clone(manager));
        }
        let manager = Self::new(&DiskConfig::from_env()?)?;
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Number of configured disks.
    pub fn num_disks(&self) -> usize {
        self.disks.len()
    }

    /// Total capacity in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Currently unallocated bytes across all disks.
    pub fn free_bytes(&self) -> u64 {
        self.disks.iter().map(|d| d.free.lock().free_bytes()).sum()
    }

    /// Path of the file backing disk `disk`.
    pub fn disk_path(&self, disk: u32) -> std::path::PathBuf {
        self.disks[disk as usize].file.path().to_path_buf()
    }

    /// Allocates one block of `size` bytes.
    pub fn new_block(&self, strategy: &AllocStrategy, size: u32) -> Result<Bid> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let start = strategy.next_disk(counter, self.disks.len());

        // Fall back round-robin when the preferred disk is full.
        for attempt in 0..self.disks.len() {
            let disk = (start + attempt) % self.disks.len();
            let mut free = self.disks[disk].free.lock();
            let offset = if strategy.wants_random_slot() {
                free.allocate_random(size as u64, &mut rand::thread_rng())
            } else {
                free.allocate(size as u64)
            };
            if let Some(offset) = offset {
                return Ok(Bid::new(disk as u32, offset, size));
            }
        }

        Err(ExmemError::NoSpace {
            requested: size as u64,
        })
    }

    /// Allocates `n` blocks of `size` bytes, advancing the striping
    /// counter once per block.
    pub fn new_blocks(
        &self,
        strategy: &AllocStrategy,
        n: usize,
        size: u32,
    ) -> Result<Vec<Bid>> {
        let mut bids = Vec::with_capacity(n);
        for _ in 0..n {
            match self.new_block(strategy, size) {
                Ok(bid) => bids.push(bid),
                Err(e) => {
                    // Roll back so a failed batch leaks nothing.
                    self.delete_blocks(bids);
                    return Err(e);
                }
            }
        }
        Ok(bids)
    }

    /// Returns a block to its disk's free map. Invalid bids are
    /// ignored.
    pub fn delete_block(&self, bid: Bid) {
        if !bid.is_valid() {
            return;
        }
        self.disks[bid.disk as usize]
            .free
            .lock()
            .release(bid.offset, bid.size as u64);
    }

    /// Frees a batch of blocks.
    pub fn delete_blocks(&self, bids: impl IntoIterator<Item = Bid>) {
        for bid in bids {
            self.delete_block(bid);
        }
    }

    /// Submits an asynchronous read of `bid` into `buffer`.
    pub fn read_block(&self, bid: Bid, buffer: BlockBuf) -> RequestHandle {
        debug_assert!(bid.is_valid());
        let request = Request::read(bid.disk, bid.offset, bid.size as usize, buffer);
        self.queue.submit(request.clone());
        request
    }

    /// Submits an asynchronous write of `buffer` to `bid`.
    pub fn write_block(&self, bid: Bid, buffer: BlockBuf) -> RequestHandle {
        debug_assert!(bid.is_valid());
        let request = Request::write(bid.disk, bid.offset, bid.size as usize, buffer);
        self.queue.submit(request.clone());
        request
    }

    /// Cancels a queued request; see [`RequestQueue::cancel`].
    pub fn cancel(&self, request: &RequestHandle) -> bool {
        self.queue.cancel(request)
    }
}
