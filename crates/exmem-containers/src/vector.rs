//! The paged vector.
//!
//! An [`ExtVector`] gives random access to a sequence far larger than
//! RAM. The index space is split into pages of `blocks_per_page`
//! blocks; a bounded set of page frames is kept in memory under a
//! pluggable replacement strategy. A page miss costs one batch of
//! block reads (plus a write-back batch when the victim is dirty);
//! a hit costs nothing.

use exmem_buffer::pager::{Pager, PagerKind};
use exmem_common::{Bid, ExmemError, Record, Result};
use exmem_io::request::{alloc_block_buf, BlockBuf};
use exmem_io::{AllocStrategy, BlockManager};
use std::io::Write;
use std::sync::Arc;
use tracing::trace;

/// Configuration for a paged vector.
#[derive(Debug, Clone)]
pub struct VectorConfig {
    /// Block size in bytes.
    pub block_size: usize,
    /// Blocks per page (the unit of caching).
    pub blocks_per_page: usize,
    /// Number of resident page frames.
    pub num_pages: usize,
    /// Block allocation strategy.
    pub alloc_strategy: AllocStrategy,
    /// Page replacement strategy.
    pub pager: PagerKind,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            blocks_per_page: 4,
            num_pages: 8,
            alloc_strategy: AllocStrategy::Striping,
            pager: PagerKind::Lru,
        }
    }
}

/// One resident page frame.
struct Frame {
    /// The page held, if any.
    page: Option<usize>,
    /// One buffer per block of the page.
    bufs: Vec<BlockBuf>,
    dirty: bool,
    /// Non-zero only while an iterator rests on this page.
    pins: u32,
}

/// A paged vector of fixed-size records on external storage.
///
/// The public API is single-threaded; callers synchronise externally.
pub struct ExtVector<T: Record> {
    manager: Arc<BlockManager>,
    config: VectorConfig,
    len: u64,
    /// Block ids in index order; a page owns a contiguous run of
    /// `blocks_per_page` entries. Pages are allocated lazily on first
    /// touch, so a vector of size 0 owns no blocks.
    bids: Vec<Bid>,
    /// page -> frame index.
    page_table: Vec<Option<usize>>,
    frames: Vec<Frame>,
    pager: Box<dyn Pager>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Record> ExtVector<T> {
    /// Creates an empty vector.
    pub fn new(manager: Arc<BlockManager>, config: VectorConfig) -> Self {
        assert!(config.block_size >= T::SIZE);
        assert!(config.blocks_per_page > 0);
        assert!(config.num_pages > 0);

        let frames = (0..config.num_pages)
            .map(|_| Frame {
                page: None,
                bufs: (0..config.blocks_per_page)
                    .map(|_| alloc_block_buf(config.block_size))
                    .collect(),
                dirty: false,
                pins: 0,
            })
            .collect();
        let pager = config.pager.build(config.num_pages);

        Self {
            manager,
            config,
            len: 0,
            bids: Vec::new(),
            page_table: Vec::new(),
            frames,
            pager,
            _marker: std::marker::PhantomData,
        }
    }

    /// Creates a vector of `n` default-initialised (zero-byte) slots.
    pub fn with_len(manager: Arc<BlockManager>, config: VectorConfig, n: u64) -> Self {
        let mut vector = Self::new(manager, config);
        vector.len = n;
        vector
    }

    /// Number of elements.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when the vector holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Elements held by one block.
    fn per_block(&self) -> usize {
        self.config.block_size / T::SIZE
    }

    /// Elements held by one page.
    fn per_page(&self) -> usize {
        self.per_block() * self.config.blocks_per_page
    }

    /// Number of blocks currently allocated.
    pub fn allocated_blocks(&self) -> usize {
        self.bids.iter().filter(|b| b.is_valid()).count()
    }

    /// Reads element `i`.
    pub fn get(&mut self, i: u64) -> Result<T> {
        assert!(i < self.len, "index {} out of bounds (len {})", i, self.len);
        let (page, block, slot) = self.locate(i);
        let frame = self.fault(page)?;
        let guard = self.frames[frame].bufs[block].lock();
        Ok(T::read_from(&guard[slot * T::SIZE..]))
    }

    /// Writes element `i`.
    pub fn set(&mut self, i: u64, value: T) -> Result<()> {
        assert!(i < self.len, "index {} out of bounds (len {})", i, self.len);
        let (page, block, slot) = self.locate(i);
        let frame = self.fault(page)?;
        {
            let mut guard = self.frames[frame].bufs[block].lock();
            value.write_to(&mut guard[slot * T::SIZE..]);
        }
        self.frames[frame].dirty = true;
        Ok(())
    }

    /// Appends an element.
    pub fn push_back(&mut self, value: T) -> Result<()> {
        self.len += 1;
        self.set(self.len - 1, value)
    }

    /// Resizes to `n` elements.
    ///
    /// When shrinking with `shrink_free`, every block past the last
    /// page still in use is returned to the block manager.
    pub fn resize(&mut self, n: u64, shrink_free: bool) -> Result<()> {
        if n < self.len && shrink_free {
            let pages_needed = if n == 0 {
                0
            } else {
                (n as usize + self.per_page() - 1) / self.per_page()
            };
            let blocks_needed = pages_needed * self.config.blocks_per_page;

            // Drop frames holding pages past the new end.
            for page in pages_needed..self.page_table.len() {
                if let Some(frame) = self.page_table[page].take() {
                    self.frames[frame].page = None;
                    self.frames[frame].dirty = false;
                }
            }

            if blocks_needed < self.bids.len() {
                let freed: Vec<Bid> = self.bids.split_off(blocks_needed);
                self.manager
                    .delete_blocks(freed.into_iter().filter(|b| b.is_valid()));
            }
            self.page_table.truncate(pages_needed);
        }
        self.len = n;
        Ok(())
    }

    /// Forces all dirty pages to disk; they stay resident and clean.
    pub fn flush(&mut self) -> Result<()> {
        for frame_idx in 0..self.frames.len() {
            if self.frames[frame_idx].page.is_some() && self.frames[frame_idx].dirty {
                self.write_back(frame_idx)?;
            }
        }
        Ok(())
    }

    /// Tells the vector that `page`'s on-disk content changed behind
    /// its back: any cached copy is discarded without write-back.
    pub fn block_externally_updated(&mut self, page: usize) {
        if page < self.page_table.len() {
            if let Some(frame) = self.page_table[page].take() {
                self.frames[frame].page = None;
                self.frames[frame].dirty = false;
                self.frames[frame].pins = 0;
            }
        }
    }

    /// Streaming iterator over `[0, len)`. The iterator pins the page
    /// it currently rests on.
    pub fn iter(&mut self) -> VecIter<'_, T> {
        VecIter {
            vector: self,
            pos: 0,
            pinned: None,
        }
    }

    /// Flushes the vector and exports its contents to regular files:
    /// `{prefix}data` holds the elements in index order, and
    /// `{prefix}manifest` lists one ASCII record per page with the
    /// page's origin (`page disk_path byte_offset length`). The
    /// vector is consumed; its blocks are returned to the manager.
    pub fn export_files(mut self, prefix: &str) -> Result<()> {
        self.flush()?;

        let mut data = std::fs::File::create(format!("{}data", prefix))?;
        let mut manifest = std::fs::File::create(format!("{}manifest", prefix))?;

        let per_block = self.per_block();
        let mut remaining = self.len as usize;
        let buf = alloc_block_buf(self.config.block_size);

        for (index, &bid) in self.bids.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let elements = remaining.min(per_block);
            if bid.is_valid() {
                self.manager.read_block(bid, buf.clone()).wait()?;
                data.write_all(&buf.lock()[..elements * T::SIZE])?;
            } else {
                // Never-written block within a live page: zero slots.
                data.write_all(&vec![0u8; elements * T::SIZE])?;
            }

            // One manifest record per block: pages stripe their blocks
            // across disks.
            let page = index / self.config.blocks_per_page;
            let path = if bid.is_valid() {
                self.manager.disk_path(bid.disk)
            } else {
                std::path::PathBuf::new()
            };
            writeln!(
                manifest,
                "{} {} {} {}",
                page,
                path.display(),
                bid.offset,
                elements * T::SIZE
            )?;
            remaining -= elements;
        }

        data.sync_all()?;
        manifest.sync_all()?;

        let bids = std::mem::take(&mut self.bids);
        self.manager
            .delete_blocks(bids.into_iter().filter(|b| b.is_valid()));
        Ok(())
    }

    /// Reads back a `{prefix}data` file produced by [`export_files`].
    ///
    /// [`export_files`]: ExtVector::export_files
    pub fn read_exported(prefix: &str) -> Result<Vec<T>> {
        let bytes = std::fs::read(format!("{}data", prefix))?;
        Ok(bytes
            .chunks_exact(T::SIZE)
            .map(T::read_from)
            .collect())
    }

    fn locate(&self, i: u64) -> (usize, usize, usize) {
        let per_block = self.per_block();
        let per_page = self.per_page();
        let page = (i as usize) / per_page;
        let within = (i as usize) % per_page;
        (page, within / per_block, within % per_block)
    }

    /// Makes sure the blocks of `page` exist, allocating the whole
    /// page's run in one batch.
    fn ensure_allocated(&mut self, page: usize) -> Result<()> {
        let bpp = self.config.blocks_per_page;
        let needed = (page + 1) * bpp;
        if self.bids.len() < needed {
            self.bids.resize(needed, Bid::INVALID);
        }
        if !self.bids[page * bpp].is_valid() {
            let fresh = self.manager.new_blocks(
                &self.config.alloc_strategy,
                bpp,
                self.config.block_size as u32,
            )?;
            self.bids[page * bpp..(page + 1) * bpp].copy_from_slice(&fresh);
        }
        Ok(())
    }

    /// Writes every block of the page in `frame` back to disk. All
    /// writes enter the queues together, then each is awaited.
    fn write_back(&mut self, frame: usize) -> Result<()> {
        let page = self.frames[frame].page.expect("write_back of empty frame");
        let bpp = self.config.blocks_per_page;

        let requests: Vec<_> = (0..bpp)
            .map(|b| {
                let bid = self.bids[page * bpp + b];
                self.manager
                    .write_block(bid, self.frames[frame].bufs[b].clone())
            })
            .collect();
        for request in &requests {
            request.wait()?;
        }
        self.frames[frame].dirty = false;
        trace!(page, "vector page written back");
        Ok(())
    }

    /// Returns the frame holding `page`, faulting it in if necessary.
    fn fault(&mut self, page: usize) -> Result<usize> {
        if self.page_table.len() <= page {
            self.page_table.resize(page + 1, None);
        }
        if let Some(frame) = self.page_table[page] {
            self.pager.touch(frame);
            return Ok(frame);
        }

        // Prefer a free frame; otherwise ask the pager, skipping
        // pinned frames.
        let frame = match self.frames.iter().position(|f| f.page.is_none()) {
            Some(free) => free,
            None => {
                let mut victim = None;
                for _ in 0..2 * self.frames.len() {
                    let candidate = self.pager.kick();
                    if self.frames[candidate].pins == 0 {
                        victim = Some(candidate);
                        break;
                    }
                }
                let victim = victim.ok_or(ExmemError::CacheExhausted)?;
                if self.frames[victim].dirty {
                    self.write_back(victim)?;
                }
                let old = self.frames[victim].page.take().unwrap();
                self.page_table[old] = None;
                victim
            }
        };

        // Load the page: all reads enter the queues together.
        self.ensure_allocated(page)?;
        let bpp = self.config.blocks_per_page;
        let requests: Vec<_> = (0..bpp)
            .map(|b| {
                let bid = self.bids[page * bpp + b];
                self.manager
                    .read_block(bid, self.frames[frame].bufs[b].clone())
            })
            .collect();
        for request in &requests {
            request.wait()?;
        }

        self.frames[frame].page = Some(page);
        self.frames[frame].dirty = false;
        self.page_table[page] = Some(frame);
        self.pager.touch(frame);
        Ok(frame)
    }
}

impl<T: Record> Drop for ExtVector<T> {
    fn drop(&mut self) {
        // Best effort write-back; blocks are freed with the manager's
        // extent maps when the process ends.
        let _ = self.flush();
        let bids = std::mem::take(&mut self.bids);
        self.manager
            .delete_blocks(bids.into_iter().filter(|b| b.is_valid()));
    }
}

/// Streaming iterator over a paged vector.
///
/// Holding the iterator pins the page under the cursor, so the
/// reference implied by the last `next()` stays resident until the
/// iterator advances off the page, is flushed, or is dropped.
pub struct VecIter<'a, T: Record> {
    vector: &'a mut ExtVector<T>,
    pos: u64,
    pinned: Option<usize>,
}

impl<T: Record> VecIter<'_, T> {
    /// Unpins the current page without consuming the iterator.
    pub fn flush(&mut self) {
        if let Some(frame) = self.pinned.take() {
            self.vector.frames[frame].pins =
                self.vector.frames[frame].pins.saturating_sub(1);
        }
    }
}

impl<T: Record> Iterator for VecIter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.vector.len {
            self.flush();
            return None;
        }

        let (page, _, _) = self.vector.locate(self.pos);
        let frame = match self.vector.fault(page) {
            Ok(frame) => frame,
            Err(e) => return Some(Err(e)),
        };

        // Re-pin when crossing onto a new page.
        if self.pinned != Some(frame) {
            self.flush();
            self.vector.frames[frame].pins += 1;
            self.pinned = Some(frame);
        }

        let value = self.vector.get(self.pos);
        self.pos += 1;
        Some(value)
    }
}

impl<T: Record> Drop for VecIter<'_, T> {
    fn drop(&mut self) {
        self.flush();
    }
}
