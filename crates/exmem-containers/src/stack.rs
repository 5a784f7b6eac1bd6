//! External LIFO stacks.
//!
//! Four backings with the same surface:
//!
//! - [`NormalStack`]: one RAM block, synchronous I/O on block
//!   boundaries.
//! - [`GrowShrinkStack`]: write-behind on push and one block of
//!   read-ahead on pop (single-pass consumption).
//! - [`GrowShrinkStack2`]: pool-backed; pushes go through the pool's
//!   write-behind list, pops past a block boundary pre-issue reads for
//!   the next blocks toward the bottom (`set_prefetch_aggr` tunes how
//!   many).
//! - [`MigratingStack`]: starts as a plain `Vec` and crosses over to
//!   external storage past a threshold.

use exmem_buffer::ReadWritePool;
use exmem_common::{Bid, Record, Result};
use exmem_io::request::{alloc_block_buf, BlockBuf};
use exmem_io::{AllocStrategy, BlockManager, RequestHandle};
use std::sync::Arc;

/// Configuration shared by the external stack backings.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Block size in bytes.
    pub block_size: usize,
    /// Block allocation strategy.
    pub alloc_strategy: AllocStrategy,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            alloc_strategy: AllocStrategy::Striping,
        }
    }
}

fn store_block<T: Record>(buf: &BlockBuf, elements: &[T]) {
    let mut guard = buf.lock();
    for (i, value) in elements.iter().enumerate() {
        value.write_to(&mut guard[i * T::SIZE..]);
    }
}

fn load_block<T: Record>(buf: &BlockBuf, count: usize) -> Vec<T> {
    let guard = buf.lock();
    (0..count).map(|i| T::read_from(&guard[i * T::SIZE..])).collect()
}

/// External stack with one cached block and synchronous block I/O.
pub struct NormalStack<T: Record> {
    manager: Arc<BlockManager>,
    config: StackConfig,
    size: u64,
    /// Bids of full blocks, bottom first.
    bids: Vec<Bid>,
    /// Elements above the last full block, in push order.
    cache: Vec<T>,
}

impl<T: Record> NormalStack<T> {
    pub fn new(manager: Arc<BlockManager>, config: StackConfig) -> Self {
        assert!(config.block_size >= T::SIZE);
        Self {
            manager,
            config,
            size: 0,
            bids: Vec::new(),
            cache: Vec::new(),
        }
    }

    fn per_block(&self) -> usize {
        self.config.block_size / T::SIZE
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        if self.cache.len() == self.per_block() {
            let bid = self
                .manager
                .new_block(&self.config.alloc_strategy, self.config.block_size as u32)?;
            let buf = alloc_block_buf(self.config.block_size);
            store_block(&buf, &self.cache);
            self.manager.write_block(bid, buf).wait()?;
            self.bids.push(bid);
            self.cache.clear();
        }
        self.cache.push(value);
        self.size += 1;
        Ok(())
    }

    pub fn top(&mut self) -> Result<Option<T>> {
        if self.cache.is_empty() {
            self.refill()?;
        }
        Ok(self.cache.last().copied())
    }

    pub fn pop(&mut self) -> Result<Option<T>> {
        if self.cache.is_empty() {
            self.refill()?;
        }
        let value = self.cache.pop();
        if value.is_some() {
            self.size -= 1;
        }
        Ok(value)
    }

    pub fn clear(&mut self) {
        self.manager.delete_blocks(self.bids.drain(..));
        self.cache.clear();
        self.size = 0;
    }

    fn refill(&mut self) -> Result<()> {
        let Some(bid) = self.bids.pop() else {
            return Ok(());
        };
        let buf = alloc_block_buf(self.config.block_size);
        self.manager.read_block(bid, buf.clone()).wait()?;
        self.cache = load_block(&buf, self.per_block());
        self.manager.delete_block(bid);
        Ok(())
    }
}

impl<T: Record> Drop for NormalStack<T> {
    fn drop(&mut self) {
        self.manager.delete_blocks(self.bids.drain(..));
    }
}

/// External stack that overlaps I/O with computation: pushes write
/// behind, pops read the preceding block ahead.
pub struct GrowShrinkStack<T: Record> {
    manager: Arc<BlockManager>,
    config: StackConfig,
    size: u64,
    bids: Vec<Bid>,
    cache: Vec<T>,
    /// Outstanding write of the most recently filled block.
    pending_write: Option<(Bid, RequestHandle, BlockBuf)>,
    /// Read-ahead of the block below the current one.
    prefetched: Option<(Bid, RequestHandle, BlockBuf)>,
}

impl<T: Record> GrowShrinkStack<T> {
    pub fn new(manager: Arc<BlockManager>, config: StackConfig) -> Self {
        assert!(config.block_size >= T::SIZE);
        Self {
            manager,
            config,
            size: 0,
            bids: Vec::new(),
            cache: Vec::new(),
            pending_write: None,
            prefetched: None,
        }
    }

    fn per_block(&self) -> usize {
        self.config.block_size / T::SIZE
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        if self.cache.len() == self.per_block() {
            // The previous write must land before its buffer's slot in
            // the LIFO order can matter again; one outstanding write
            // keeps push overlapped without unbounded buffers.
            if let Some((_, request, _)) = self.pending_write.take() {
                request.wait()?;
            }
            let bid = self
                .manager
                .new_block(&self.config.alloc_strategy, self.config.block_size as u32)?;
            let buf = alloc_block_buf(self.config.block_size);
            store_block(&buf, &self.cache);
            let request = self.manager.write_block(bid, buf.clone());
            self.pending_write = Some((bid, request, buf));
            self.bids.push(bid);
            self.cache.clear();
        }
        self.cache.push(value);
        self.size += 1;
        Ok(())
    }

    pub fn top(&mut self) -> Result<Option<T>> {
        if self.cache.is_empty() {
            self.refill()?;
        }
        Ok(self.cache.last().copied())
    }

    pub fn pop(&mut self) -> Result<Option<T>> {
        if self.cache.is_empty() {
            self.refill()?;
        }
        let value = self.cache.pop();
        if value.is_some() {
            self.size -= 1;
        }
        Ok(value)
    }

    pub fn clear(&mut self) {
        if let Some((_, request, _)) = self.pending_write.take() {
            let _ = request.wait();
        }
        if let Some((_, request, _)) = self.prefetched.take() {
            let _ = request.wait();
        }
        self.manager.delete_blocks(self.bids.drain(..));
        self.cache.clear();
        self.size = 0;
    }

    fn refill(&mut self) -> Result<()> {
        let Some(bid) = self.bids.pop() else {
            return Ok(());
        };

        // A still-pending write of this very block must land first.
        if let Some((write_bid, request, _)) = self.pending_write.take() {
            request.wait()?;
            debug_assert!(write_bid == bid || self.bids.contains(&write_bid));
        }

        let buf = match self.prefetched.take() {
            Some((pf_bid, request, buf)) if pf_bid == bid => {
                request.wait()?;
                buf
            }
            other => {
                // Wrong or missing prefetch: plain read.
                if let Some((_, request, _)) = other {
                    let _ = request.wait();
                }
                let buf = alloc_block_buf(self.config.block_size);
                self.manager.read_block(bid, buf.clone()).wait()?;
                buf
            }
        };
        self.cache = load_block(&buf, self.per_block());
        self.manager.delete_block(bid);

        // Single-pass read-ahead: start fetching the next block down.
        if let Some(&next) = self.bids.last() {
            let pf = alloc_block_buf(self.config.block_size);
            let request = self.manager.read_block(next, pf.clone());
            self.prefetched = Some((next, request, pf));
        }
        Ok(())
    }
}

impl<T: Record> Drop for GrowShrinkStack<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Pool-backed grow/shrink stack.
///
/// The current top block lives in RAM; filled blocks go to the pool's
/// write-behind list. Popping past a block boundary reads through the
/// pool (stealing a pending write when the block never reached disk)
/// and hints the next `prefetch_aggressiveness` blocks toward the
/// bottom, so pop streams without blocking while the queues keep up.
pub struct GrowShrinkStack2<T: Record> {
    manager: Arc<BlockManager>,
    config: StackConfig,
    pool: ReadWritePool,
    prefetch_aggr: usize,
    size: u64,
    bids: Vec<Bid>,
    cache: Vec<T>,
}

impl<T: Record> GrowShrinkStack2<T> {
    /// Creates a stack over a private pool with `prefetch` read slots
    /// and `write_behind` write slots.
    pub fn new(
        manager: Arc<BlockManager>,
        config: StackConfig,
        prefetch: usize,
        write_behind: usize,
    ) -> Self {
        assert!(config.block_size >= T::SIZE);
        let pool = ReadWritePool::new(
            Arc::clone(&manager),
            config.block_size,
            prefetch,
            write_behind.max(1),
        );
        Self {
            manager,
            config,
            pool,
            prefetch_aggr: prefetch.min(1),
            size: 0,
            bids: Vec::new(),
            cache: Vec::new(),
        }
    }

    fn per_block(&self) -> usize {
        self.config.block_size / T::SIZE
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Sets how many blocks below the current one each boundary pop
    /// pre-fetches. Grows the pool's prefetch list when needed.
    pub fn set_prefetch_aggr(&mut self, aggr: usize) -> Result<()> {
        if aggr > self.pool.prefetch_capacity() {
            self.pool.resize_prefetch(aggr)?;
        }
        self.prefetch_aggr = aggr;
        Ok(())
    }

    /// Current prefetch aggressiveness.
    pub fn prefetch_aggr(&self) -> usize {
        self.prefetch_aggr
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        if self.cache.len() == self.per_block() {
            let bid = self
                .manager
                .new_block(&self.config.alloc_strategy, self.config.block_size as u32)?;
            let buf = alloc_block_buf(self.config.block_size);
            store_block(&buf, &self.cache);
            self.pool.write(bid, buf)?;
            self.bids.push(bid);
            self.cache.clear();
        }
        self.cache.push(value);
        self.size += 1;
        Ok(())
    }

    pub fn top(&mut self) -> Result<Option<T>> {
        if self.cache.is_empty() {
            self.refill()?;
        }
        Ok(self.cache.last().copied())
    }

    pub fn pop(&mut self) -> Result<Option<T>> {
        if self.cache.is_empty() {
            self.refill()?;
        }
        let value = self.cache.pop();
        if value.is_some() {
            self.size -= 1;
        }
        Ok(value)
    }

    pub fn clear(&mut self) {
        for bid in self.bids.drain(..) {
            self.pool.invalidate(bid);
            self.manager.delete_block(bid);
        }
        self.cache.clear();
        self.size = 0;
    }

    fn refill(&mut self) -> Result<()> {
        let Some(bid) = self.bids.pop() else {
            return Ok(());
        };

        // A pending write of this block short-circuits to its buffer.
        let buf = match self.pool.steal(bid) {
            Some(buf) => buf,
            None => self.pool.read(bid)?.wait()?,
        };
        self.cache = load_block(&buf, self.per_block());
        self.pool.invalidate(bid);
        self.manager.delete_block(bid);

        // Pre-issue reads for the next blocks toward the bottom.
        let lookahead = self.prefetch_aggr.min(self.bids.len());
        for i in 0..lookahead {
            let below = self.bids[self.bids.len() - 1 - i];
            self.pool.hint(below)?;
        }
        Ok(())
    }
}

impl<T: Record> Drop for GrowShrinkStack2<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Stack that lives in RAM until it outgrows a threshold, then moves
/// to external storage. It never migrates back.
pub struct MigratingStack<T: Record> {
    manager: Arc<BlockManager>,
    config: StackConfig,
    threshold: usize,
    internal: Option<Vec<T>>,
    external: Option<GrowShrinkStack2<T>>,
}

impl<T: Record> MigratingStack<T> {
    /// `threshold` is the element count that triggers migration.
    pub fn new(manager: Arc<BlockManager>, config: StackConfig, threshold: usize) -> Self {
        Self {
            manager,
            config,
            threshold,
            internal: Some(Vec::new()),
            external: None,
        }
    }

    /// True while the contents still live in RAM.
    pub fn is_internal(&self) -> bool {
        self.internal.is_some()
    }

    pub fn len(&self) -> u64 {
        match (&self.internal, &self.external) {
            (Some(v), _) => v.len() as u64,
            (None, Some(s)) => s.len(),
            (None, None) => unreachable!(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        if let Some(v) = &mut self.internal {
            if v.len() < self.threshold {
                v.push(value);
                return Ok(());
            }
            // Crossing the threshold: spill bottom-up.
            let values = self.internal.take().unwrap();
            let mut external = GrowShrinkStack2::new(
                Arc::clone(&self.manager),
                self.config.clone(),
                2,
                4,
            );
            for v in values {
                external.push(v)?;
            }
            self.external = Some(external);
        }
        self.external.as_mut().unwrap().push(value)
    }

    pub fn top(&mut self) -> Result<Option<T>> {
        match (&mut self.internal, &mut self.external) {
            (Some(v), _) => Ok(v.last().copied()),
            (None, Some(s)) => s.top(),
            (None, None) => unreachable!(),
        }
    }

    pub fn pop(&mut self) -> Result<Option<T>> {
        match (&mut self.internal, &mut self.external) {
            (Some(v), _) => Ok(v.pop()),
            (None, Some(s)) => s.pop(),
            (None, None) => unreachable!(),
        }
    }
}
