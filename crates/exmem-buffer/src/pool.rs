//! The read/write pool.
//!
//! A bounded pool of block buffers split into two LRU lists: prefetch
//! slots holding blocks that were read (or are being read) ahead of
//! use, and write slots holding dirty blocks on their way to disk
//! (write-behind). Slots are keyed by [`Bid`].
//!
//! Invariant: a slot in the write list is dirty and has a submitted
//! write request; a slot in the prefetch list is clean.

use exmem_common::{Bid, Result};
use exmem_io::request::{alloc_block_buf, BlockBuf};
use exmem_io::{BlockManager, RequestHandle};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

struct PrefetchSlot {
    bid: Bid,
    buf: BlockBuf,
    /// In-flight read, if the block has not yet arrived.
    request: Option<RequestHandle>,
}

struct WriteSlot {
    bid: Bid,
    buf: BlockBuf,
    /// The submitted write-behind request.
    request: RequestHandle,
}

/// A block obtained from the pool. `wait()` blocks until the backing
/// read (if any) has completed and hands out the buffer.
pub struct PoolRead {
    buf: BlockBuf,
    request: Option<RequestHandle>,
}

impl PoolRead {
    /// Waits for the read to complete and returns the buffer.
    pub fn wait(self) -> Result<BlockBuf> {
        if let Some(request) = &self.request {
            request.wait()?;
        }
        Ok(self.buf)
    }

    /// True once the block content is available without blocking.
    pub fn ready(&self) -> bool {
        self.request.as_ref().map_or(true, |r| r.poll())
    }
}

/// Bounded pool of prefetched reads and write-behind buffers.
///
/// Not internally synchronised beyond the request level: a pool lives
/// inside one container and inherits its single-threaded contract.
pub struct ReadWritePool {
    manager: Arc<BlockManager>,
    block_size: usize,
    prefetch_cap: usize,
    write_cap: usize,
    /// LRU order, oldest at the front.
    prefetch: VecDeque<PrefetchSlot>,
    writes: VecDeque<WriteSlot>,
}

impl ReadWritePool {
    /// Creates a pool with `prefetch_cap` read slots and `write_cap`
    /// write-behind slots of `block_size` bytes each.
    pub fn new(
        manager: Arc<BlockManager>,
        block_size: usize,
        prefetch_cap: usize,
        write_cap: usize,
    ) -> Self {
        Self {
            manager,
            block_size,
            prefetch_cap,
            write_cap,
            prefetch: VecDeque::new(),
            writes: VecDeque::new(),
        }
    }

    /// Block size served by this pool.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Current prefetch capacity.
    pub fn prefetch_capacity(&self) -> usize {
        self.prefetch_cap
    }

    /// Current write capacity.
    pub fn write_capacity(&self) -> usize {
        self.write_cap
    }

    /// Number of write slots currently pending.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Reads `bid`, returning immediately when the block is resident.
    ///
    /// A pending write for the same bid is awaited and its buffer
    /// reused, so a read after a write observes the written contents.
    pub fn read(&mut self, bid: Bid) -> Result<PoolRead> {
        // Pending write for this bid: its buffer is the newest content.
        if let Some(pos) = self.writes.iter().position(|s| s.bid == bid) {
            let slot = self.writes.remove(pos).unwrap();
            slot.request.wait()?;
            trace!(%bid, "pool read coalesced with pending write");
            self.insert_prefetch(bid, slot.buf.clone(), None)?;
            return Ok(PoolRead {
                buf: slot.buf,
                request: None,
            });
        }

        // Resident (or arriving) prefetch slot: refresh LRU position.
        if let Some(pos) = self.prefetch.iter().position(|s| s.bid == bid) {
            let slot = self.prefetch.remove(pos).unwrap();
            let read = PoolRead {
                buf: slot.buf.clone(),
                request: slot.request.clone(),
            };
            self.prefetch.push_back(slot);
            return Ok(read);
        }

        // Miss: take a buffer and submit the read.
        let buf = self.take_prefetch_buffer()?;
        let request = self.manager.read_block(bid, buf.clone());
        if self.prefetch_cap > 0 {
            self.prefetch.push_back(PrefetchSlot {
                bid,
                buf: buf.clone(),
                request: Some(request.clone()),
            });
        }
        Ok(PoolRead {
            buf,
            request: Some(request),
        })
    }

    /// Starts reading `bid` without blocking the caller.
    pub fn hint(&mut self, bid: Bid) -> Result<()> {
        let resident = self.prefetch.iter().any(|s| s.bid == bid)
            || self.writes.iter().any(|s| s.bid == bid);
        if resident || self.prefetch_cap == 0 {
            return Ok(());
        }
        let buf = self.take_prefetch_buffer()?;
        let request = self.manager.read_block(bid, buf.clone());
        self.prefetch.push_back(PrefetchSlot {
            bid,
            buf,
            request: Some(request),
        });
        Ok(())
    }

    /// Queues `buf` to be written behind to `bid`.
    ///
    /// An existing pending write for the same bid is superseded; when
    /// all write slots are busy, the oldest is awaited before reuse.
    pub fn write(&mut self, bid: Bid, buf: BlockBuf) -> Result<()> {
        // A stale prefetch copy of this block must not serve reads.
        if let Some(pos) = self.prefetch.iter().position(|s| s.bid == bid) {
            let stale = self.prefetch.remove(pos).unwrap();
            if let Some(request) = &stale.request {
                let _ = request.wait();
            }
        }

        if self.write_cap == 0 {
            // No write-behind slots: the write is synchronous.
            return self.manager.write_block(bid, buf).wait();
        }

        if let Some(pos) = self.writes.iter().position(|s| s.bid == bid) {
            let old = self.writes.remove(pos).unwrap();
            if !self.manager.cancel(&old.request) {
                old.request.wait()?;
            }
        } else if self.writes.len() >= self.write_cap {
            let oldest = self.writes.pop_front().unwrap();
            oldest.request.wait()?;
            trace!(bid = %oldest.bid, "pool write slot reclaimed");
        }

        let request = self.manager.write_block(bid, buf.clone());
        self.writes.push_back(WriteSlot { bid, buf, request });
        Ok(())
    }

    /// Dequeues a pending write for `bid` and returns its buffer.
    ///
    /// The queued request is cancelled when still possible, otherwise
    /// awaited; either way the returned buffer holds the newest
    /// contents. Returns `None` when no write for `bid` is pending.
    pub fn steal(&mut self, bid: Bid) -> Option<BlockBuf> {
        let pos = self.writes.iter().position(|s| s.bid == bid)?;
        let slot = self.writes.remove(pos).unwrap();
        if !self.manager.cancel(&slot.request) {
            // Too late to cancel; the disk copy is simply also fresh.
            let _ = slot.request.wait();
        }
        trace!(%bid, "pool write stolen");
        Some(slot.buf)
    }

    /// Forgets any resident copy of `bid` (prefetched or pending
    /// write) without touching the disk.
    pub fn invalidate(&mut self, bid: Bid) {
        if let Some(pos) = self.prefetch.iter().position(|s| s.bid == bid) {
            let slot = self.prefetch.remove(pos).unwrap();
            if let Some(request) = &slot.request {
                let _ = request.wait();
            }
        }
        if let Some(pos) = self.writes.iter().position(|s| s.bid == bid) {
            let slot = self.writes.remove(pos).unwrap();
            if !self.manager.cancel(&slot.request) {
                let _ = slot.request.wait();
            }
        }
    }

    /// Grows or shrinks the prefetch list. Shrinking evicts the oldest
    /// slots, awaiting their in-flight reads.
    pub fn resize_prefetch(&mut self, cap: usize) -> Result<()> {
        self.prefetch_cap = cap;
        while self.prefetch.len() > cap {
            let slot = self.prefetch.pop_front().unwrap();
            if let Some(request) = &slot.request {
                let _ = request.wait();
            }
        }
        Ok(())
    }

    /// Grows or shrinks the write list. Shrinking forces the oldest
    /// writes to complete (synchronous eviction of dirty victims).
    pub fn resize_write(&mut self, cap: usize) -> Result<()> {
        self.write_cap = cap;
        while self.writes.len() > cap {
            let slot = self.writes.pop_front().unwrap();
            slot.request.wait()?;
        }
        Ok(())
    }

    /// Awaits every pending write.
    pub fn flush(&mut self) -> Result<()> {
        while let Some(slot) = self.writes.pop_front() {
            slot.request.wait()?;
        }
        Ok(())
    }

    fn insert_prefetch(
        &mut self,
        bid: Bid,
        buf: BlockBuf,
        request: Option<RequestHandle>,
    ) -> Result<()> {
        if self.prefetch_cap == 0 {
            return Ok(());
        }
        while self.prefetch.len() >= self.prefetch_cap {
            let slot = self.prefetch.pop_front().unwrap();
            if let Some(request) = &slot.request {
                let _ = request.wait();
            }
        }
        self.prefetch.push_back(PrefetchSlot { bid, buf, request });
        Ok(())
    }

    /// Hands out a buffer for a new prefetch slot, evicting the oldest
    /// clean slot when the list is full.
    fn take_prefetch_buffer(&mut self) -> Result<BlockBuf> {
        if self.prefetch.len() < self.prefetch_cap || self.prefetch_cap == 0 {
            return Ok(alloc_block_buf(self.block_size));
        }
        let slot = self.prefetch.pop_front().unwrap();
        if let Some(request) = &slot.request {
            // The previous read may still be in flight; it must finish
            // before its buffer is reused.
            let _ = request.wait();
        }
        Ok(slot.buf)
    }
}

impl Drop for ReadWritePool {
    fn drop(&mut self) {
        // Best effort: no errors out of destructors.
        let _ = self.flush();
    }
}
