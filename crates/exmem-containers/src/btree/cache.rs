//! Pin-counted write-back cache of B+ tree nodes.
//!
//! The tree keeps two instances: one for internal nodes, one for
//! leaves. A byte budget translates into a fixed number of slots.
//! While an entry is pinned it is neither evicted nor written back;
//! when every slot is pinned the cache fails with `CacheExhausted`,
//! which is how the tree detects that its height has outgrown the
//! cache. There is exactly one in-memory copy per bid.

use exmem_common::{Bid, ExmemError, Result};
use exmem_io::request::BlockBuf;
use exmem_io::{AllocStrategy, BlockManager};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// A node type that can live in a [`NodeCache`].
pub(crate) trait CacheNode {
    /// Allocates an empty node for `block_size`-byte blocks.
    fn alloc(block_size: usize) -> Self;

    /// The node's backing buffer, for block transfers.
    fn buf(&self) -> BlockBuf;

    /// Resets the node to its freshly-allocated state.
    fn reset(&mut self);
}

struct Slot<N> {
    bid: Bid,
    node: N,
    pin: u32,
    dirty: bool,
}

/// Fixed-capacity cache of typed nodes keyed by bid.
pub(crate) struct NodeCache<N: CacheNode> {
    manager: Arc<BlockManager>,
    strategy: AllocStrategy,
    block_size: usize,
    slots: Vec<Slot<N>>,
    /// bid -> slot index for resident nodes.
    map: HashMap<Bid, usize>,
    /// Slot indices, least recently used first.
    lru: VecDeque<usize>,
}

impl<N: CacheNode> NodeCache<N> {
    /// Builds a cache of `cache_bytes / block_size` slots (at least
    /// one).
    pub fn new(
        manager: Arc<BlockManager>,
        strategy: AllocStrategy,
        cache_bytes: usize,
        block_size: usize,
    ) -> Self {
        let nslots = (cache_bytes / block_size).max(1);
        let slots = (0..nslots)
            .map(|_| Slot {
                bid: Bid::INVALID,
                node: N::alloc(block_size),
                pin: 0,
                dirty: false,
            })
            .collect();
        Self {
            manager,
            strategy,
            block_size,
            slots,
            map: HashMap::new(),
            lru: (0..nslots).collect(),
        }
    }

    /// Capacity in slots.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of currently pinned entries.
    pub fn nfixed(&self) -> usize {
        self.slots.iter().filter(|s| s.pin > 0).count()
    }

    fn touch(&mut self, slot: usize) {
        if let Some(pos) = self.lru.iter().position(|&s| s == slot) {
            self.lru.remove(pos);
        }
        self.lru.push_back(slot);
    }

    /// Finds a slot for a new resident, evicting the least recently
    /// used unpinned entry if necessary (synchronous write when
    /// dirty).
    fn take_slot(&mut self) -> Result<usize> {
        if let Some(free) = self.slots.iter().position(|s| !s.bid.is_valid()) {
            return Ok(free);
        }

        let victim = self
            .lru
            .iter()
            .copied()
            .find(|&s| self.slots[s].pin == 0)
            .ok_or(ExmemError::CacheExhausted)?;

        let slot = &mut self.slots[victim];
        if slot.dirty {
            self.manager
                .write_block(slot.bid, slot.node.buf())
                .wait()?;
            slot.dirty = false;
        }
        trace!(bid = %slot.bid, "node cache eviction");
        self.map.remove(&slot.bid);
        slot.bid = Bid::INVALID;
        Ok(victim)
    }

    /// Allocates a fresh block and installs an empty, pinned, dirty
    /// node for it. Returns the new bid.
    pub fn new_node(&mut self) -> Result<Bid> {
        let slot_idx = self.take_slot()?;
        let bid = self
            .manager
            .new_block(&self.strategy, self.block_size as u32)?;

        let slot = &mut self.slots[slot_idx];
        slot.bid = bid;
        slot.node.reset();
        slot.pin = 1;
        slot.dirty = true;
        self.map.insert(bid, slot_idx);
        self.touch(slot_idx);
        Ok(bid)
    }

    /// Makes `bid` resident, reading it from disk on a miss, and pins
    /// it when requested.
    pub fn require(&mut self, bid: Bid, pin: bool) -> Result<()> {
        debug_assert!(bid.is_valid());
        if let Some(&slot_idx) = self.map.get(&bid) {
            if pin {
                self.slots[slot_idx].pin += 1;
            }
            self.touch(slot_idx);
            return Ok(());
        }

        let slot_idx = self.take_slot()?;
        self.manager
            .read_block(bid, self.slots[slot_idx].node.buf())
            .wait()?;

        let slot = &mut self.slots[slot_idx];
        slot.bid = bid;
        slot.pin = u32::from(pin);
        slot.dirty = false;
        self.map.insert(bid, slot_idx);
        self.touch(slot_idx);
        Ok(())
    }

    /// Read access to a resident node.
    ///
    /// The node must have been made resident with [`require`] (and be
    /// pinned across any operation that could evict it).
    ///
    /// [`require`]: NodeCache::require
    pub fn node(&self, bid: Bid) -> &N {
        let slot_idx = self.map[&bid];
        &self.slots[slot_idx].node
    }

    /// Write access to a resident node; marks it dirty.
    pub fn node_mut(&mut self, bid: Bid) -> &mut N {
        let slot_idx = self.map[&bid];
        self.slots[slot_idx].dirty = true;
        &mut self.slots[slot_idx].node
    }

    /// Write access to two distinct resident nodes at once (fuse and
    /// balance work on sibling pairs). Marks both dirty.
    pub fn pair_mut(&mut self, a: Bid, b: Bid) -> (&mut N, &mut N) {
        let ia = self.map[&a];
        let ib = self.map[&b];
        assert_ne!(ia, ib, "pair_mut needs two distinct nodes");
        self.slots[ia].dirty = true;
        self.slots[ib].dirty = true;
        if ia < ib {
            let (lo, hi) = self.slots.split_at_mut(ib);
            (&mut lo[ia].node, &mut hi[0].node)
        } else {
            let (lo, hi) = self.slots.split_at_mut(ia);
            (&mut hi[0].node, &mut lo[ib].node)
        }
    }

    /// Decrements the pin count of `bid`.
    pub fn unfix(&mut self, bid: Bid) {
        if let Some(&slot_idx) = self.map.get(&bid) {
            let slot = &mut self.slots[slot_idx];
            debug_assert!(slot.pin > 0);
            slot.pin = slot.pin.saturating_sub(1);
        }
    }

    /// Drops the resident entry (no write-back) and frees the block.
    pub fn delete(&mut self, bid: Bid) {
        if let Some(slot_idx) = self.map.remove(&bid) {
            let slot = &mut self.slots[slot_idx];
            slot.bid = Bid::INVALID;
            slot.pin = 0;
            slot.dirty = false;
        }
        self.manager.delete_block(bid);
    }

    /// Writes every dirty entry back to disk.
    pub fn flush(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            if slot.bid.is_valid() && slot.dirty {
                self.manager.write_block(slot.bid, slot.node.buf()).wait()?;
                slot.dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exmem_common::config::{DiskConfig, DiskDriver, DiskSpec};
    use exmem_common::Record;
    use exmem_io::TypedBlock;
    use tempfile::{tempdir, TempDir};

    const BLOCK: usize = 4096;

    /// Minimal node: a block of u64 with an 8-byte count tail.
    struct TestNode {
        block: TypedBlock<u64>,
    }

    impl TestNode {
        fn count(&self) -> u64 {
            self.block.tail_get(0)
        }

        fn set_count(&mut self, n: u64) {
            self.block.tail_set(0, &n);
        }
    }

    impl CacheNode for TestNode {
        fn alloc(block_size: usize) -> Self {
            Self {
                block: TypedBlock::new(block_size, u64::SIZE),
            }
        }

        fn buf(&self) -> BlockBuf {
            self.block.buf()
        }

        fn reset(&mut self) {
            self.set_count(0);
        }
    }

    fn manager() -> (Arc<BlockManager>, TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskConfig {
            disks: vec![DiskSpec {
                path: dir.path().join("disk0"),
                size: 4 << 20,
                driver: DiskDriver::Syscall,
                direct: false,
            }],
        };
        (BlockManager::new(&config).unwrap(), dir)
    }

    fn cache(slots: usize) -> (NodeCache<TestNode>, TempDir) {
        let (bm, dir) = manager();
        (
            NodeCache::new(bm, AllocStrategy::Striping, slots * BLOCK, BLOCK),
            dir,
        )
    }

    #[test]
    fn test_capacity_from_bytes() {
        let (cache, _dir) = cache(8);
        assert_eq!(cache.size(), 8);
        assert_eq!(cache.nfixed(), 0);
    }

    #[test]
    fn test_new_node_is_pinned_and_dirty() {
        let (mut cache, _dir) = cache(4);
        let bid = cache.new_node().unwrap();
        assert!(bid.is_valid());
        assert_eq!(cache.nfixed(), 1);
        assert_eq!(cache.node(bid).count(), 0);
        cache.unfix(bid);
        assert_eq!(cache.nfixed(), 0);
    }

    #[test]
    fn test_eviction_writes_back_dirty_nodes() {
        let (mut cache, _dir) = cache(2);

        let mut bids = Vec::new();
        for i in 0..6u64 {
            let bid = cache.new_node().unwrap();
            cache.node_mut(bid).set_count(i + 1);
            cache.unfix(bid);
            bids.push(bid);
        }

        // All six nodes survive despite only two slots.
        for (i, &bid) in bids.iter().enumerate() {
            cache.require(bid, false).unwrap();
            assert_eq!(cache.node(bid).count(), i as u64 + 1);
        }
    }

    #[test]
    fn test_all_pinned_fails_with_cache_exhausted() {
        let (mut cache, _dir) = cache(2);
        let a = cache.new_node().unwrap();
        let b = cache.new_node().unwrap();
        assert_eq!(cache.nfixed(), 2);

        assert!(matches!(cache.new_node(), Err(ExmemError::CacheExhausted)));

        cache.unfix(a);
        cache.new_node().unwrap();
        let _ = b;
    }

    #[test]
    fn test_single_copy_per_bid() {
        let (mut cache, _dir) = cache(4);
        let bid = cache.new_node().unwrap();
        cache.node_mut(bid).set_count(5);

        // A second require maps to the same entry.
        cache.require(bid, true).unwrap();
        assert_eq!(cache.node(bid).count(), 5);
        cache.unfix(bid);
        cache.unfix(bid);
        assert_eq!(cache.nfixed(), 0);
    }

    #[test]
    fn test_delete_frees_the_block() {
        let (bm, dir) = manager();
        let mut cache: NodeCache<TestNode> =
            NodeCache::new(bm.clone(), AllocStrategy::Striping, 4 * BLOCK, BLOCK);
        let _keep = dir;

        let free_before = bm.free_bytes();
        let bid = cache.new_node().unwrap();
        assert!(bm.free_bytes() < free_before);

        cache.delete(bid);
        assert_eq!(bm.free_bytes(), free_before);
    }

    #[test]
    fn test_lru_prefers_cold_entries() {
        let (mut cache, _dir) = cache(2);
        let a = cache.new_node().unwrap();
        let b = cache.new_node().unwrap();
        cache.unfix(a);
        cache.unfix(b);

        // Touch `a` so `b` is the LRU victim.
        cache.require(a, false).unwrap();
        let c = cache.new_node().unwrap();
        cache.unfix(c);

        // `a` still resident (no read), `b` was evicted.
        assert!(cache.map.contains_key(&a));
        assert!(!cache.map.contains_key(&b));
    }

    #[test]
    fn test_flush_clears_dirty_bits() {
        let (mut cache, _dir) = cache(4);
        let bid = cache.new_node().unwrap();
        cache.node_mut(bid).set_count(9);
        cache.unfix(bid);

        cache.flush().unwrap();
        assert!(!cache.slots[cache.map[&bid]].dirty);
    }
}
