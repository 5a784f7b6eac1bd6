//! The external B+ tree: an ordered map over disk blocks.
//!
//! Level 0 holds the leaves (doubly linked), levels above hold
//! internal nodes, and the top level is the in-memory root index
//! mapping "largest key under this child" to the child's bid. The last
//! entry of the root index and of every internal node carries the
//! comparator's sentinel key. Nodes and leaves live in two pin-counted
//! write-back caches.

use super::cache::NodeCache;
use super::compare::KeyCompare;
use super::iterator_map::{CursorPos, IteratorMap};
use super::node::{InnerNode, Leaf};
use exmem_common::{Bid, ExmemError, Record, Result};
use exmem_io::{AllocStrategy, BlockManager};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Configuration for a B+ tree.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Block size of internal nodes in bytes.
    pub node_block_size: usize,
    /// Block size of leaves in bytes.
    pub leaf_block_size: usize,
    /// Node cache budget in bytes.
    pub node_cache_bytes: usize,
    /// Leaf cache budget in bytes.
    pub leaf_cache_bytes: usize,
    /// Block allocation strategy.
    pub alloc_strategy: AllocStrategy,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            node_block_size: 4096,
            leaf_block_size: 4096,
            node_cache_bytes: 128 * 1024,
            leaf_cache_bytes: 128 * 1024,
            alloc_strategy: AllocStrategy::Striping,
        }
    }
}

/// A live position in the tree, registered with the iterator map so
/// that node splits and fuses keep it pointing at the same element.
#[derive(Debug)]
pub struct Cursor {
    id: u64,
}

enum FuseOrBalance<K> {
    Fused,
    Balanced(K),
}

/// An ordered map from `K` to `V` on external storage.
///
/// The public API is single-threaded; callers synchronise externally.
pub struct BPlusTree<K: Record, V: Record, C: KeyCompare<K>> {
    cmp: C,
    node_cache: NodeCache<InnerNode<K>>,
    leaf_cache: NodeCache<Leaf<K, V>>,
    iterators: IteratorMap,
    /// The root index, sorted; the last entry's key is the sentinel.
    root: Vec<(K, Bid)>,
    size: u64,
    height: u32,
    leaf_max: usize,
    node_max: usize,
}

impl<K: Record, V: Record, C: KeyCompare<K>> BPlusTree<K, V, C> {
    /// Creates an empty tree of height 2 (root index over one empty
    /// leaf).
    pub fn new(manager: Arc<BlockManager>, config: TreeConfig, cmp: C) -> Result<Self> {
        let mut tree = Self::with_empty_root(manager, config, cmp)?;
        tree.create_empty_leaf()?;
        Ok(tree)
    }

    fn with_empty_root(
        manager: Arc<BlockManager>,
        config: TreeConfig,
        cmp: C,
    ) -> Result<Self> {
        use super::cache::CacheNode;

        let leaf_max = Leaf::<K, V>::alloc(config.leaf_block_size).capacity();
        let node_max = InnerNode::<K>::alloc(config.node_block_size).capacity();
        if leaf_max < 4 || node_max < 4 {
            return Err(ExmemError::BadConfig(format!(
                "block sizes too small: {} entries per leaf, {} per node (need 4)",
                leaf_max, node_max
            )));
        }

        let node_cache = NodeCache::new(
            Arc::clone(&manager),
            config.alloc_strategy.clone(),
            config.node_cache_bytes,
            config.node_block_size,
        );
        let leaf_cache = NodeCache::new(
            manager,
            config.alloc_strategy.clone(),
            config.leaf_cache_bytes,
            config.leaf_block_size,
        );
        if node_cache.size() < 2 || leaf_cache.size() < 4 {
            return Err(ExmemError::BadConfig(format!(
                "cache budgets too small: {} node slots (need 2), {} leaf slots (need 4)",
                node_cache.size(),
                leaf_cache.size()
            )));
        }

        Ok(Self {
            cmp,
            node_cache,
            leaf_cache,
            iterators: IteratorMap::default(),
            root: Vec::new(),
            size: 0,
            height: 2,
            leaf_max,
            node_max,
        })
    }

    /// Bulk bottom-up construction from a sorted sequence (duplicates
    /// are skipped). Equivalent to inserting every element, but packs
    /// leaves to `leaf_fill` and nodes to `node_fill`.
    pub fn from_sorted<I>(
        manager: Arc<BlockManager>,
        config: TreeConfig,
        cmp: C,
        input: I,
        node_fill: f64,
        leaf_fill: f64,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        assert!((0.5..=1.0).contains(&node_fill));
        assert!((0.5..=1.0).contains(&leaf_fill));

        let mut tree = Self::with_empty_root(manager, config, cmp)?;
        let max_value = tree.cmp.max_value();
        let max_leaf_elements =
            (((tree.leaf_max as f64) * leaf_fill) as usize).max(tree.leaf_min());

        let mut bids: Vec<(K, Bid)> = Vec::new();
        let mut cur = tree.leaf_cache.new_node()?;
        let mut last_key: Option<K> = None;

        for (key, value) in input {
            if tree.cmp.eq(&key, &max_value) {
                tree.leaf_cache.unfix(cur);
                return Err(ExmemError::BadKey);
            }
            if let Some(last) = &last_key {
                if tree.cmp.eq(last, &key) {
                    continue;
                }
                debug_assert_eq!(tree.cmp.cmp(last, &key), Ordering::Less);
            }

            if tree.leaf_cache.node(cur).size() == max_leaf_elements {
                bids.push((tree.leaf_cache.node(cur).last_key(), cur));
                let next = tree.leaf_cache.new_node()?;
                let (old, new) = tree.leaf_cache.pair_mut(cur, next);
                old.set_succ(next);
                new.set_pred(cur);
                tree.leaf_cache.unfix(cur);
                cur = next;
            }

            tree.leaf_cache.node_mut(cur).push(&(key, value));
            last_key = Some(key);
            tree.size += 1;
        }

        // Rebalance a trailing underfull leaf against its predecessor.
        // fuse_or_balance_leaves unfixes both participants.
        if tree.leaf_cache.node(cur).underflows() && !bids.is_empty() {
            let left = bids.last().unwrap().1;
            tree.leaf_cache.require(left, true)?;
            match tree.fuse_or_balance_leaves(left, cur)? {
                FuseOrBalance::Fused => {
                    bids.pop();
                }
                FuseOrBalance::Balanced(splitter) => {
                    bids.last_mut().unwrap().0 = splitter;
                }
            }
        } else {
            tree.leaf_cache.unfix(cur);
        }
        bids.push((max_value, cur));

        // Build node levels until the list fits the root index.
        let max_node_elements =
            (((tree.node_max as f64) * node_fill) as usize).max(tree.node_min());
        while bids.len() > tree.node_max {
            let mut parents: Vec<(K, Bid)> = Vec::new();
            let mut i = 0;
            while i < bids.len() {
                let node_bid = tree.node_cache.new_node()?;
                let take = max_node_elements.min(bids.len() - i);
                for entry in &bids[i..i + take] {
                    tree.node_cache.node_mut(node_bid).push(entry);
                }
                i += take;

                if tree.node_cache.node(node_bid).underflows() {
                    debug_assert_eq!(i, bids.len());
                    debug_assert!(!parents.is_empty());
                    let left = parents.last().unwrap().1;
                    tree.node_cache.require(left, true)?;
                    // fuse_or_balance_nodes unfixes both participants.
                    match tree.fuse_or_balance_nodes(left, node_bid)? {
                        FuseOrBalance::Fused => {
                            parents.pop();
                        }
                        FuseOrBalance::Balanced(splitter) => {
                            parents.last_mut().unwrap().0 = splitter;
                        }
                    }
                } else {
                    tree.node_cache.unfix(node_bid);
                }

                parents.push((tree.node_cache.node(node_bid).last_key(), node_bid));
            }

            bids = parents;
            tree.height += 1;
            debug!(height = tree.height, "bulk construction level packed");
            if (tree.node_cache.size() as u32) < tree.height - 1 {
                return Err(ExmemError::TreeTooTall {
                    height: tree.height,
                    cache_slots: tree.node_cache.size(),
                });
            }
        }

        tree.root = bids;
        debug_assert_eq!(tree.leaf_cache.nfixed(), 0);
        debug_assert_eq!(tree.node_cache.nfixed(), 0);
        Ok(tree)
    }

    /// Number of elements.
    pub fn len(&self) -> u64 {
        self.size
    }

    /// True when the map holds no elements.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Tree height, counting the leaf level and the root index.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The comparator.
    pub fn key_comp(&self) -> &C {
        &self.cmp
    }

    fn leaf_min(&self) -> usize {
        (self.leaf_max + 1) / 2
    }

    fn node_min(&self) -> usize {
        (self.node_max + 1) / 2
    }

    fn create_empty_leaf(&mut self) -> Result<()> {
        let bid = self.leaf_cache.new_node()?;
        self.leaf_cache.unfix(bid);
        self.root.push((self.cmp.max_value(), bid));
        Ok(())
    }

    /// First root entry whose key is >= `key`; always exists because
    /// the last entry carries the sentinel.
    fn root_lower_bound(&self, key: &K) -> usize {
        let mut lo = 0;
        let mut hi = self.root.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.cmp.cmp(&self.root[mid].0, key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        debug_assert!(lo < self.root.len());
        lo
    }

    // ----- insertion ---------------------------------------------------

    /// Inserts `key -> value`. Returns `true` when the key was new;
    /// an existing key keeps its old value. Inserting the comparator's
    /// sentinel fails with `BadKey`.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        if self.cmp.eq(&key, &self.cmp.max_value()) {
            return Err(ExmemError::BadKey);
        }

        let idx = self.root_lower_bound(&key);
        let child = self.root[idx].1;
        let (inserted, splitter) = if self.height == 2 {
            self.leaf_insert(child, &key, &value)?
        } else {
            self.node_insert(child, self.height - 2, &key, &value)?
        };

        if inserted {
            self.size += 1;
        }
        if let Some(splitter) = splitter {
            self.insert_into_root(splitter)?;
        }

        debug_assert_eq!(self.leaf_cache.nfixed(), 0);
        debug_assert_eq!(self.node_cache.nfixed(), 0);
        Ok(inserted)
    }

    /// Returns the value for `key`, inserting `default` first when the
    /// key is absent.
    pub fn get_or_insert(&mut self, key: K, default: V) -> Result<V> {
        self.insert(key, default)?;
        Ok(self.get(&key)?.expect("key just inserted"))
    }

    fn leaf_insert(&mut self, bid: Bid, key: &K, value: &V) -> Result<(bool, Option<(K, Bid)>)> {
        self.leaf_cache.require(bid, true)?;

        if self.leaf_cache.node(bid).find(&self.cmp, key).is_some() {
            self.leaf_cache.unfix(bid);
            return Ok((false, None));
        }

        let slot = self.leaf_cache.node(bid).lower_bound(&self.cmp, key);
        if !self.leaf_cache.node(bid).is_full() {
            self.leaf_cache.node_mut(bid).insert_at(slot, &(*key, *value));
            self.iterators.inserted(bid, slot);
            self.leaf_cache.unfix(bid);
            return Ok((true, None));
        }

        // Split: a new leaf takes the lower half and becomes the left
        // sibling; the splitter (last key of left, new bid) goes up.
        let new_bid = match self.leaf_cache.new_node() {
            Ok(b) => b,
            Err(e) => {
                self.leaf_cache.unfix(bid);
                return Err(e);
            }
        };

        let left_target = (self.leaf_max + 1) / 2;
        let moved = if slot < left_target {
            left_target - 1
        } else {
            left_target
        };

        let old_pred;
        {
            let (right, left) = self.leaf_cache.pair_mut(bid, new_bid);
            right.move_lower_half_to(left, moved);
            old_pred = right.pred();
            left.set_pred(old_pred);
            left.set_succ(bid);
            right.set_pred(new_bid);
        }
        self.iterators.split_to_left(bid, moved, new_bid);

        if slot < left_target {
            self.leaf_cache.node_mut(new_bid).insert_at(slot, &(*key, *value));
            self.iterators.inserted(new_bid, slot);
        } else {
            self.leaf_cache
                .node_mut(bid)
                .insert_at(slot - moved, &(*key, *value));
            self.iterators.inserted(bid, slot - moved);
        }

        if old_pred.is_valid() {
            self.leaf_cache.require(old_pred, false)?;
            self.leaf_cache.node_mut(old_pred).set_succ(new_bid);
        }

        let splitter_key = self.leaf_cache.node(new_bid).last_key();
        self.leaf_cache.unfix(new_bid);
        self.leaf_cache.unfix(bid);
        Ok((true, Some((splitter_key, new_bid))))
    }

    fn node_insert(
        &mut self,
        bid: Bid,
        level: u32,
        key: &K,
        value: &V,
    ) -> Result<(bool, Option<(K, Bid)>)> {
        debug_assert!(level >= 1);
        self.node_cache.require(bid, true)?;

        let child_slot = self.node_cache.node(bid).lower_bound(&self.cmp, key);
        debug_assert!(child_slot < self.node_cache.node(bid).size());
        let child = self.node_cache.node(bid).get(child_slot).1;

        let result = if level == 1 {
            self.leaf_insert(child, key, value)
        } else {
            self.node_insert(child, level - 1, key, value)
        };
        let (inserted, child_splitter) = match result {
            Ok(r) => r,
            Err(e) => {
                self.node_cache.unfix(bid);
                return Err(e);
            }
        };

        let mut splitter_up = None;
        if let Some(entry) = child_splitter {
            if !self.node_cache.node(bid).is_full() {
                let slot = self.node_cache.node(bid).lower_bound(&self.cmp, &entry.0);
                self.node_cache.node_mut(bid).insert_at(slot, &entry);
            } else {
                splitter_up = Some(match self.split_inner_and_insert(bid, &entry) {
                    Ok(s) => s,
                    Err(e) => {
                        self.node_cache.unfix(bid);
                        return Err(e);
                    }
                });
            }
        }

        self.node_cache.unfix(bid);
        Ok((inserted, splitter_up))
    }

    /// Splits the full inner node `bid`, inserts `entry` into the
    /// correct half, and returns the upward splitter.
    fn split_inner_and_insert(&mut self, bid: Bid, entry: &(K, Bid)) -> Result<(K, Bid)> {
        let new_bid = self.node_cache.new_node()?;

        let slot = self.node_cache.node(bid).lower_bound(&self.cmp, &entry.0);
        let left_target = (self.node_max + 1) / 2;
        let moved = if slot < left_target {
            left_target - 1
        } else {
            left_target
        };

        {
            let (right, left) = self.node_cache.pair_mut(bid, new_bid);
            right.move_lower_half_to(left, moved);
        }

        if slot < left_target {
            self.node_cache.node_mut(new_bid).insert_at(slot, entry);
        } else {
            self.node_cache.node_mut(bid).insert_at(slot - moved, entry);
        }

        let splitter_key = self.node_cache.node(new_bid).last_key();
        self.node_cache.unfix(new_bid);
        Ok((splitter_key, new_bid))
    }

    fn insert_into_root(&mut self, splitter: (K, Bid)) -> Result<()> {
        let slot = self.root_lower_bound(&splitter.0);
        self.root.insert(slot, splitter);

        if self.root.len() <= self.node_max {
            return Ok(());
        }

        // Root overflow: split the root index into two nodes and grow.
        let new_height = self.height + 1;
        if (self.node_cache.size() as u32) < new_height - 1 {
            return Err(ExmemError::TreeTooTall {
                height: new_height,
                cache_slots: self.node_cache.size(),
            });
        }

        let left_bid = self.node_cache.new_node()?;
        let right_bid = self.node_cache.new_node()?;
        let half = self.root.len() / 2;
        {
            let (left, right) = self.node_cache.pair_mut(left_bid, right_bid);
            for (i, entry) in self.root.iter().enumerate() {
                if i < half {
                    left.push(entry);
                } else {
                    right.push(entry);
                }
            }
        }
        let left_key = self.node_cache.node(left_bid).last_key();
        let right_key = self.node_cache.node(right_bid).last_key();

        self.root.clear();
        self.root.push((left_key, left_bid));
        self.root.push((right_key, right_bid));
        self.node_cache.unfix(left_bid);
        self.node_cache.unfix(right_bid);

        self.height = new_height;
        debug!(height = self.height, "tree height increased");
        Ok(())
    }

    // ----- lookup ------------------------------------------------------

    /// Descends to the leaf that owns `key`.
    fn locate_leaf(&mut self, key: &K) -> Result<Bid> {
        let idx = self.root_lower_bound(key);
        let mut bid = self.root[idx].1;
        let mut level = self.height - 2;
        while level > 0 {
            self.node_cache.require(bid, true)?;
            let node = self.node_cache.node(bid);
            let slot = node.lower_bound(&self.cmp, key);
            let child = node.get(slot).1;
            self.node_cache.unfix(bid);
            bid = child;
            level -= 1;
        }
        Ok(bid)
    }

    /// Returns the value stored for `key`.
    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let bid = self.locate_leaf(key)?;
        self.leaf_cache.require(bid, false)?;
        let leaf = self.leaf_cache.node(bid);
        Ok(leaf.find(&self.cmp, key).map(|slot| leaf.get(slot).1))
    }

    /// Returns the value for `key`, failing with `KeyNotFound` when
    /// the key is absent.
    pub fn at(&mut self, key: &K) -> Result<V> {
        self.get(key)?.ok_or(ExmemError::KeyNotFound)
    }

    /// True when `key` is present.
    pub fn contains_key(&mut self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of entries with `key` (0 or 1).
    pub fn count(&mut self, key: &K) -> Result<u64> {
        Ok(u64::from(self.get(key)?.is_some()))
    }

    /// Cursor at the entry with exactly `key`.
    pub fn find(&mut self, key: &K) -> Result<Option<Cursor>> {
        let bid = self.locate_leaf(key)?;
        self.leaf_cache.require(bid, false)?;
        let slot = self.leaf_cache.node(bid).find(&self.cmp, key);
        Ok(slot.map(|slot| Cursor {
            id: self.iterators.register(bid, slot),
        }))
    }

    /// Cursor at the first entry with key >= `key`; `None` means past
    /// the end.
    pub fn lower_bound(&mut self, key: &K) -> Result<Option<Cursor>> {
        let bid = self.locate_leaf(key)?;
        self.leaf_cache.require(bid, false)?;
        let leaf = self.leaf_cache.node(bid);
        let slot = leaf.lower_bound(&self.cmp, key);
        if slot < leaf.size() {
            return Ok(Some(Cursor {
                id: self.iterators.register(bid, slot),
            }));
        }
        // Past the last entry of the rightmost leaf.
        let succ = leaf.succ();
        if succ.is_valid() {
            return Ok(Some(Cursor {
                id: self.iterators.register(succ, 0),
            }));
        }
        Ok(None)
    }

    /// Cursor at the first entry with key > `key`.
    pub fn upper_bound(&mut self, key: &K) -> Result<Option<Cursor>> {
        match self.lower_bound(key)? {
            None => Ok(None),
            Some(cursor) => {
                let (found, _) = self.cursor_entry(&cursor)?;
                if self.cmp.eq(&found, key) {
                    self.cursor_next(cursor)
                } else {
                    Ok(Some(cursor))
                }
            }
        }
    }

    /// `(lower_bound, upper_bound)` for `key`.
    pub fn equal_range(&mut self, key: &K) -> Result<(Option<Cursor>, Option<Cursor>)> {
        let lower = self.lower_bound(key)?;
        let upper = self.upper_bound(key)?;
        Ok((lower, upper))
    }

    /// Cursor at the first entry of the map.
    pub fn first(&mut self) -> Result<Option<Cursor>> {
        if self.is_empty() {
            return Ok(None);
        }
        let bid = self.leftmost_leaf()?;
        Ok(Some(Cursor {
            id: self.iterators.register(bid, 0),
        }))
    }

    fn leftmost_leaf(&mut self) -> Result<Bid> {
        let mut bid = self.root[0].1;
        let mut level = self.height - 2;
        while level > 0 {
            self.node_cache.require(bid, true)?;
            let child = self.node_cache.node(bid).get(0).1;
            self.node_cache.unfix(bid);
            bid = child;
            level -= 1;
        }
        Ok(bid)
    }

    // ----- cursors -----------------------------------------------------

    /// Looks up a cursor's position, stepping over the end of a leaf
    /// (an erase of the last slot leaves the cursor one past it; the
    /// logical position is then the successor leaf's first entry).
    fn resolve_cursor(&mut self, id: u64) -> Result<CursorPos> {
        let pos = self.iterators.get(id).ok_or(ExmemError::KeyNotFound)?;
        self.leaf_cache.require(pos.bid, false)?;
        let leaf = self.leaf_cache.node(pos.bid);
        if pos.slot < leaf.size() {
            return Ok(pos);
        }
        let succ = leaf.succ();
        if !succ.is_valid() {
            return Err(ExmemError::KeyNotFound);
        }
        let normalized = CursorPos { bid: succ, slot: 0 };
        self.iterators.set(id, normalized);
        Ok(normalized)
    }

    /// The entry under `cursor`.
    pub fn cursor_entry(&mut self, cursor: &Cursor) -> Result<(K, V)> {
        let pos = self.resolve_cursor(cursor.id)?;
        self.leaf_cache.require(pos.bid, false)?;
        let leaf = self.leaf_cache.node(pos.bid);
        Ok(leaf.get(pos.slot))
    }

    /// Advances `cursor` to the next entry, releasing it at the end.
    pub fn cursor_next(&mut self, cursor: Cursor) -> Result<Option<Cursor>> {
        let pos = match self.resolve_cursor(cursor.id) {
            Ok(pos) => pos,
            Err(ExmemError::KeyNotFound) => {
                self.release_cursor(cursor);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.leaf_cache.require(pos.bid, false)?;
        let leaf = self.leaf_cache.node(pos.bid);

        if pos.slot + 1 < leaf.size() {
            self.iterators.set(
                cursor.id,
                CursorPos {
                    bid: pos.bid,
                    slot: pos.slot + 1,
                },
            );
            return Ok(Some(cursor));
        }

        let succ = leaf.succ();
        if succ.is_valid() {
            self.iterators.set(cursor.id, CursorPos { bid: succ, slot: 0 });
            return Ok(Some(cursor));
        }

        self.release_cursor(cursor);
        Ok(None)
    }

    /// Steps `cursor` back to the previous entry, releasing it when
    /// already at the first.
    pub fn cursor_prev(&mut self, cursor: Cursor) -> Result<Option<Cursor>> {
        let pos = self.resolve_cursor(cursor.id)?;

        if pos.slot > 0 {
            self.iterators.set(
                cursor.id,
                CursorPos {
                    bid: pos.bid,
                    slot: pos.slot - 1,
                },
            );
            return Ok(Some(cursor));
        }

        self.leaf_cache.require(pos.bid, false)?;
        let pred = self.leaf_cache.node(pos.bid).pred();
        if pred.is_valid() {
            self.leaf_cache.require(pred, false)?;
            let slot = self.leaf_cache.node(pred).size() - 1;
            self.iterators.set(cursor.id, CursorPos { bid: pred, slot });
            return Ok(Some(cursor));
        }

        self.release_cursor(cursor);
        Ok(None)
    }

    /// Drops a cursor's registration.
    pub fn release_cursor(&mut self, cursor: Cursor) {
        self.iterators.release(cursor.id);
    }

    /// Erases the entry under `cursor`.
    pub fn erase_at(&mut self, cursor: Cursor) -> Result<()> {
        let (key, _) = self.cursor_entry(&cursor)?;
        self.release_cursor(cursor);
        let removed = self.erase(&key)?;
        debug_assert_eq!(removed, 1);
        Ok(())
    }

    // ----- erase -------------------------------------------------------

    /// Removes `key`. Returns 1 when the key was present, 0 silently
    /// otherwise.
    pub fn erase(&mut self, key: &K) -> Result<usize> {
        let idx = self.root_lower_bound(key);
        let child = self.root[idx].1;

        let removed = if self.height == 2 {
            self.leaf_erase(child, key)?
        } else {
            self.node_erase(child, self.height - 2, key)?
        };

        if removed > 0 {
            self.size -= 1;

            let child_underflows = if self.height == 2 {
                self.leaf_cache.require(child, false)?;
                self.leaf_cache.node(child).underflows()
            } else {
                self.node_cache.require(child, false)?;
                self.node_cache.node(child).underflows()
            };

            if child_underflows && self.root.len() > 1 {
                self.fuse_or_balance_root(idx)?;
            }

            // A root index reduced to one child absorbs it.
            if self.root.len() == 1 && self.height > 2 {
                let root_bid = self.root[0].1;
                debug_assert!(self.cmp.eq(&self.root[0].0, &self.cmp.max_value()));
                self.node_cache.require(root_bid, true)?;
                let node = self.node_cache.node(root_bid);
                let entries: Vec<(K, Bid)> = (0..node.size()).map(|i| node.get(i)).collect();
                self.root = entries;
                self.node_cache.delete(root_bid);
                self.height -= 1;
                debug!(height = self.height, "tree height decreased");
            }
        }

        debug_assert_eq!(self.leaf_cache.nfixed(), 0);
        debug_assert_eq!(self.node_cache.nfixed(), 0);
        Ok(removed)
    }

    fn leaf_erase(&mut self, bid: Bid, key: &K) -> Result<usize> {
        self.leaf_cache.require(bid, true)?;
        let slot = self.leaf_cache.node(bid).find(&self.cmp, key);
        let Some(slot) = slot else {
            self.leaf_cache.unfix(bid);
            return Ok(0);
        };
        self.leaf_cache.node_mut(bid).remove_at(slot);
        self.iterators.erased(bid, slot);
        self.leaf_cache.unfix(bid);
        Ok(1)
    }

    fn node_erase(&mut self, bid: Bid, level: u32, key: &K) -> Result<usize> {
        debug_assert!(level >= 1);
        self.node_cache.require(bid, true)?;

        let child_slot = self.node_cache.node(bid).lower_bound(&self.cmp, key);
        let child = self.node_cache.node(bid).get(child_slot).1;

        let result = if level == 1 {
            self.leaf_erase(child, key)
        } else {
            self.node_erase(child, level - 1, key)
        };
        let removed = match result {
            Ok(r) => r,
            Err(e) => {
                self.node_cache.unfix(bid);
                return Err(e);
            }
        };

        if removed > 0 {
            let child_underflows = if level == 1 {
                self.leaf_cache.require(child, false)?;
                self.leaf_cache.node(child).underflows()
            } else {
                self.node_cache.require(child, false)?;
                self.node_cache.node(child).underflows()
            };

            if child_underflows && self.node_cache.node(bid).size() > 1 {
                if let Err(e) = self.fuse_or_balance_in_node(bid, child_slot, level) {
                    self.node_cache.unfix(bid);
                    return Err(e);
                }
            }
        }

        self.node_cache.unfix(bid);
        Ok(removed)
    }

    /// Picks the sibling pair for the underfull child at `idx` of the
    /// root index: the left sibling when the child is the last entry,
    /// the right sibling otherwise.
    fn fuse_or_balance_root(&mut self, idx: usize) -> Result<()> {
        let (left_idx, right_idx) = if idx + 1 == self.root.len() {
            debug_assert!(idx > 0);
            (idx - 1, idx)
        } else {
            (idx, idx + 1)
        };
        let left = self.root[left_idx].1;
        let right = self.root[right_idx].1;

        let outcome = if self.height == 2 {
            self.leaf_cache.require(left, true)?;
            self.leaf_cache.require(right, true)?;
            self.fuse_or_balance_leaves(left, right)?
        } else {
            self.node_cache.require(left, true)?;
            self.node_cache.require(right, true)?;
            self.fuse_or_balance_nodes(left, right)?
        };

        match outcome {
            FuseOrBalance::Fused => {
                self.root.remove(left_idx);
            }
            FuseOrBalance::Balanced(splitter) => {
                self.root[left_idx].0 = splitter;
            }
        }
        Ok(())
    }

    /// Same pairing rule for an underfull child inside inner node
    /// `parent` (which the caller holds pinned).
    fn fuse_or_balance_in_node(
        &mut self,
        parent: Bid,
        child_slot: usize,
        level: u32,
    ) -> Result<()> {
        let parent_size = self.node_cache.node(parent).size();
        let (left_slot, right_slot) = if child_slot + 1 == parent_size {
            debug_assert!(child_slot > 0);
            (child_slot - 1, child_slot)
        } else {
            (child_slot, child_slot + 1)
        };
        let left = self.node_cache.node(parent).get(left_slot).1;
        let right = self.node_cache.node(parent).get(right_slot).1;

        let outcome = if level == 1 {
            self.leaf_cache.require(left, true)?;
            self.leaf_cache.require(right, true)?;
            self.fuse_or_balance_leaves(left, right)?
        } else {
            self.node_cache.require(left, true)?;
            self.node_cache.require(right, true)?;
            self.fuse_or_balance_nodes(left, right)?
        };

        match outcome {
            FuseOrBalance::Fused => {
                self.node_cache.node_mut(parent).remove_at(left_slot);
            }
            FuseOrBalance::Balanced(splitter) => {
                let entry = (splitter, left);
                self.node_cache.node_mut(parent).set(left_slot, &entry);
            }
        }
        Ok(())
    }

    /// Fuses or balances two pinned sibling leaves; both are unfixed
    /// (the left is deleted on fuse). Balance keeps the right node
    /// right-heavy and returns the new splitter, the last key of the
    /// left leaf.
    fn fuse_or_balance_leaves(&mut self, left: Bid, right: Bid) -> Result<FuseOrBalance<K>> {
        let left_size = self.leaf_cache.node(left).size();
        let right_size = self.leaf_cache.node(right).size();
        let total = left_size + right_size;

        if total <= self.leaf_max {
            let left_pred;
            {
                let (right_leaf, left_leaf) = self.leaf_cache.pair_mut(right, left);
                right_leaf.prepend_all_from(left_leaf);
                left_pred = left_leaf.pred();
                right_leaf.set_pred(left_pred);
            }
            self.iterators.fused_into_right(left, left_size, right);
            if left_pred.is_valid() {
                self.leaf_cache.require(left_pred, false)?;
                self.leaf_cache.node_mut(left_pred).set_succ(right);
            }
            self.leaf_cache.unfix(right);
            self.leaf_cache.delete(left);
            return Ok(FuseOrBalance::Fused);
        }

        let new_left = total / 2;
        {
            let (right_leaf, left_leaf) = self.leaf_cache.pair_mut(right, left);
            if left_size > new_left {
                right_leaf.take_from_left(left_leaf, left_size - new_left);
            } else {
                right_leaf.give_to_left(left_leaf, new_left - left_size);
            }
        }
        if left_size > new_left {
            self.iterators
                .balanced_left_to_right(left, left_size, right, left_size - new_left);
        } else {
            self.iterators
                .balanced_right_to_left(left, left_size, right, new_left - left_size);
        }

        let splitter = self.leaf_cache.node(left).last_key();
        self.leaf_cache.unfix(left);
        self.leaf_cache.unfix(right);
        Ok(FuseOrBalance::Balanced(splitter))
    }

    /// Inner-node counterpart of [`fuse_or_balance_leaves`]; no links
    /// and no cursor fixups.
    ///
    /// [`fuse_or_balance_leaves`]: BPlusTree::fuse_or_balance_leaves
    fn fuse_or_balance_nodes(&mut self, left: Bid, right: Bid) -> Result<FuseOrBalance<K>> {
        let left_size = self.node_cache.node(left).size();
        let right_size = self.node_cache.node(right).size();
        let total = left_size + right_size;

        if total <= self.node_max {
            {
                let (right_node, left_node) = self.node_cache.pair_mut(right, left);
                right_node.prepend_all_from(left_node);
            }
            self.node_cache.unfix(right);
            self.node_cache.delete(left);
            return Ok(FuseOrBalance::Fused);
        }

        let new_left = total / 2;
        {
            let (right_node, left_node) = self.node_cache.pair_mut(right, left);
            if left_size > new_left {
                right_node.take_from_left(left_node, left_size - new_left);
            } else {
                right_node.give_to_left(left_node, new_left - left_size);
            }
        }
        let splitter = self.node_cache.node(left).last_key();
        self.node_cache.unfix(left);
        self.node_cache.unfix(right);
        Ok(FuseOrBalance::Balanced(splitter))
    }

    // ----- whole-tree operations --------------------------------------

    /// Removes every element. The tree is left with height 2 and one
    /// empty leaf, as freshly constructed.
    pub fn clear(&mut self) -> Result<()> {
        self.deallocate_children()?;
        self.size = 0;
        self.height = 2;
        self.create_empty_leaf()?;
        debug_assert_eq!(self.leaf_cache.nfixed(), 0);
        debug_assert_eq!(self.node_cache.nfixed(), 0);
        Ok(())
    }

    /// Exchanges the contents of two trees.
    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    /// Writes every dirty cached node and leaf back to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.leaf_cache.flush()?;
        self.node_cache.flush()
    }

    fn deallocate_children(&mut self) -> Result<()> {
        let entries = std::mem::take(&mut self.root);
        if self.height == 2 {
            for (_, bid) in entries {
                self.leaf_cache.delete(bid);
            }
        } else {
            for (_, bid) in entries {
                self.deallocate_subtree(bid, self.height - 2)?;
            }
        }
        Ok(())
    }

    fn deallocate_subtree(&mut self, bid: Bid, level: u32) -> Result<()> {
        debug_assert!(level >= 1);
        self.node_cache.require(bid, true)?;
        let node = self.node_cache.node(bid);
        let children: Vec<Bid> = (0..node.size()).map(|i| node.get(i).1).collect();

        for child in children {
            if level == 1 {
                self.leaf_cache.delete(child);
            } else {
                self.deallocate_subtree(child, level - 1)?;
            }
        }
        self.node_cache.delete(bid);
        Ok(())
    }

    /// Streaming in-order iterator over all entries.
    pub fn iter(&mut self) -> TreeIter<'_, K, V, C> {
        TreeIter {
            tree: self,
            pos: None,
            started: false,
        }
    }
}

impl<K: Record, V: Record, C: KeyCompare<K>> Drop for BPlusTree<K, V, C> {
    fn drop(&mut self) {
        // Free every block; errors stay in the destructor.
        let _ = self.deallocate_children();
    }
}

/// In-order streaming iterator over a tree, walking the leaf list.
pub struct TreeIter<'a, K: Record, V: Record, C: KeyCompare<K>> {
    tree: &'a mut BPlusTree<K, V, C>,
    pos: Option<CursorPos>,
    started: bool,
}

impl<K: Record, V: Record, C: KeyCompare<K>> Iterator for TreeIter<'_, K, V, C> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            if self.tree.is_empty() {
                return None;
            }
            match self.tree.leftmost_leaf() {
                Ok(bid) => self.pos = Some(CursorPos { bid, slot: 0 }),
                Err(e) => return Some(Err(e)),
            }
        }

        let pos = self.pos?;
        if let Err(e) = self.tree.leaf_cache.require(pos.bid, false) {
            return Some(Err(e));
        }
        let leaf = self.tree.leaf_cache.node(pos.bid);
        debug_assert!(pos.slot < leaf.size());
        let entry = leaf.get(pos.slot);

        // Advance.
        self.pos = if pos.slot + 1 < leaf.size() {
            Some(CursorPos {
                bid: pos.bid,
                slot: pos.slot + 1,
            })
        } else {
            let succ = leaf.succ();
            succ.is_valid().then_some(CursorPos { bid: succ, slot: 0 })
        };

        Some(Ok(entry))
    }
}
