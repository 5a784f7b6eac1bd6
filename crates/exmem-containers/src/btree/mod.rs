//! External B+ tree.
//!
//! An ordered map over disk blocks with:
//!
//! - a pin-counted, write-back node cache (one instance for internal
//!   nodes, one for leaves)
//! - an in-memory root index keyed by "largest key under this child"
//! - doubly linked leaves for ordered traversal
//! - fuse/balance rebalancing on underflow and bottom-up bulk loading
//! - an iterator map keeping live cursors valid across splits and
//!   fuses

mod cache;
mod compare;
mod iterator_map;
mod node;
mod tree;

pub use compare::{DefaultCompare, KeyCompare};
pub use tree::{BPlusTree, Cursor, TreeConfig, TreeIter};

#[cfg(test)]
mod tests {
    use super::*;
    use exmem_common::config::{DiskConfig, DiskDriver, DiskSpec};
    use exmem_common::ExmemError;
    use exmem_io::{AllocStrategy, BlockManager};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    type Tree = BPlusTree<i32, f64, DefaultCompare>;

    fn manager() -> (Arc<BlockManager>, TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskConfig {
            disks: (0..2)
                .map(|i| DiskSpec {
                    path: dir.path().join(format!("disk{}", i)),
                    size: 32 << 20,
                    driver: DiskDriver::Syscall,
                    direct: false,
                })
                .collect(),
        };
        (BlockManager::new(&config).unwrap(), dir)
    }

    /// Tiny blocks so splits and height growth happen with few keys.
    fn small_tree_config() -> TreeConfig {
        TreeConfig {
            node_block_size: 256,
            leaf_block_size: 256,
            node_cache_bytes: 16 * 256,
            leaf_cache_bytes: 8 * 256,
            alloc_strategy: AllocStrategy::Striping,
        }
    }

    fn small_tree() -> (Tree, TempDir) {
        let (bm, dir) = manager();
        (
            Tree::new(bm, small_tree_config(), DefaultCompare).unwrap(),
            dir,
        )
    }

    #[test]
    fn test_new_tree_is_empty_height_2() {
        let (tree, _dir) = small_tree();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.height(), 2);
    }

    #[test]
    fn test_insert_get_single() {
        let (mut tree, _dir) = small_tree();
        assert!(tree.insert(42, 43.0).unwrap());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&42).unwrap(), Some(43.0));
        assert_eq!(tree.get(&41).unwrap(), None);
    }

    #[test]
    fn test_insert_duplicate_keeps_first_value() {
        let (mut tree, _dir) = small_tree();
        assert!(tree.insert(1, 10.0).unwrap());
        assert!(!tree.insert(1, 20.0).unwrap());
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(&1).unwrap(), Some(10.0));
    }

    #[test]
    fn test_insert_sentinel_is_rejected() {
        let (mut tree, _dir) = small_tree();
        assert!(matches!(
            tree.insert(i32::MAX, 0.0),
            Err(ExmemError::BadKey)
        ));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_many_inserts_split_leaves_and_grow() {
        let (mut tree, _dir) = small_tree();
        let n = 5_000;
        for k in 0..n {
            assert!(tree.insert(k, f64::from(k) + 1.0).unwrap());
        }
        assert_eq!(tree.len(), n as u64);
        assert!(tree.height() > 2, "tree should have grown past height 2");

        for k in (0..n).step_by(97) {
            assert_eq!(tree.get(&k).unwrap(), Some(f64::from(k) + 1.0));
        }
    }

    #[test]
    fn test_reverse_and_shuffled_insert_orders() {
        let (mut tree, _dir) = small_tree();
        let keys: Vec<i32> = (0..2_000).rev().collect();
        for &k in &keys {
            tree.insert(k, f64::from(k)).unwrap();
        }
        for &k in &keys {
            assert_eq!(tree.get(&k).unwrap(), Some(f64::from(k)));
        }
    }

    #[test]
    fn test_iter_yields_sorted_sequence() {
        let (mut tree, _dir) = small_tree();
        for k in (0..1_000).rev() {
            tree.insert(k * 2, f64::from(k)).unwrap();
        }

        let mut previous = None;
        let mut count = 0;
        for entry in tree.iter() {
            let (k, _) = entry.unwrap();
            if let Some(p) = previous {
                assert!(k > p, "iteration must be strictly increasing");
            }
            previous = Some(k);
            count += 1;
        }
        assert_eq!(count, 1_000);
    }

    #[test]
    fn test_erase_returns_count_and_shrinks() {
        let (mut tree, _dir) = small_tree();
        for k in 0..3_000 {
            tree.insert(k, f64::from(k)).unwrap();
        }

        assert_eq!(tree.erase(&1_500).unwrap(), 1);
        assert_eq!(tree.erase(&1_500).unwrap(), 0);
        assert_eq!(tree.len(), 2_999);
        assert_eq!(tree.get(&1_500).unwrap(), None);
        assert_eq!(tree.get(&1_501).unwrap(), Some(1_501.0));
    }

    #[test]
    fn test_erase_on_empty_returns_zero() {
        let (mut tree, _dir) = small_tree();
        assert_eq!(tree.erase(&7).unwrap(), 0);
    }

    #[test]
    fn test_erase_everything_collapses_height() {
        let (mut tree, _dir) = small_tree();
        let n = 4_000;
        for k in 0..n {
            tree.insert(k, 0.0).unwrap();
        }
        assert!(tree.height() > 2);

        for k in 0..n {
            assert_eq!(tree.erase(&k).unwrap(), 1, "erasing {}", k);
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 2);
    }

    #[test]
    fn test_insert_erase_interleaved() {
        let (mut tree, _dir) = small_tree();
        for round in 0..5 {
            let base = round * 1_000;
            for k in base..base + 1_000 {
                tree.insert(k, f64::from(k)).unwrap();
            }
            // Erase the lower half of this round.
            for k in base..base + 500 {
                assert_eq!(tree.erase(&k).unwrap(), 1);
            }
        }
        assert_eq!(tree.len(), 5 * 500);
        assert_eq!(tree.get(&250).unwrap(), None);
        assert_eq!(tree.get(&750).unwrap(), Some(750.0));
    }

    #[test]
    fn test_at_raises_key_not_found() {
        let (mut tree, _dir) = small_tree();
        tree.insert(5, 6.0).unwrap();
        assert_eq!(tree.at(&5).unwrap(), 6.0);
        assert!(matches!(tree.at(&6), Err(ExmemError::KeyNotFound)));
    }

    #[test]
    fn test_get_or_insert() {
        let (mut tree, _dir) = small_tree();
        assert_eq!(tree.get_or_insert(1, 5.0).unwrap(), 5.0);
        assert_eq!(tree.get_or_insert(1, 9.0).unwrap(), 5.0);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_find_and_cursor_walk() {
        let (mut tree, _dir) = small_tree();
        for k in 0..500 {
            tree.insert(k * 10, f64::from(k)).unwrap();
        }

        assert!(tree.find(&15).unwrap().is_none());
        let mut cursor = tree.find(&100).unwrap().expect("key exists");
        assert_eq!(tree.cursor_entry(&cursor).unwrap().0, 100);

        // Walk three entries forward.
        for expected in [110, 120, 130] {
            cursor = tree.cursor_next(cursor).unwrap().expect("not at end");
            assert_eq!(tree.cursor_entry(&cursor).unwrap().0, expected);
        }
        // And one back.
        cursor = tree.cursor_prev(cursor).unwrap().expect("not at begin");
        assert_eq!(tree.cursor_entry(&cursor).unwrap().0, 120);
        tree.release_cursor(cursor);
    }

    #[test]
    fn test_cursor_survives_splits() {
        let (mut tree, _dir) = small_tree();
        for k in 0..100 {
            tree.insert(k * 100, 0.0).unwrap();
        }
        let cursor = tree.find(&5_000).unwrap().expect("key exists");

        // Insert plenty of keys around the cursor to force splits in
        // its leaf and elsewhere.
        for k in 0..2_000 {
            tree.insert(k * 7 + 1, 0.0).unwrap();
        }

        assert_eq!(tree.cursor_entry(&cursor).unwrap().0, 5_000);
        tree.release_cursor(cursor);
    }

    #[test]
    fn test_cursor_survives_fuses() {
        let (mut tree, _dir) = small_tree();
        for k in 0..2_000 {
            tree.insert(k, f64::from(k)).unwrap();
        }
        let cursor = tree.find(&1_999).unwrap().expect("key exists");

        // Massive erase in front of the cursor forces fuse/balance.
        for k in 0..1_990 {
            tree.erase(&k).unwrap();
        }

        let (k, v) = tree.cursor_entry(&cursor).unwrap();
        assert_eq!(k, 1_999);
        assert_eq!(v, 1_999.0);
        tree.release_cursor(cursor);
    }

    #[test]
    fn test_lower_upper_bound_and_equal_range() {
        let (mut tree, _dir) = small_tree();
        for k in [10, 20, 30, 40] {
            tree.insert(k, 0.0).unwrap();
        }

        let lb = tree.lower_bound(&20).unwrap().unwrap();
        assert_eq!(tree.cursor_entry(&lb).unwrap().0, 20);
        tree.release_cursor(lb);

        let lb = tree.lower_bound(&21).unwrap().unwrap();
        assert_eq!(tree.cursor_entry(&lb).unwrap().0, 30);
        tree.release_cursor(lb);

        let ub = tree.upper_bound(&20).unwrap().unwrap();
        assert_eq!(tree.cursor_entry(&ub).unwrap().0, 30);
        tree.release_cursor(ub);

        assert!(tree.lower_bound(&41).unwrap().is_none());

        let (lo, hi) = tree.equal_range(&30).unwrap();
        let lo = lo.unwrap();
        let hi = hi.unwrap();
        assert_eq!(tree.cursor_entry(&lo).unwrap().0, 30);
        assert_eq!(tree.cursor_entry(&hi).unwrap().0, 40);
        tree.release_cursor(lo);
        tree.release_cursor(hi);
    }

    #[test]
    fn test_clear_resets_to_fresh_state() {
        let (bm, _dir) = manager();
        let free_fresh = {
            let tree = Tree::new(bm.clone(), small_tree_config(), DefaultCompare).unwrap();
            let free = bm.free_bytes();
            drop(tree);
            free
        };

        let mut tree = Tree::new(bm.clone(), small_tree_config(), DefaultCompare).unwrap();
        for k in 0..3_000 {
            tree.insert(k, 0.0).unwrap();
        }
        tree.clear().unwrap();

        assert!(tree.is_empty());
        assert_eq!(tree.height(), 2);
        // Exactly one empty leaf allocated, as after construction.
        assert_eq!(bm.free_bytes(), free_fresh);
        // And the tree still works.
        tree.insert(1, 1.0).unwrap();
        assert_eq!(tree.get(&1).unwrap(), Some(1.0));
    }

    #[test]
    fn test_drop_returns_all_blocks() {
        let (bm, _dir) = manager();
        let free_before = bm.free_bytes();
        {
            let mut tree = Tree::new(bm.clone(), small_tree_config(), DefaultCompare).unwrap();
            for k in 0..3_000 {
                tree.insert(k, 0.0).unwrap();
            }
        }
        assert_eq!(bm.free_bytes(), free_before);
    }

    #[test]
    fn test_swap_twice_is_identity() {
        let (bm, _dir) = manager();
        let mut a = Tree::new(bm.clone(), small_tree_config(), DefaultCompare).unwrap();
        let mut b = Tree::new(bm, small_tree_config(), DefaultCompare).unwrap();
        for k in 0..100 {
            a.insert(k, 1.0).unwrap();
        }
        for k in 0..50 {
            b.insert(-k, 2.0).unwrap();
        }

        a.swap(&mut b);
        assert_eq!(a.len(), 50);
        assert_eq!(b.len(), 100);
        assert_eq!(a.get(&-10).unwrap(), Some(2.0));
        assert_eq!(b.get(&10).unwrap(), Some(1.0));

        a.swap(&mut b);
        assert_eq!(a.len(), 100);
        assert_eq!(b.len(), 50);
        assert_eq!(a.get(&10).unwrap(), Some(1.0));
    }

    #[test]
    fn test_bulk_construction_equals_insertion() {
        let (bm, _dir) = manager();
        let input: Vec<(i32, f64)> = (0..4_000).map(|k| (k, f64::from(k) * 0.5)).collect();

        let mut bulk = Tree::from_sorted(
            bm.clone(),
            small_tree_config(),
            DefaultCompare,
            input.iter().copied(),
            0.75,
            0.6,
        )
        .unwrap();
        assert_eq!(bulk.len(), 4_000);

        let mut inserted = Tree::new(bm, small_tree_config(), DefaultCompare).unwrap();
        for &(k, v) in &input {
            inserted.insert(k, v).unwrap();
        }

        let bulk_entries: Vec<(i32, f64)> =
            bulk.iter().collect::<Result<_, _>>().unwrap();
        let inserted_entries: Vec<(i32, f64)> =
            inserted.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(bulk_entries, inserted_entries);
    }

    #[test]
    fn test_bulk_construction_skips_duplicates() {
        let (bm, _dir) = manager();
        let input = vec![(1, 1.0), (1, 99.0), (2, 2.0), (2, 98.0), (3, 3.0)];
        let mut tree = Tree::from_sorted(
            bm,
            small_tree_config(),
            DefaultCompare,
            input,
            0.75,
            0.6,
        )
        .unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get(&1).unwrap(), Some(1.0));
        assert_eq!(tree.get(&2).unwrap(), Some(2.0));
    }

    #[test]
    fn test_bulk_then_erase_all() {
        let (bm, _dir) = manager();
        let input: Vec<(i32, f64)> = (0..2_500).map(|k| (k, 0.0)).collect();
        let mut tree = Tree::from_sorted(
            bm,
            small_tree_config(),
            DefaultCompare,
            input,
            0.75,
            0.6,
        )
        .unwrap();

        for k in 0..2_500 {
            assert_eq!(tree.erase(&k).unwrap(), 1, "erasing {}", k);
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 2);
    }

    #[test]
    fn test_tree_too_tall_with_tiny_node_cache() {
        let (bm, _dir) = manager();
        let config = TreeConfig {
            node_block_size: 256,
            leaf_block_size: 256,
            // Two node slots: height 3 is reachable (needs 2), height
            // 4 is not (needs 3).
            node_cache_bytes: 2 * 256,
            leaf_cache_bytes: 8 * 256,
            alloc_strategy: AllocStrategy::Striping,
        };
        let mut tree = Tree::new(bm, config, DefaultCompare).unwrap();

        let result = (0..100_000).try_for_each(|k| tree.insert(k, 0.0).map(|_| ()));
        match result {
            Err(ExmemError::TreeTooTall {
                height,
                cache_slots,
            }) => {
                assert_eq!(cache_slots, 2);
                assert!(height > 3);
            }
            other => panic!("expected TreeTooTall, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_insert_erase_leaves_footprint_unchanged() {
        let (bm, _dir) = manager();
        let mut tree = Tree::new(bm.clone(), small_tree_config(), DefaultCompare).unwrap();
        for k in 0..500 {
            tree.insert(k, 0.0).unwrap();
        }
        let len_before = tree.len();
        let free_before = bm.free_bytes();

        tree.insert(100_000, 1.0).unwrap();
        tree.erase(&100_000).unwrap();

        assert_eq!(tree.len(), len_before);
        assert_eq!(bm.free_bytes(), free_before);
    }
}
