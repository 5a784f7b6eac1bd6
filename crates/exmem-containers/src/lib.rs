//! External-memory containers for exmem.
//!
//! This crate provides:
//! - A paged vector with pluggable page replacement
//! - External stacks (normal, grow/shrink, pool-backed grow/shrink,
//!   migrating)
//! - An external B+ tree with node caches, cursors, and bulk loading

pub mod btree;
pub mod stack;
pub mod vector;

pub use btree::{BPlusTree, Cursor, DefaultCompare, KeyCompare, TreeConfig};
pub use stack::{
    GrowShrinkStack, GrowShrinkStack2, MigratingStack, NormalStack, StackConfig,
};
pub use vector::{ExtVector, VecIter, VectorConfig};
