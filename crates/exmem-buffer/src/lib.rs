//! Pooling layer for exmem.
//!
//! This crate provides:
//! - The read/write pool: bounded prefetch and write-behind block lists
//! - Page replacement strategies for the paged vector
//! - Byte-budget accounting for algorithms layered on the pool

pub mod budget;
pub mod pager;
pub mod pool;

pub use budget::{split_budget, BudgetSplit};
pub use pager::{LruPager, Pager, PagerKind, RandomPager};
pub use pool::{PoolRead, ReadWritePool};
