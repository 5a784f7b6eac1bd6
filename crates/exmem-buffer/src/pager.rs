//! Page replacement strategies for the paged vector.
//!
//! A pager owns a fixed set of frame numbers `0..frames` and answers
//! two questions: `touch(frame)` on every hit, and `kick()` for the
//! eviction victim on a miss.

use rand::Rng;
use std::collections::VecDeque;

/// Trait for page replacement algorithms.
pub trait Pager {
    /// Records that `frame` was accessed.
    fn touch(&mut self, frame: usize);

    /// Selects a victim frame for eviction.
    fn kick(&mut self) -> usize;

    /// Number of frames managed.
    fn frames(&self) -> usize;
}

/// Which pager a container should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagerKind {
    /// Classical k-way LRU.
    #[default]
    Lru,
    /// Uniformly random victim.
    Random,
}

impl PagerKind {
    /// Builds a pager over `frames` frames.
    pub fn build(self, frames: usize) -> Box<dyn Pager> {
        match self {
            PagerKind::Lru => Box::new(LruPager::new(frames)),
            PagerKind::Random => Box::new(RandomPager::new(frames)),
        }
    }
}

/// Classical k-way LRU pager.
pub struct LruPager {
    /// Frame numbers, least recently used at the front.
    order: VecDeque<usize>,
}

impl LruPager {
    /// Creates an LRU pager over `frames` frames.
    pub fn new(frames: usize) -> Self {
        Self {
            order: (0..frames).collect(),
        }
    }
}

impl Pager for LruPager {
    fn touch(&mut self, frame: usize) {
        if let Some(pos) = self.order.iter().position(|&f| f == frame) {
            self.order.remove(pos);
            self.order.push_back(frame);
        }
    }

    fn kick(&mut self) -> usize {
        let victim = self.order.pop_front().expect("pager has no frames");
        self.order.push_back(victim);
        victim
    }

    fn frames(&self) -> usize {
        self.order.len()
    }
}

/// Uniformly random pager.
pub struct RandomPager {
    frames: usize,
}

impl RandomPager {
    /// Creates a random pager over `frames` frames.
    pub fn new(frames: usize) -> Self {
        Self { frames }
    }
}

impl Pager for RandomPager {
    fn touch(&mut self, _frame: usize) {}

    fn kick(&mut self) -> usize {
        rand::thread_rng().gen_range(0..self.frames)
    }

    fn frames(&self) -> usize {
        self.frames
    }
}
