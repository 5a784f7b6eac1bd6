//! Block allocation (striping) strategies.
//!
//! A strategy maps the block manager's running allocation counter to a
//! disk index. Strategies are plain tagged values so containers can be
//! parameterised over them at construction time.

use rand::seq::SliceRandom;
use rand::Rng;

/// How freshly allocated blocks are spread across the configured disks.
#[derive(Debug, Clone)]
pub enum AllocStrategy {
    /// Round-robin over the disks.
    Striping,
    /// A uniformly random disk per block.
    SimpleRandom,
    /// A uniformly random disk and a random free slot on it.
    FullyRandom,
    /// A precomputed random permutation of the disks, cycled.
    RandomCyclic { perm: Vec<u32> },
}

impl AllocStrategy {
    /// Builds a `RandomCyclic` strategy for `ndisks` disks.
    pub fn random_cyclic(ndisks: usize) -> Self {
        let mut perm: Vec<u32> = (0..ndisks as u32).collect();
        perm.shuffle(&mut rand::thread_rng());
        Self::RandomCyclic { perm }
    }

    /// Picks the disk for the allocation numbered `counter`.
    pub fn next_disk(&self, counter: u64, ndisks: usize) -> usize {
        debug_assert!(ndisks > 0);
        match self {
            Self::Striping => (counter % ndisks as u64) as usize,
            Self::SimpleRandom | Self::FullyRandom => {
                rand::thread_rng().gen_range(0..ndisks)
            }
            Self::RandomCyclic { perm } => {
                perm[(counter % perm.len() as u64) as usize] as usize
            }
        }
    }

    /// True if the on-disk slot should also be chosen at random.
    pub fn wants_random_slot(&self) -> bool {
        matches!(self, Self::FullyRandom)
    }
}

impl Default for AllocStrategy {
    fn default() -> Self {
        Self::Striping
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_striping_is_round_robin() {
        let strategy = AllocStrategy::Striping;
        let picks: Vec<usize> = (0..8).map(|c| strategy.next_disk(c, 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_simple_random_stays_in_range() {
        let strategy = AllocStrategy::SimpleRandom;
        for counter in 0..256 {
            assert!(strategy.next_disk(counter, 5) < 5);
        }
    }

    #[test]
    fn test_random_cyclic_is_a_permutation() {
        let strategy = AllocStrategy::random_cyclic(6);
        let mut seen: Vec<usize> = (0..6).map(|c| strategy.next_disk(c, 6)).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_random_cyclic_repeats_its_cycle() {
        let strategy = AllocStrategy::random_cyclic(4);
        for counter in 0..4 {
            assert_eq!(
                strategy.next_disk(counter, 4),
                strategy.next_disk(counter + 4, 4)
            );
        }
    }

    #[test]
    fn test_only_fully_random_wants_random_slot() {
        assert!(AllocStrategy::FullyRandom.wants_random_slot());
        assert!(!AllocStrategy::Striping.wants_random_slot());
        assert!(!AllocStrategy::SimpleRandom.wants_random_slot());
        assert!(!AllocStrategy::random_cyclic(2).wants_random_slot());
    }

    #[test]
    fn test_single_disk_degenerate_case() {
        for strategy in [
            AllocStrategy::Striping,
            AllocStrategy::SimpleRandom,
            AllocStrategy::FullyRandom,
            AllocStrategy::random_cyclic(1),
        ] {
            assert_eq!(strategy.next_disk(41, 1), 0);
        }
    }
}
