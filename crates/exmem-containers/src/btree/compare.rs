//! Key comparators for the B+ tree.
//!
//! Tree keys are ordered by a comparator that also supplies a sentinel
//! `max_value` strictly greater than every user key. The sentinel
//! terminates internal nodes and the root index; it can never be
//! inserted.

use std::cmp::Ordering;

/// A strict weak ordering over keys with a reserved maximum sentinel.
pub trait KeyCompare<K>: Clone {
    /// Compares two keys.
    fn cmp(&self, a: &K, b: &K) -> Ordering;

    /// The sentinel key, strictly greater than any user key.
    fn max_value(&self) -> K;

    /// Equality under this ordering.
    fn eq(&self, a: &K, b: &K) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }
}

/// Comparator using the key type's natural order, with the type's
/// maximum value as the sentinel.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCompare;

macro_rules! impl_default_compare {
    ($($t:ty => $max:expr),* $(,)?) => {
        $(
            impl KeyCompare<$t> for DefaultCompare {
                #[inline]
                fn cmp(&self, a: &$t, b: &$t) -> Ordering {
                    a.cmp(b)
                }

                #[inline]
                fn max_value(&self) -> $t {
                    $max
                }
            }
        )*
    };
}

impl_default_compare!(
    i16 => i16::MAX,
    i32 => i32::MAX,
    i64 => i64::MAX,
    u16 => u16::MAX,
    u32 => u32::MAX,
    u64 => u64::MAX,
);
