//! Distance between perceptual hashes.

/// A 64-bit perceptual fingerprint.
pub type HashValue = u64;

/// Width of a [`HashValue`] in bits, and therefore the largest Hamming distance.
pub const HASH_BITS: u32 = HashValue::BITS;

/// Distance function used by the BK-tree.
///
/// Implementations must behave like a metric: non-negative, symmetric, zero for
/// equal inputs and obeying the triangle inequality. The tree relies on the
/// triangle inequality to prune subtrees; a function that breaks it produces
/// undefined (but memory safe) lookup results. This is not checked at runtime.
///
/// Any closure `Fn(HashValue, HashValue) -> u32` is a metric. The tree makes no
/// assumption about the range of returned values, so a closure may exceed
/// [`HASH_BITS`].
pub trait Metric {
    fn distance(&self, a: HashValue, b: HashValue) -> u32;
}

/// Number of differing bits between two hashes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hamming;

impl Metric for Hamming {
    fn distance(&self, a: HashValue, b: HashValue) -> u32 {
        hamming(a, b)
    }
}

impl<F> Metric for F
where
    F: Fn(HashValue, HashValue) -> u32,
{
    fn distance(&self, a: HashValue, b: HashValue) -> u32 {
        self(a, b)
    }
}

/// Population count of `a ^ b`.
#[inline]
pub fn hamming(a: HashValue, b: HashValue) -> u32 {
    (a ^ b).count_ones()
}
