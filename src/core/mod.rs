pub mod bktree;
pub mod distance;
pub mod order;
pub mod phash;

pub use bktree::{BkTree, HashSource, Match, Node, Query};
pub use distance::{Hamming, HashValue, Metric, HASH_BITS};
