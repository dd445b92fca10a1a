pub mod hash;
pub mod paths;
pub mod storage;

pub use hash::{HashError, HashService};
pub use storage::StorageError;
