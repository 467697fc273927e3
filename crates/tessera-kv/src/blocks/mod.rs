pub(crate) mod eviction;
pub mod hash;
pub mod pool;

pub use hash::{hash_block_tokens, update_block_hashes, BlockHash, BlockHashWithGroupId};
pub use pool::{BlockPool, BlockPoolStats};
