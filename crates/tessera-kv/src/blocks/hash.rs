//! Prefix-chained block hashes

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use tessera_types::{GroupId, TokenId};

/// Hash of a full block's tokens chained with the hash of every block before it
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct BlockHash(pub u64);

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Cache key: one token prefix may be cached separately in each group
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHashWithGroupId {
    pub hash: BlockHash,
    pub group_id: GroupId,
}

impl BlockHashWithGroupId {
    pub fn new(hash: BlockHash, group_id: GroupId) -> Self {
        Self { hash, group_id }
    }
}

/// `hash(parent, tokens, extra_keys)`; the parent makes equal hashes imply
/// equal prefixes, not just equal blocks
pub fn hash_block_tokens(
    parent: Option<BlockHash>,
    tokens: &[TokenId],
    extra_key: Option<&str>,
) -> BlockHash {
    let mut hasher = DefaultHasher::new();
    parent.map(|p| p.0).hash(&mut hasher);
    for token in tokens {
        token.0.hash(&mut hasher);
    }
    extra_key.hash(&mut hasher);
    BlockHash(hasher.finish())
}

/// Extend `hashes` to cover every full block of `tokens`.
///
/// Existing hashes are kept; only blocks completed since the last call are
/// hashed. The salt only enters the first block, which is enough to separate
/// whole chains.
pub fn update_block_hashes(
    hashes: &mut Vec<BlockHash>,
    tokens: &[TokenId],
    block_size: usize,
    salt: Option<&str>,
) {
    if block_size == 0 {
        return;
    }
    let num_full_blocks = tokens.len() / block_size;
    while hashes.len() < num_full_blocks {
        let i = hashes.len();
        let parent = hashes.last().copied();
        let block = &tokens[i * block_size..(i + 1) * block_size];
        let extra = if i == 0 { salt } else { None };
        hashes.push(hash_block_tokens(parent, block, extra));
    }
}
