//! Block pool for paged KV cache memory management
//!
//! One pool owns every block id of the cache and is shared by all allocation
//! groups. Cached content is keyed by `(hash, group)` so prefix hits are
//! resolved per group.

use smallvec::SmallVec;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

use super::eviction::EvictionQueue;
use super::hash::{BlockHash, BlockHashWithGroupId};
use tessera_types::{BlockId, GroupId, Result, TesseraError};

/// Bookkeeping for one block id
#[derive(Debug, Clone, Default)]
struct BlockMeta {
    /// Requests currently holding the block
    ref_count: u32,
    /// Set once the block is full and published to the prefix cache
    hash: Option<BlockHashWithGroupId>,
}

/// Fixed set of block ids with reference counts and a prefix cache.
///
/// A zero-ref block is either uncached (LIFO free stack) or cached (LRU
/// eviction queue, still reachable by hash until evicted).
#[derive(Debug)]
pub struct BlockPool {
    num_blocks: usize,
    enable_caching: bool,
    blocks: Vec<BlockMeta>,
    free_stack: Vec<BlockId>,
    evictable: EvictionQueue,
    cached: HashMap<BlockHashWithGroupId, BlockId>,
    null_block: Option<BlockId>,
    total_allocations: u64,
    total_releases: u64,
    total_evictions: u64,
}

impl BlockPool {
    /// Create a pool of `num_blocks` ids.
    ///
    /// With `reserve_null_block`, id 0 is pinned as the placeholder for
    /// dropped sliding-window positions and never handed out.
    pub fn new(num_blocks: usize, enable_caching: bool, reserve_null_block: bool) -> Result<Self> {
        let reserved = usize::from(reserve_null_block);
        if num_blocks <= reserved {
            return Err(TesseraError::capacity(format!(
                "{} KV cache block(s) leave none usable{}",
                num_blocks,
                if reserve_null_block {
                    " after reserving the null block"
                } else {
                    ""
                }
            )));
        }
        if num_blocks > BlockId::MAX as usize {
            return Err(TesseraError::invalid_parameter(format!(
                "block pool of {} blocks exceeds the block id range",
                num_blocks
            )));
        }

        debug!(
            "Creating block pool: num_blocks={}, enable_caching={}, null_block={}",
            num_blocks, enable_caching, reserve_null_block
        );

        let mut blocks = vec![BlockMeta::default(); num_blocks];
        let null_block = if reserve_null_block {
            blocks[0].ref_count = 1;
            Some(0)
        } else {
            None
        };
        // Reversed so the lowest ids are handed out first.
        let free_stack = (reserved as BlockId..num_blocks as BlockId).rev().collect();

        Ok(Self {
            num_blocks,
            enable_caching,
            blocks,
            free_stack,
            evictable: EvictionQueue::new(num_blocks),
            cached: HashMap::new(),
            null_block,
            total_allocations: 0,
            total_releases: 0,
            total_evictions: 0,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Blocks that can ever be handed out
    pub fn num_usable_blocks(&self) -> usize {
        self.num_blocks - usize::from(self.null_block.is_some())
    }

    pub fn null_block(&self) -> Option<BlockId> {
        self.null_block
    }

    pub fn is_null(&self, block_id: BlockId) -> bool {
        self.null_block == Some(block_id)
    }

    pub fn enable_caching(&self) -> bool {
        self.enable_caching
    }

    /// Zero-ref blocks, cached or not
    pub fn num_free_blocks(&self) -> usize {
        self.free_stack.len() + self.evictable.len()
    }

    /// Blocks with at least one reference, the null block included
    pub fn num_referenced_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.ref_count > 0).count()
    }

    pub fn num_cached_blocks(&self) -> usize {
        self.cached.len()
    }

    pub fn ref_count(&self, block_id: BlockId) -> u32 {
        self.blocks
            .get(block_id as usize)
            .map_or(0, |b| b.ref_count)
    }

    pub fn block_hash(&self, block_id: BlockId) -> Option<BlockHashWithGroupId> {
        self.blocks.get(block_id as usize).and_then(|b| b.hash)
    }

    /// Fraction of usable blocks currently referenced
    pub fn usage(&self) -> f64 {
        let usable = self.num_usable_blocks();
        if usable == 0 {
            return 0.0;
        }
        1.0 - self.num_free_blocks() as f64 / usable as f64
    }

    /// Take one block: most recently released uncached block first, otherwise
    /// the least recently released cached block, evicting its content.
    pub fn allocate(&mut self) -> Result<BlockId> {
        let block_id = if let Some(id) = self.free_stack.pop() {
            id
        } else if let Some(id) = self.evictable.pop_front() {
            self.evict(id);
            id
        } else {
            return Err(TesseraError::out_of_blocks(1, 0));
        };

        self.blocks[block_id as usize].ref_count = 1;
        self.total_allocations += 1;
        trace!("Allocated block {}", block_id);
        Ok(block_id)
    }

    /// Take `count` blocks or none at all
    pub fn allocate_blocks(&mut self, count: usize) -> Result<Vec<BlockId>> {
        let free = self.num_free_blocks();
        if count > free {
            return Err(TesseraError::out_of_blocks(count, free));
        }
        (0..count).map(|_| self.allocate()).collect()
    }

    fn evict(&mut self, block_id: BlockId) {
        if let Some(key) = self.blocks[block_id as usize].hash.take() {
            if self.cached.get(&key) == Some(&block_id) {
                self.cached.remove(&key);
            }
            self.total_evictions += 1;
            debug!("Evicted cached block {} (hash {})", block_id, key.hash);
        }
    }

    /// Cached blocks for `hash` in every listed group, or `None` unless all
    /// groups hit
    pub fn get_cached_block(
        &self,
        hash: BlockHash,
        group_ids: &[GroupId],
    ) -> Option<SmallVec<[BlockId; 4]>> {
        group_ids
            .iter()
            .map(|&group_id| {
                self.cached
                    .get(&BlockHashWithGroupId::new(hash, group_id))
                    .copied()
            })
            .collect()
    }

    /// Add a reference to each block, pulling released ones out of the
    /// eviction queue
    pub fn touch(&mut self, block_ids: &[BlockId]) {
        for &block_id in block_ids {
            if self.is_null(block_id) {
                continue;
            }
            let i = block_id as usize;
            if i >= self.blocks.len() {
                warn!("Ignoring touch of unknown block {}", block_id);
                continue;
            }
            if self.blocks[i].ref_count == 0 && !self.evictable.remove(block_id) {
                self.free_stack.retain(|&b| b != block_id);
            }
            self.blocks[i].ref_count += 1;
        }
    }

    /// Drop one reference to a block
    pub fn release(&mut self, block_id: BlockId) -> Result<()> {
        if self.is_null(block_id) {
            return Ok(());
        }
        let meta = self
            .blocks
            .get_mut(block_id as usize)
            .ok_or_else(|| TesseraError::not_found(format!("Block not found: {}", block_id)))?;
        if meta.ref_count == 0 {
            return Err(TesseraError::double_release(block_id));
        }
        meta.ref_count -= 1;
        if meta.ref_count == 0 {
            if meta.hash.is_some() {
                self.evictable.push_back(block_id);
            } else {
                self.free_stack.push(block_id);
            }
        }
        self.total_releases += 1;
        trace!("Released block {}", block_id);
        Ok(())
    }

    /// Release blocks in the given order; blocks released first are evicted
    /// first
    pub fn free_blocks<I>(&mut self, block_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = BlockId>,
    {
        for block_id in block_ids {
            self.release(block_id)?;
        }
        Ok(())
    }

    /// Publish blocks `num_cached_blocks..num_full_blocks` of a request's
    /// block table under their hashes
    pub fn cache_full_blocks(
        &mut self,
        block_ids: &[BlockId],
        block_hashes: &[BlockHash],
        num_cached_blocks: usize,
        num_full_blocks: usize,
        group_id: GroupId,
    ) -> Result<()> {
        if !self.enable_caching || num_full_blocks <= num_cached_blocks {
            return Ok(());
        }
        if num_full_blocks > block_ids.len() || num_full_blocks > block_hashes.len() {
            return Err(TesseraError::invalid_state(format!(
                "cannot cache {} full blocks with {} blocks and {} hashes",
                num_full_blocks,
                block_ids.len(),
                block_hashes.len()
            )));
        }

        for i in num_cached_blocks..num_full_blocks {
            let block_id = block_ids[i];
            if self.null_block == Some(block_id) {
                continue;
            }
            let meta = &mut self.blocks[block_id as usize];
            if meta.hash.is_some() {
                continue;
            }
            let key = BlockHashWithGroupId::new(block_hashes[i], group_id);
            // A duplicate of an already cached prefix stays private.
            if let Entry::Vacant(entry) = self.cached.entry(key) {
                entry.insert(block_id);
                meta.hash = Some(key);
                trace!("Cached block {} under {}", block_id, key.hash);
            }
        }
        Ok(())
    }

    /// Withdraw a block from the prefix cache, e.g. when the step that was to
    /// fill it failed. A released block moves from the eviction queue back to
    /// the free stack. Returns whether the block was cached.
    pub fn uncache_block(&mut self, block_id: BlockId) -> bool {
        let Some(meta) = self.blocks.get_mut(block_id as usize) else {
            return false;
        };
        let Some(key) = meta.hash.take() else {
            return false;
        };
        if self.cached.get(&key) == Some(&block_id) {
            self.cached.remove(&key);
        }
        if meta.ref_count == 0 && self.evictable.remove(block_id) {
            self.free_stack.push(block_id);
        }
        trace!("Uncached block {} ({})", block_id, key.hash);
        true
    }

    /// Drop every cached hash. Only possible while no block is referenced.
    pub fn reset_prefix_cache(&mut self) -> bool {
        let in_use = self.num_usable_blocks() - self.num_free_blocks();
        if in_use > 0 {
            warn!(
                "Failed to reset prefix cache: {} blocks are still in use",
                in_use
            );
            return false;
        }
        self.cached.clear();
        for block_id in self.evictable.drain() {
            self.blocks[block_id as usize].hash = None;
            self.free_stack.push(block_id);
        }
        info!("Successfully reset prefix cache");
        true
    }

    /// Get statistics
    pub fn stats(&self) -> BlockPoolStats {
        let free_blocks = self.num_free_blocks();
        BlockPoolStats {
            total_blocks: self.num_blocks,
            usable_blocks: self.num_usable_blocks(),
            free_blocks,
            allocated_blocks: self.num_usable_blocks() - free_blocks,
            cached_blocks: self.cached.len(),
            total_allocations: self.total_allocations,
            total_releases: self.total_releases,
            total_evictions: self.total_evictions,
        }
    }
}

/// Block pool statistics
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPoolStats {
    pub total_blocks: usize,
    pub usable_blocks: usize,
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    pub cached_blocks: usize,
    pub total_allocations: u64,
    pub total_releases: u64,
    pub total_evictions: u64,
}

impl BlockPoolStats {
    /// Get utilization percentage
    pub fn utilization(&self) -> f32 {
        if self.usable_blocks == 0 {
            0.0
        } else {
            (self.allocated_blocks as f32 / self.usable_blocks as f32) * 100.0
        }
    }
}
