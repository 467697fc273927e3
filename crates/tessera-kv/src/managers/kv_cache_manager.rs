//! Scheduler-facing entry point to the KV cache

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::coordinator::KvCacheCoordinator;
use crate::blocks::{BlockHash, BlockPoolStats};
use crate::planner::KvCacheConfig;
use tessera_types::{BlockId, PrefixCacheStats, RequestIndex, Result, TesseraError};

/// Blocks per allocation group, indexed by group id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheBlocks {
    pub blocks: Vec<Vec<BlockId>>,
}

impl KvCacheBlocks {
    pub fn empty(num_groups: usize) -> Self {
        Self {
            blocks: vec![Vec::new(); num_groups],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Vec::is_empty)
    }

    /// Blocks in the first group; every group holds the same count for a
    /// prefix hit
    pub fn num_blocks(&self) -> usize {
        self.blocks.first().map_or(0, Vec::len)
    }

    pub fn block_ids(&self) -> &[Vec<BlockId>] {
        &self.blocks
    }
}

/// Everything `allocate_slots` needs to know about one request
#[derive(Debug, Clone, Copy)]
pub struct SlotRequest<'a> {
    pub request: RequestIndex,
    pub block_hashes: &'a [BlockHash],
    /// Prompt plus output tokens known so far
    pub num_tokens: usize,
    pub num_computed_tokens: usize,
    pub num_new_tokens: usize,
    pub num_new_computed_tokens: usize,
    pub new_computed_blocks: Option<&'a KvCacheBlocks>,
    pub num_lookahead_tokens: usize,
}

/// Tracks block tables of all requests against one block pool
#[derive(Debug)]
pub struct KvCacheManager {
    coordinator: KvCacheCoordinator,
    block_size: usize,
    enable_caching: bool,
    max_model_len: usize,
    prefix_cache_stats: Option<PrefixCacheStats>,
}

impl KvCacheManager {
    pub fn new(
        config: &KvCacheConfig,
        max_model_len: usize,
        enable_caching: bool,
        use_eagle: bool,
        log_stats: bool,
    ) -> Result<Self> {
        let coordinator = KvCacheCoordinator::new(config, enable_caching, use_eagle)?;
        info!(
            "KV cache manager ready: {} blocks, {} group(s), prefix caching {}",
            config.num_blocks,
            config.groups.len(),
            if enable_caching { "on" } else { "off" }
        );
        Ok(Self {
            block_size: coordinator.block_size(),
            coordinator,
            enable_caching,
            max_model_len,
            prefix_cache_stats: log_stats.then(PrefixCacheStats::default),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn enable_caching(&self) -> bool {
        self.enable_caching
    }

    pub fn num_groups(&self) -> usize {
        self.coordinator.num_groups()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.coordinator.pool().num_free_blocks()
    }

    pub fn usage(&self) -> f64 {
        self.coordinator.pool().usage()
    }

    pub fn pool_stats(&self) -> BlockPoolStats {
        self.coordinator.pool().stats()
    }

    pub fn coordinator(&self) -> &KvCacheCoordinator {
        &self.coordinator
    }

    /// Cached blocks for a new request and the number of tokens they cover.
    ///
    /// At least one prompt token is always left to compute so the step
    /// produces logits.
    pub fn get_computed_blocks(
        &mut self,
        block_hashes: &[BlockHash],
        num_tokens: usize,
        skip_prefix_cache: bool,
    ) -> Result<(KvCacheBlocks, usize)> {
        let num_groups = self.num_groups();
        if !self.enable_caching || skip_prefix_cache {
            return Ok((KvCacheBlocks::empty(num_groups), 0));
        }

        let max_cache_hit_length = num_tokens.saturating_sub(1);
        let (blocks, num_hit_tokens) = self
            .coordinator
            .find_longest_cache_hit(block_hashes, max_cache_hit_length)?;
        if let Some(stats) = self.prefix_cache_stats.as_mut() {
            stats.record(num_tokens, num_hit_tokens);
        }
        if num_hit_tokens > 0 {
            debug!(
                "Prefix cache hit: {} of {} tokens",
                num_hit_tokens, num_tokens
            );
        }
        Ok((KvCacheBlocks { blocks }, num_hit_tokens))
    }

    /// Reserve blocks for `num_new_tokens` more tokens of a request.
    ///
    /// Adopts `new_computed_blocks` from a prefix hit, then grows each group's
    /// block table and publishes the blocks that became full. Fails with
    /// `OutOfBlocks` without side effects when the pool is too small.
    pub fn allocate_slots(&mut self, slot: SlotRequest<'_>) -> Result<KvCacheBlocks> {
        if slot.num_new_tokens == 0 {
            return Err(TesseraError::invalid_parameter(
                "num_new_tokens must be greater than 0",
            ));
        }
        let empty = KvCacheBlocks::empty(self.num_groups());
        let new_computed = slot.new_computed_blocks.unwrap_or(&empty);

        // Out-of-window blocks go back to the pool before sizing the request.
        self.coordinator
            .remove_skipped_blocks(slot.request, slot.num_computed_tokens)?;

        let num_computed_tokens = slot.num_computed_tokens + slot.num_new_computed_tokens;
        let num_tokens_need_slot = (num_computed_tokens
            + slot.num_new_tokens
            + slot.num_lookahead_tokens)
            .min(self.max_model_len);

        let num_blocks_to_allocate = self.coordinator.get_num_blocks_to_allocate(
            slot.request,
            num_tokens_need_slot,
            &new_computed.blocks,
        );
        let free = self.num_free_blocks();
        if num_blocks_to_allocate > free {
            return Err(TesseraError::out_of_blocks(num_blocks_to_allocate, free));
        }

        if self.enable_caching {
            for blocks in &new_computed.blocks {
                self.coordinator.pool_mut().touch(blocks);
            }
        } else if !new_computed.is_empty() {
            return Err(TesseraError::invalid_state(
                "computed blocks supplied while prefix caching is disabled",
            ));
        }

        self.coordinator
            .save_new_computed_blocks(slot.request, &new_computed.blocks)?;
        let new_blocks = self
            .coordinator
            .allocate_new_blocks(slot.request, num_tokens_need_slot)?;

        if self.enable_caching {
            // Draft tokens are unverified and never cached.
            let num_tokens_to_cache =
                (num_computed_tokens + slot.num_new_tokens).min(slot.num_tokens);
            self.coordinator
                .cache_blocks(slot.request, slot.block_hashes, num_tokens_to_cache)?;
        }
        Ok(KvCacheBlocks { blocks: new_blocks })
    }

    /// Take back prefix-cache entries for blocks past the request's first
    /// `num_computed_tokens` tokens.
    ///
    /// `allocate_slots` publishes blocks for tokens that are only scheduled.
    /// When the step fails their KV is never written, so they must not be
    /// found by later requests.
    pub fn uncache_unwritten_blocks(
        &mut self,
        request: RequestIndex,
        num_computed_tokens: usize,
    ) -> usize {
        let withdrawn = self
            .coordinator
            .uncache_blocks(request, num_computed_tokens);
        if withdrawn > 0 {
            debug!(
                "Withdrew {} unwritten blocks of request {} from the prefix cache",
                withdrawn, request
            );
        }
        withdrawn
    }

    /// Return every block of the request to the pool
    pub fn free(&mut self, request: RequestIndex, aborted: bool) -> Result<()> {
        let freed = self.coordinator.free(request, aborted)?;
        if freed > 0 {
            debug!("Freed {} blocks of request {}", freed, request);
        }
        Ok(())
    }

    pub fn get_block_ids(&self, request: RequestIndex) -> Vec<Vec<BlockId>> {
        self.coordinator.get_block_ids(request)
    }

    pub fn get_num_common_prefix_blocks(
        &self,
        request: RequestIndex,
        num_running_requests: usize,
    ) -> Vec<usize> {
        self.coordinator
            .get_num_common_prefix_blocks(request, num_running_requests)
    }

    pub fn reset_prefix_cache(&mut self) -> bool {
        if !self.coordinator.pool_mut().reset_prefix_cache() {
            return false;
        }
        if let Some(stats) = self.prefix_cache_stats.as_mut() {
            stats.reset = true;
        }
        true
    }

    /// Take the prefix cache counters accumulated since the last call
    pub fn make_prefix_cache_stats(&mut self) -> Option<PrefixCacheStats> {
        self.prefix_cache_stats.as_mut().map(std::mem::take)
    }
}
