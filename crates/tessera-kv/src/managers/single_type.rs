//! Per-group block bookkeeping for requests
//!
//! One manager per allocation group tracks each request's block table in that
//! group. Attention variants differ in how prefix hits are found and whether
//! old blocks can be dropped early; both are dispatched on
//! [`AllocationGroupKind`].

use std::collections::HashMap;
use tracing::trace;

use crate::blocks::{BlockHash, BlockPool};
use crate::geometry::AllocationGroupKind;
use tessera_types::{BlockId, GroupId, RequestIndex, Result, TesseraError};

/// Lifecycle of a request's cache state within one group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    /// Admitted without a prefix hit
    Prefill,
    /// Admitted with blocks reused from the prefix cache
    PartialHit,
    /// Computed tokens have been published to the pool
    Extending,
    Finished,
    Aborted,
}

impl CachePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CachePhase::Finished | CachePhase::Aborted)
    }
}

/// A request's block table in one group
#[derive(Debug, Clone, PartialEq)]
pub struct RequestCacheState {
    pub block_ids: Vec<BlockId>,
    /// Leading blocks already published to the prefix cache
    pub num_cached_blocks: usize,
    pub phase: CachePhase,
}

#[derive(Debug)]
pub struct SingleTypeCacheManager {
    group_id: GroupId,
    kind: AllocationGroupKind,
    block_size: usize,
    requests: HashMap<RequestIndex, RequestCacheState>,
}

impl SingleTypeCacheManager {
    pub fn new(group_id: GroupId, kind: AllocationGroupKind, block_size: usize) -> Self {
        Self {
            group_id,
            kind,
            block_size,
            requests: HashMap::new(),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn kind(&self) -> AllocationGroupKind {
        self.kind
    }

    pub fn state(&self, request: RequestIndex) -> Option<&RequestCacheState> {
        self.requests.get(&request)
    }

    pub fn block_ids(&self, request: RequestIndex) -> &[BlockId] {
        self.requests
            .get(&request)
            .map_or(&[], |s| s.block_ids.as_slice())
    }

    pub fn num_tracked_requests(&self) -> usize {
        self.requests.len()
    }

    /// New blocks needed to hold `num_tokens`, counting reused cached blocks
    /// that must leave the free pool
    pub fn get_num_blocks_to_allocate(
        &self,
        request: RequestIndex,
        num_tokens: usize,
        new_computed_blocks: &[BlockId],
        pool: &BlockPool,
    ) -> usize {
        let num_required = num_tokens.div_ceil(self.block_size);
        let num_existing = self.block_ids(request).len();
        let num_new = num_required.saturating_sub(new_computed_blocks.len() + num_existing);
        let num_evictable_computed = new_computed_blocks
            .iter()
            .filter(|&&b| !pool.is_null(b) && pool.ref_count(b) == 0)
            .count();
        num_new + num_evictable_computed
    }

    /// Record prefix-hit blocks for a newly admitted request
    pub fn save_new_computed_blocks(
        &mut self,
        request: RequestIndex,
        new_computed_blocks: &[BlockId],
    ) -> Result<()> {
        match self.requests.get(&request) {
            None => {
                let phase = if new_computed_blocks.is_empty() {
                    CachePhase::Prefill
                } else {
                    CachePhase::PartialHit
                };
                self.requests.insert(
                    request,
                    RequestCacheState {
                        block_ids: new_computed_blocks.to_vec(),
                        num_cached_blocks: new_computed_blocks.len(),
                        phase,
                    },
                );
                Ok(())
            }
            Some(_) if new_computed_blocks.is_empty() => Ok(()),
            Some(_) => Err(TesseraError::invalid_state(format!(
                "request {} already holds blocks in group {}; prefix hits only apply on admission",
                request, self.group_id
            ))),
        }
    }

    /// Grow the block table to cover `num_tokens`; returns the new blocks
    pub fn allocate_new_blocks(
        &mut self,
        request: RequestIndex,
        num_tokens: usize,
        pool: &mut BlockPool,
    ) -> Result<Vec<BlockId>> {
        let state = self
            .requests
            .entry(request)
            .or_insert_with(|| RequestCacheState {
                block_ids: Vec::new(),
                num_cached_blocks: 0,
                phase: CachePhase::Prefill,
            });
        let num_required = num_tokens.div_ceil(self.block_size);
        let num_new = num_required.saturating_sub(state.block_ids.len());
        if num_new == 0 {
            return Ok(Vec::new());
        }
        let new_blocks = pool.allocate_blocks(num_new)?;
        state.block_ids.extend_from_slice(&new_blocks);
        Ok(new_blocks)
    }

    /// Publish every block fully covered by `num_tokens`
    pub fn cache_blocks(
        &mut self,
        request: RequestIndex,
        block_hashes: &[BlockHash],
        num_tokens: usize,
        pool: &mut BlockPool,
    ) -> Result<()> {
        let Some(state) = self.requests.get_mut(&request) else {
            return Ok(());
        };
        let num_full_blocks = (num_tokens / self.block_size)
            .min(block_hashes.len())
            .min(state.block_ids.len());
        if num_full_blocks > state.num_cached_blocks {
            pool.cache_full_blocks(
                &state.block_ids,
                block_hashes,
                state.num_cached_blocks,
                num_full_blocks,
                self.group_id,
            )?;
            state.num_cached_blocks = num_full_blocks;
        }
        if num_tokens > 0 && !state.phase.is_terminal() {
            state.phase = CachePhase::Extending;
        }
        Ok(())
    }

    /// Withdraw published blocks past the first `num_tokens` tokens from the
    /// prefix cache. Returns how many blocks were withdrawn.
    pub fn uncache_blocks(
        &mut self,
        request: RequestIndex,
        num_tokens: usize,
        pool: &mut BlockPool,
    ) -> usize {
        let Some(state) = self.requests.get_mut(&request) else {
            return 0;
        };
        let keep = (num_tokens / self.block_size).min(state.num_cached_blocks);
        let withdrawn = state.block_ids[keep..state.num_cached_blocks]
            .iter()
            .filter(|&&block_id| pool.uncache_block(block_id))
            .count();
        state.num_cached_blocks = keep;
        withdrawn
    }

    /// Release every block of the request exactly once, tail first so the
    /// least shareable blocks are evicted first. Returns the number of blocks
    /// the request held.
    pub fn free(
        &mut self,
        request: RequestIndex,
        pool: &mut BlockPool,
        aborted: bool,
    ) -> Result<usize> {
        let Some(mut state) = self.requests.remove(&request) else {
            return Ok(0);
        };
        state.phase = if aborted {
            CachePhase::Aborted
        } else {
            CachePhase::Finished
        };
        trace!(
            "Releasing {} blocks of request {} in group {} ({:?})",
            state.block_ids.len(),
            request,
            self.group_id,
            state.phase
        );
        let count = state.block_ids.len();
        pool.free_blocks(state.block_ids.into_iter().rev())?;
        Ok(count)
    }

    /// Replace blocks that left the attention window with the null block and
    /// release them. No-op for full-like groups.
    pub fn remove_skipped_blocks(
        &mut self,
        request: RequestIndex,
        num_computed_tokens: usize,
        pool: &mut BlockPool,
    ) -> Result<()> {
        let AllocationGroupKind::SlidingWindow { window } = self.kind else {
            return Ok(());
        };
        let Some(state) = self.requests.get_mut(&request) else {
            return Ok(());
        };
        let null_block = pool.null_block().ok_or_else(|| {
            TesseraError::invalid_state("sliding window groups need a null block")
        })?;

        let last_useful_token = (num_computed_tokens + 1).saturating_sub(window);
        let last_useful_block = (last_useful_token / self.block_size).min(state.block_ids.len());
        let mut removed = Vec::new();
        for i in (0..last_useful_block).rev() {
            if state.block_ids[i] == null_block {
                // Everything before was dropped on an earlier step.
                break;
            }
            removed.push(state.block_ids[i]);
            state.block_ids[i] = null_block;
        }
        if !removed.is_empty() {
            trace!(
                "Dropped {} out-of-window blocks of request {}",
                removed.len(),
                request
            );
        }
        pool.free_blocks(removed)
    }

    /// Leading blocks referenced by every running request
    pub fn get_num_common_prefix_blocks(
        &self,
        request: RequestIndex,
        num_running_requests: usize,
        pool: &BlockPool,
    ) -> usize {
        if !self.kind.is_full_like() {
            return 0;
        }
        self.block_ids(request)
            .iter()
            .take_while(|&&b| pool.ref_count(b) as usize == num_running_requests)
            .count()
    }

    /// Longest run of cached blocks for `block_hashes`, capped at
    /// `max_length` tokens, with one block list per group in `group_ids`.
    ///
    /// Full-like groups extend the hit left to right and stop at the first
    /// miss. Sliding-window groups only need the last window of blocks, so
    /// they search right to left for enough contiguous hits and pad the rest
    /// with the null block. With eagle drafting the last matched block is
    /// dropped so it is recomputed alongside the draft.
    pub fn find_longest_cache_hit(
        pool: &BlockPool,
        block_hashes: &[BlockHash],
        max_length: usize,
        group_ids: &[GroupId],
        kind: AllocationGroupKind,
        block_size: usize,
        use_eagle: bool,
    ) -> Result<Vec<Vec<BlockId>>> {
        let max_num_blocks = (max_length / block_size).min(block_hashes.len());
        let mut computed: Vec<Vec<BlockId>> = vec![Vec::new(); group_ids.len()];

        match kind {
            AllocationGroupKind::Full | AllocationGroupKind::MlaQuant { .. } => {
                for &hash in &block_hashes[..max_num_blocks] {
                    let Some(hit) = pool.get_cached_block(hash, group_ids) else {
                        break;
                    };
                    for (blocks, &block) in computed.iter_mut().zip(hit.iter()) {
                        blocks.push(block);
                    }
                }
            }
            AllocationGroupKind::SlidingWindow { window } => {
                let null_block = pool.null_block().ok_or_else(|| {
                    TesseraError::invalid_state("sliding window groups need a null block")
                })?;
                let mut contiguous_needed = (window - 1).div_ceil(block_size);
                if use_eagle {
                    contiguous_needed += 1;
                }
                for blocks in computed.iter_mut() {
                    blocks.resize(max_num_blocks, null_block);
                }

                let mut num_contiguous = 0;
                let mut match_found = false;
                for i in (0..max_num_blocks).rev() {
                    match pool.get_cached_block(block_hashes[i], group_ids) {
                        Some(hit) => {
                            for (blocks, &block) in computed.iter_mut().zip(hit.iter()) {
                                blocks[i] = block;
                            }
                            num_contiguous += 1;
                            if num_contiguous >= contiguous_needed {
                                for blocks in computed.iter_mut() {
                                    blocks.truncate(i + num_contiguous);
                                }
                                match_found = true;
                                break;
                            }
                        }
                        None => num_contiguous = 0,
                    }
                }
                if !match_found {
                    // Only a run starting at position 0 is usable.
                    for blocks in computed.iter_mut() {
                        blocks.truncate(num_contiguous);
                    }
                }
            }
        }

        if use_eagle && computed.first().is_some_and(|b| !b.is_empty()) {
            for blocks in computed.iter_mut() {
                blocks.pop();
            }
        }
        Ok(computed)
    }
}
