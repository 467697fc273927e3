//! Coordinates the per-group managers over one shared block pool

use tracing::debug;

use super::single_type::SingleTypeCacheManager;
use crate::blocks::{BlockHash, BlockPool};
use crate::geometry::AllocationGroupKind;
use crate::planner::KvCacheConfig;
use tessera_types::{BlockId, GroupId, RequestIndex, Result, TesseraError};

/// How prefix hits are resolved across groups
#[derive(Debug, Clone)]
enum HitStrategy {
    /// Prefix caching disabled
    Disabled,
    /// Every group shares one attention kind
    Unitary { kind: AllocationGroupKind },
    /// Full-like groups plus sliding-window groups of one window size
    Hybrid {
        full_kind: AllocationGroupKind,
        full_groups: Vec<GroupId>,
        sliding_kind: AllocationGroupKind,
        sliding_groups: Vec<GroupId>,
    },
}

#[derive(Debug)]
pub struct KvCacheCoordinator {
    pool: BlockPool,
    managers: Vec<SingleTypeCacheManager>,
    strategy: HitStrategy,
    block_size: usize,
    use_eagle: bool,
}

impl KvCacheCoordinator {
    pub fn new(config: &KvCacheConfig, enable_caching: bool, use_eagle: bool) -> Result<Self> {
        if config.groups.is_empty() {
            return Err(TesseraError::invalid_parameter(
                "KV cache config has no allocation groups",
            ));
        }
        let block_size = config.block_size();
        if let Some(g) = config.groups.iter().find(|g| g.block_size != block_size) {
            return Err(TesseraError::geometry_mismatch(format!(
                "group {} uses block size {}, expected {}",
                g.group_id, g.block_size, block_size
            )));
        }

        let pool = BlockPool::new(
            config.num_blocks,
            enable_caching,
            config.has_sliding_window(),
        )?;
        let managers = config
            .groups
            .iter()
            .map(|g| SingleTypeCacheManager::new(g.group_id, g.kind, block_size))
            .collect::<Vec<_>>();
        let strategy = if enable_caching {
            Self::hit_strategy(&managers)?
        } else {
            HitStrategy::Disabled
        };
        debug!("KV cache coordinator uses {:?}", strategy);

        Ok(Self {
            pool,
            managers,
            strategy,
            block_size,
            use_eagle,
        })
    }

    fn hit_strategy(managers: &[SingleTypeCacheManager]) -> Result<HitStrategy> {
        let first = managers[0].kind();
        if managers.iter().all(|m| m.kind() == first) {
            return Ok(HitStrategy::Unitary { kind: first });
        }

        let (full, sliding): (Vec<_>, Vec<_>) =
            managers.iter().partition(|m| m.kind().is_full_like());
        let full_kind = full.first().map(|m| m.kind());
        let sliding_kind = sliding.first().map(|m| m.kind());
        match (full_kind, sliding_kind) {
            (Some(full_kind), Some(sliding_kind))
                if full.iter().all(|m| m.kind() == full_kind)
                    && sliding.iter().all(|m| m.kind() == sliding_kind) =>
            {
                Ok(HitStrategy::Hybrid {
                    full_kind,
                    full_groups: full.iter().map(|m| m.group_id()).collect(),
                    sliding_kind,
                    sliding_groups: sliding.iter().map(|m| m.group_id()).collect(),
                })
            }
            _ => Err(TesseraError::geometry_mismatch(format!(
                "prefix caching supports one full attention kind plus one sliding window size, got {:?}",
                managers.iter().map(|m| m.kind()).collect::<Vec<_>>()
            ))),
        }
    }

    pub fn pool(&self) -> &BlockPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BlockPool {
        &mut self.pool
    }

    pub fn num_groups(&self) -> usize {
        self.managers.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Longest cached prefix usable by every group, as one block list per
    /// group plus the number of hit tokens
    pub fn find_longest_cache_hit(
        &self,
        block_hashes: &[BlockHash],
        max_length: usize,
    ) -> Result<(Vec<Vec<BlockId>>, usize)> {
        let bs = self.block_size;
        match &self.strategy {
            HitStrategy::Disabled => Ok((vec![Vec::new(); self.managers.len()], 0)),
            HitStrategy::Unitary { kind } => {
                let group_ids: Vec<GroupId> = self.managers.iter().map(|m| m.group_id()).collect();
                let hits = SingleTypeCacheManager::find_longest_cache_hit(
                    &self.pool,
                    block_hashes,
                    max_length,
                    &group_ids,
                    *kind,
                    bs,
                    self.use_eagle,
                )?;
                let num_tokens = hits.first().map_or(0, |b| b.len()) * bs;
                Ok((hits, num_tokens))
            }
            HitStrategy::Hybrid {
                full_kind,
                full_groups,
                sliding_kind,
                sliding_groups,
            } => {
                // Full attention needs a hit from position 0, so it bounds the
                // sliding-window search.
                let mut full_hits = SingleTypeCacheManager::find_longest_cache_hit(
                    &self.pool,
                    block_hashes,
                    max_length,
                    full_groups,
                    *full_kind,
                    bs,
                    self.use_eagle,
                )?;
                let full_len = full_hits.first().map_or(0, |b| b.len()) * bs;
                let sliding_hits = SingleTypeCacheManager::find_longest_cache_hit(
                    &self.pool,
                    block_hashes,
                    full_len,
                    sliding_groups,
                    *sliding_kind,
                    bs,
                    self.use_eagle,
                )?;
                let num_blocks = sliding_hits.first().map_or(0, |b| b.len());
                for blocks in full_hits.iter_mut() {
                    blocks.truncate(num_blocks);
                }

                let mut hits = vec![Vec::new(); self.managers.len()];
                for (&g, blocks) in full_groups.iter().zip(full_hits) {
                    hits[g] = blocks;
                }
                for (&g, blocks) in sliding_groups.iter().zip(sliding_hits) {
                    hits[g] = blocks;
                }
                Ok((hits, num_blocks * bs))
            }
        }
    }

    pub fn get_num_blocks_to_allocate(
        &self,
        request: RequestIndex,
        num_tokens: usize,
        new_computed_blocks: &[Vec<BlockId>],
    ) -> usize {
        self.managers
            .iter()
            .enumerate()
            .map(|(g, m)| {
                let computed = new_computed_blocks.get(g).map_or(&[][..], Vec::as_slice);
                m.get_num_blocks_to_allocate(request, num_tokens, computed, &self.pool)
            })
            .sum()
    }

    pub fn save_new_computed_blocks(
        &mut self,
        request: RequestIndex,
        new_computed_blocks: &[Vec<BlockId>],
    ) -> Result<()> {
        for (g, manager) in self.managers.iter_mut().enumerate() {
            let computed = new_computed_blocks.get(g).map_or(&[][..], Vec::as_slice);
            manager.save_new_computed_blocks(request, computed)?;
        }
        Ok(())
    }

    pub fn allocate_new_blocks(
        &mut self,
        request: RequestIndex,
        num_tokens: usize,
    ) -> Result<Vec<Vec<BlockId>>> {
        let pool = &mut self.pool;
        self.managers
            .iter_mut()
            .map(|m| m.allocate_new_blocks(request, num_tokens, pool))
            .collect()
    }

    pub fn cache_blocks(
        &mut self,
        request: RequestIndex,
        block_hashes: &[BlockHash],
        num_computed_tokens: usize,
    ) -> Result<()> {
        for manager in self.managers.iter_mut() {
            manager.cache_blocks(request, block_hashes, num_computed_tokens, &mut self.pool)?;
        }
        Ok(())
    }

    pub fn uncache_blocks(&mut self, request: RequestIndex, num_tokens: usize) -> usize {
        let pool = &mut self.pool;
        self.managers
            .iter_mut()
            .map(|m| m.uncache_blocks(request, num_tokens, pool))
            .sum()
    }

    /// Release the request's blocks in every group
    pub fn free(&mut self, request: RequestIndex, aborted: bool) -> Result<usize> {
        let mut total = 0;
        for manager in self.managers.iter_mut() {
            total += manager.free(request, &mut self.pool, aborted)?;
        }
        Ok(total)
    }

    pub fn remove_skipped_blocks(
        &mut self,
        request: RequestIndex,
        num_computed_tokens: usize,
    ) -> Result<()> {
        for manager in self.managers.iter_mut() {
            manager.remove_skipped_blocks(request, num_computed_tokens, &mut self.pool)?;
        }
        Ok(())
    }

    pub fn get_num_common_prefix_blocks(
        &self,
        request: RequestIndex,
        num_running_requests: usize,
    ) -> Vec<usize> {
        self.managers
            .iter()
            .map(|m| m.get_num_common_prefix_blocks(request, num_running_requests, &self.pool))
            .collect()
    }

    pub fn get_block_ids(&self, request: RequestIndex) -> Vec<Vec<BlockId>> {
        self.managers
            .iter()
            .map(|m| m.block_ids(request).to_vec())
            .collect()
    }

    pub fn manager(&self, group_id: GroupId) -> Option<&SingleTypeCacheManager> {
        self.managers.get(group_id)
    }
}
