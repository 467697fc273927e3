//! KV cache capacity planning
//!
//! Turns a model's per-layer geometries and a device byte budget into a block
//! count, a set of allocation groups and the backing tensors each layer
//! writes into. Three layouts are supported:
//!
//! - uniform: every layer has the same type, one group covers all layers
//! - uniform page size: layer types differ but their pages are equally large,
//!   so groups of different types share backing tensors
//! - non-uniform: page sizes differ; one block-id space, one buffer per layer
//!   sized by that layer's own page

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geometry::{AllocationGroupKind, BlockGeometry, GeometryTypeId};
use crate::spec_set::CacheSpecSet;
use tessera_types::{CacheConfig, GroupId, Result, SchedulerConfig, TesseraError};

const GIB: f64 = (1u64 << 30) as f64;

/// Inputs to a planning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub available_memory_bytes: u64,
    pub max_model_len: usize,
    pub block_size: usize,
    pub num_gpu_blocks_override: Option<usize>,
}

impl PlannerConfig {
    pub fn from_configs(cache: &CacheConfig, scheduler: &SchedulerConfig) -> Self {
        Self {
            available_memory_bytes: cache.available_memory_bytes,
            max_model_len: scheduler.max_model_len,
            block_size: cache.block_size,
            num_gpu_blocks_override: cache.num_gpu_blocks_override,
        }
    }
}

/// A backing buffer and the layers that write into it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvCacheTensor {
    pub size_bytes: u64,
    pub shared_by: Vec<String>,
}

/// Layers that share one block table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationGroup {
    pub group_id: GroupId,
    /// Layer names in layer order
    pub layer_names: Vec<String>,
    /// Merged geometry of the member layers
    pub geometry: BlockGeometry,
    pub kind: AllocationGroupKind,
    pub block_size: usize,
    pub num_blocks: usize,
    /// Bytes one block id occupies across every layer of the group
    pub page_size_bytes: u64,
}

impl AllocationGroup {
    pub fn type_id(&self) -> GeometryTypeId {
        GeometryTypeId::compose(
            self.kind,
            self.block_size,
            self.page_size_bytes,
            self.geometry.use_mla,
        )
    }
}

/// Result of planning: immutable for the lifetime of the engine, except for
/// the block count lowered by [`unify_configs`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvCacheConfig {
    pub num_blocks: usize,
    pub groups: Vec<AllocationGroup>,
    pub tensors: Vec<KvCacheTensor>,
}

impl KvCacheConfig {
    pub fn block_size(&self) -> usize {
        self.groups.first().map_or(0, |g| g.block_size)
    }

    pub fn has_sliding_window(&self) -> bool {
        self.groups
            .iter()
            .any(|g| matches!(g.kind, AllocationGroupKind::SlidingWindow { .. }))
    }

    pub fn total_bytes(&self) -> u64 {
        self.tensors.iter().map(|t| t.size_bytes).sum()
    }

    /// Requests of `max_model_len` tokens that fit at once
    pub fn max_concurrency(&self, max_model_len: usize) -> f64 {
        let block_size = self.block_size();
        if block_size == 0 {
            return 0.0;
        }
        self.num_blocks as f64 / max_model_len.div_ceil(block_size) as f64
    }
}

struct TensorLayout {
    per_block_bytes: u64,
    shared_by: Vec<String>,
}

struct Layout {
    num_blocks: usize,
    groups: Vec<AllocationGroup>,
    tensors: Vec<TensorLayout>,
}

/// Plans KV cache memory for one worker
#[derive(Debug, Default, Clone, Copy)]
pub struct CachePlanner;

impl CachePlanner {
    pub fn plan(specs: &CacheSpecSet, config: &PlannerConfig) -> Result<KvCacheConfig> {
        if specs.is_empty() {
            return Err(TesseraError::invalid_parameter(
                "model has no layers that need a KV cache",
            ));
        }
        for (name, geometry) in specs.iter() {
            if geometry.block_size != config.block_size {
                return Err(TesseraError::geometry_mismatch(format!(
                    "layer {} uses block size {} but the cache is configured for {}",
                    name, geometry.block_size, config.block_size
                )));
            }
        }
        check_enough_memory(specs, config)?;

        let budget = config.available_memory_bytes;
        let layout = if specs.is_uniform_type()? {
            debug!("Planning uniform KV cache for {} layers", specs.len());
            uniform_layout(specs, budget)?
        } else if specs.has_uniform_page_size()? {
            debug!("Planning mixed-type KV cache with uniform page size");
            uniform_page_layout(specs, budget)?
        } else {
            debug!("Planning non-uniform KV cache with per-layer page sizes");
            non_uniform_layout(specs, budget)?
        };

        let mut num_blocks = layout.num_blocks;
        if let Some(override_blocks) = config.num_gpu_blocks_override {
            info!(
                "Overriding num_gpu_blocks={} with num_gpu_blocks_override={}",
                num_blocks, override_blocks
            );
            num_blocks = override_blocks;
        }
        if num_blocks < 1 {
            return Err(TesseraError::capacity(format!(
                "{:.2} GiB of KV cache memory cannot hold a single block; increase the memory budget",
                budget as f64 / GIB
            )));
        }

        let groups = layout
            .groups
            .into_iter()
            .map(|g| AllocationGroup { num_blocks, ..g })
            .collect::<Vec<_>>();
        let tensors = layout
            .tensors
            .into_iter()
            .map(|t| KvCacheTensor {
                size_bytes: t.per_block_bytes * num_blocks as u64,
                shared_by: t.shared_by,
            })
            .collect();

        let plan = KvCacheConfig {
            num_blocks,
            groups,
            tensors,
        };
        info!(
            "KV cache: {} blocks of {} tokens ({} tokens) in {} group(s), {:.2} GiB",
            plan.num_blocks,
            config.block_size,
            plan.num_blocks * config.block_size,
            plan.groups.len(),
            plan.total_bytes() as f64 / GIB
        );
        info!(
            "Maximum concurrency for {} tokens per request: {:.2}x",
            config.max_model_len,
            plan.max_concurrency(config.max_model_len)
        );
        Ok(plan)
    }
}

fn check_enough_memory(specs: &CacheSpecSet, config: &PlannerConfig) -> Result<()> {
    if config.available_memory_bytes == 0 {
        return Err(TesseraError::capacity(
            "no memory available for the cache blocks; increase the memory budget",
        ));
    }
    let needed = specs.max_memory_usage_bytes(config.max_model_len)?;
    if needed > config.available_memory_bytes {
        let estimated = estimate_max_model_len(
            specs,
            config.available_memory_bytes,
            config.max_model_len,
        )?;
        return Err(TesseraError::capacity(format!(
            "serving one request of max_model_len {} needs {:.2} GiB of KV cache, more than the available {:.2} GiB; the largest servable max_model_len is {}",
            config.max_model_len,
            needed as f64 / GIB,
            config.available_memory_bytes as f64 / GIB,
            estimated
        )));
    }
    Ok(())
}

/// Largest model length whose single-request footprint fits in `available_bytes`
pub fn estimate_max_model_len(
    specs: &CacheSpecSet,
    available_bytes: u64,
    max_model_len: usize,
) -> Result<usize> {
    let (mut lo, mut hi) = (1usize, max_model_len);
    let mut best = 0;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        if specs.max_memory_usage_bytes(mid)? <= available_bytes {
            best = mid;
            lo = mid + 1;
        } else {
            hi = mid - 1;
        }
    }
    Ok(best)
}

fn uniform_layout(specs: &CacheSpecSet, budget: u64) -> Result<Layout> {
    let geometry = specs.merge_all()?;
    let page = geometry.page_size_bytes(None)?;
    let layer_names: Vec<String> = specs.layer_names().map(str::to_string).collect();
    let group_page = page * layer_names.len() as u64;

    let tensors = layer_names
        .iter()
        .map(|name| TensorLayout {
            per_block_bytes: page,
            shared_by: vec![name.clone()],
        })
        .collect();
    let group = AllocationGroup {
        group_id: 0,
        kind: geometry.kind(),
        block_size: geometry.block_size,
        num_blocks: 0,
        page_size_bytes: group_page,
        layer_names,
        geometry,
    };
    Ok(Layout {
        num_blocks: (budget / group_page) as usize,
        groups: vec![group],
        tensors,
    })
}

fn uniform_page_layout(specs: &CacheSpecSet, budget: u64) -> Result<Layout> {
    let by_type = specs.group_by_type()?;
    let group_size = by_type
        .iter()
        .map(|(_, names)| names.len())
        .min()
        .unwrap_or(1);

    let mut groups = Vec::new();
    let mut page = 0;
    for (_, names) in &by_type {
        for chunk in names.chunks(group_size) {
            let geometries = chunk
                .iter()
                .filter_map(|name| specs.get(name).cloned())
                .collect::<Vec<_>>();
            let geometry = BlockGeometry::merge(&geometries)?;
            page = geometry.page_size_bytes(None)?;
            groups.push(AllocationGroup {
                group_id: groups.len(),
                layer_names: chunk.to_vec(),
                kind: geometry.kind(),
                block_size: geometry.block_size,
                num_blocks: 0,
                page_size_bytes: page * chunk.len() as u64,
                geometry,
            });
        }
    }

    // Tensor i backs the i-th layer of every group; block ids never collide
    // because all groups draw from one pool.
    let tensors = (0..group_size)
        .map(|i| TensorLayout {
            per_block_bytes: page,
            shared_by: groups
                .iter()
                .filter_map(|g| g.layer_names.get(i).cloned())
                .collect(),
        })
        .collect();

    Ok(Layout {
        num_blocks: (budget / (page * group_size as u64)) as usize,
        groups,
        tensors,
    })
}

fn non_uniform_layout(specs: &CacheSpecSet, budget: u64) -> Result<Layout> {
    if let Some((name, geometry)) = specs.iter().find(|(_, g)| !g.kind().is_full_like()) {
        return Err(TesseraError::geometry_mismatch(format!(
            "layer {} uses {:?}, which cannot share a block table with layers of a different page size",
            name,
            geometry.kind()
        )));
    }
    let merged = specs.merge_all()?;

    let mut tensors = Vec::with_capacity(specs.len());
    let mut total_page = 0u64;
    for (name, geometry) in specs.iter() {
        let page = geometry.page_size_bytes(None)?;
        total_page += page;
        tensors.push(TensorLayout {
            per_block_bytes: page,
            shared_by: vec![name.to_string()],
        });
    }

    let group = AllocationGroup {
        group_id: 0,
        layer_names: specs.layer_names().map(str::to_string).collect(),
        kind: merged.kind(),
        block_size: merged.block_size,
        num_blocks: 0,
        page_size_bytes: total_page,
        geometry: merged,
    };
    Ok(Layout {
        num_blocks: (budget / total_page) as usize,
        groups: vec![group],
        tensors,
    })
}

/// Reconcile the plans of parallel workers so they agree on one block count.
///
/// Every worker must have produced the same sequence of group types; each
/// plan is then clamped to the smallest block count among them.
pub fn unify_configs(configs: &mut [KvCacheConfig]) -> Result<()> {
    let Some(first) = configs.first() else {
        return Ok(());
    };
    let reference: Vec<GeometryTypeId> = first.groups.iter().map(|g| g.type_id()).collect();
    for (worker, config) in configs.iter().enumerate().skip(1) {
        let type_ids: Vec<GeometryTypeId> = config.groups.iter().map(|g| g.type_id()).collect();
        if type_ids != reference {
            return Err(TesseraError::geometry_mismatch(format!(
                "worker {} planned groups {:?}, expected {:?}",
                worker, type_ids, reference
            )));
        }
    }

    let min_blocks = configs.iter().map(|c| c.num_blocks).min().unwrap_or(0);
    for config in configs.iter_mut() {
        if config.num_blocks == min_blocks {
            continue;
        }
        debug!(
            "Clamping worker KV cache from {} to {} blocks",
            config.num_blocks, min_blocks
        );
        for tensor in &mut config.tensors {
            tensor.size_bytes = tensor.size_bytes / config.num_blocks as u64 * min_blocks as u64;
        }
        for group in &mut config.groups {
            group.num_blocks = min_blocks;
        }
        config.num_blocks = min_blocks;
    }
    Ok(())
}
