//! # Tessera KV
//!
//! Paged KV cache for inference serving:
//!
//! - Block geometry per layer and the set of geometries of a model
//! - Capacity planning of blocks against a memory budget
//! - A shared block pool with reference counting, prefix caching and LRU
//!   eviction
//! - Per-request block tables for full, sliding-window and MLA attention

pub mod blocks;
pub mod geometry;
pub mod managers;
pub mod planner;
pub mod spec_set;

pub use blocks::{
    hash_block_tokens, update_block_hashes, BlockHash, BlockHashWithGroupId, BlockPool,
    BlockPoolStats,
};
pub use geometry::{AllocationGroupKind, BlockGeometry, GeometryTypeId, KvQuantMode};
pub use managers::{
    CachePhase, KvCacheBlocks, KvCacheCoordinator, KvCacheManager, RequestCacheState,
    SingleTypeCacheManager, SlotRequest,
};
pub use planner::{
    estimate_max_model_len, unify_configs, AllocationGroup, CachePlanner, KvCacheConfig,
    KvCacheTensor, PlannerConfig,
};
pub use spec_set::CacheSpecSet;
