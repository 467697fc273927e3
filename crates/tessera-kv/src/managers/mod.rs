//! Request-level KV cache management
//!
//! - [`SingleTypeCacheManager`]: block tables for one allocation group
//! - [`KvCacheCoordinator`]: all groups over one shared pool, hybrid prefix hits
//! - [`KvCacheManager`]: the scheduler-facing API

pub mod coordinator;
pub mod kv_cache_manager;
pub mod single_type;

pub use coordinator::KvCacheCoordinator;
pub use kv_cache_manager::{KvCacheBlocks, KvCacheManager, SlotRequest};
pub use single_type::{CachePhase, RequestCacheState, SingleTypeCacheManager};
