//! # Tessera
//!
//! Paged KV-cache planning, prefix caching and step reconciliation for LLM
//! serving.
//!
//! The workspace is split into three crates, re-exported here:
//!
//! - [`types`]: ids, configuration, statistics and errors
//! - [`kv`]: block geometry, the capacity planner, the block pool and the
//!   per-group cache managers
//! - [`scheduler`]: continuous batching, step reconciliation and the engine
//!   core loop
//!
//! This crate adds file and environment configuration and logging setup.

pub mod config;
pub mod test_utils;
pub mod utils;

pub use tessera_kv as kv;
pub use tessera_scheduler as scheduler;
pub use tessera_types as types;

pub use config::Config;
pub use tessera_kv::{BlockGeometry, CacheSpecSet, KvCacheConfig};
pub use tessera_scheduler::{
    EngineCore, EngineCoreHandle, EngineCoreOutputs, ModelExecutor, Request, StepOutcome,
};
pub use tessera_types::{Result, TesseraError};
pub use utils::{format_bytes, init_logging};

use tracing::info;

/// Validate `config`, plan the KV cache for `specs` and build an engine core
pub fn build_engine_core(
    config: &Config,
    specs: &CacheSpecSet,
    executor: Box<dyn ModelExecutor>,
) -> Result<EngineCore> {
    config.validate()?;
    info!(
        "Building engine core: {} layers, block size {}, memory budget {}",
        specs.len(),
        config.cache.block_size,
        format_bytes(config.cache.available_memory_bytes)
    );
    EngineCore::new(config.engine_config(), specs, executor)
}
