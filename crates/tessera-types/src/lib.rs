//! Core type definitions for the Tessera KV-cache core
//!
//! This crate contains the identifiers, configuration, statistics and error
//! definitions shared by the cache planner, the block pool and the scheduler.
//! It is kept free of scheduling logic to avoid circular dependencies.

pub mod config;
pub mod devices;
pub mod errors;
pub mod ids;
pub mod metrics;
pub mod sampling;

// Re-export commonly used types
pub use config::*;
pub use devices::*;
pub use errors::*;
pub use ids::*;
pub use metrics::*;
pub use sampling::*;

/// Result type used throughout Tessera
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Block identifier type
pub type BlockId = u32;

/// Allocation group identifier
pub type GroupId = usize;
