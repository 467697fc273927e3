//! Error types for the Tessera KV-cache core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for Tessera operations
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum TesseraError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Layers with incompatible block geometries were forced into one group
    #[error("Geometry mismatch: {message}")]
    GeometryMismatch { message: String },

    /// The byte budget cannot hold a single block or a single max-length request
    #[error("Insufficient KV cache capacity: {message}")]
    Capacity { message: String },

    /// The block pool cannot satisfy an allocation this step
    #[error("Out of KV cache blocks: requested {requested}, {free} free")]
    OutOfBlocks { requested: usize, free: usize },

    /// The model executor failed for the whole step
    #[error("Model execution failed: {message}")]
    ExecutionFailure { message: String },

    /// A block was released while its reference count was already zero
    #[error("Block {block_id} released with zero reference count")]
    DoubleRelease { block_id: u32 },

    /// Scheduling errors
    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    /// Invalid parameters or configuration values
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Operation attempted in a state that does not allow it
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Not found errors
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Already exists errors
    #[error("Already exists: {message}")]
    AlreadyExists { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    IO { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TesseraError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a geometry mismatch error
    pub fn geometry_mismatch(message: impl Into<String>) -> Self {
        Self::GeometryMismatch {
            message: message.into(),
        }
    }

    /// Create a capacity error
    pub fn capacity(message: impl Into<String>) -> Self {
        Self::Capacity {
            message: message.into(),
        }
    }

    /// Create an out-of-blocks error
    pub fn out_of_blocks(requested: usize, free: usize) -> Self {
        Self::OutOfBlocks { requested, free }
    }

    /// Create an execution failure
    pub fn execution_failure(message: impl Into<String>) -> Self {
        Self::ExecutionFailure {
            message: message.into(),
        }
    }

    /// Create a double release error
    pub fn double_release(block_id: u32) -> Self {
        Self::DoubleRelease { block_id }
    }

    /// Create a scheduler error
    pub fn scheduler(message: impl Into<String>) -> Self {
        Self::Scheduler {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an already exists error
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the operation may succeed on a later step without intervention
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfBlocks { .. } | Self::ExecutionFailure { .. }
        )
    }

    /// Check if this error must abort engine construction
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::GeometryMismatch { .. } | Self::Capacity { .. }
        )
    }

    /// Check if this error signals a broken internal invariant
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::DoubleRelease { .. } | Self::Internal { .. })
    }

    pub fn is_out_of_blocks(&self) -> bool {
        matches!(self, Self::OutOfBlocks { .. })
    }
}

/// Conversion from std::io::Error
impl From<std::io::Error> for TesseraError {
    fn from(err: std::io::Error) -> Self {
        Self::io(format!("{}", err))
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for TesseraError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("{}", err))
    }
}
