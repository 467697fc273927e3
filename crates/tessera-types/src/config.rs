//! Configuration types shared across Tessera components

use serde::{Deserialize, Serialize};

use crate::{Result, TesseraError};

/// Hardware alignment every block size must be a multiple of
pub const BLOCK_SIZE_ALIGNMENT: usize = 16;

/// KV cache sizing and prefix caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per block
    pub block_size: usize,
    /// Device bytes reserved for KV cache buffers
    pub available_memory_bytes: u64,
    /// Use exactly this many blocks instead of the computed count
    pub num_gpu_blocks_override: Option<usize>,
    /// Reuse blocks across requests that share a token prefix
    pub enable_prefix_caching: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            available_memory_bytes: 4 * 1024 * 1024 * 1024,
            num_gpu_blocks_override: None,
            enable_prefix_caching: true,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % BLOCK_SIZE_ALIGNMENT != 0 {
            return Err(TesseraError::config(format!(
                "block_size must be a positive multiple of {}, got {}",
                BLOCK_SIZE_ALIGNMENT, self.block_size
            )));
        }
        if self.num_gpu_blocks_override == Some(0) {
            return Err(TesseraError::config(
                "num_gpu_blocks_override must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Step budget and admission limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum running requests
    pub max_num_seqs: usize,
    /// Token budget of a single step
    pub max_num_batched_tokens: usize,
    /// Longest sequence (prompt plus output) the model accepts
    pub max_model_len: usize,
    /// Cap on prefill tokens scheduled for one request per step, 0 disables
    pub long_prefill_token_threshold: usize,
    /// Encoder tokens computed per step
    pub max_num_encoder_input_tokens: usize,
    /// Encoder outputs kept alive at once, in tokens
    pub encoder_cache_size: usize,
    /// Attach scheduler statistics to step outputs
    pub log_stats: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_num_seqs: 256,
            max_num_batched_tokens: 8192,
            max_model_len: 4096,
            long_prefill_token_threshold: 0,
            max_num_encoder_input_tokens: 8192,
            encoder_cache_size: 8192,
            log_stats: true,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_num_seqs == 0 {
            return Err(TesseraError::config("max_num_seqs must be greater than 0"));
        }
        if self.max_model_len < 2 {
            return Err(TesseraError::config("max_model_len must be at least 2"));
        }
        if self.max_num_batched_tokens < self.max_num_seqs {
            return Err(TesseraError::config(format!(
                "max_num_batched_tokens ({}) must be greater than or equal to max_num_seqs ({})",
                self.max_num_batched_tokens, self.max_num_seqs
            )));
        }
        if self.encoder_cache_size < self.max_num_encoder_input_tokens {
            return Err(TesseraError::config(format!(
                "encoder_cache_size ({}) must be at least max_num_encoder_input_tokens ({})",
                self.encoder_cache_size, self.max_num_encoder_input_tokens
            )));
        }
        Ok(())
    }
}

/// Drafting method used for speculative decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculativeMethod {
    Eagle,
    Ngram,
    DraftModel,
}

/// Speculative decoding settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    pub method: SpeculativeMethod,
    /// Draft tokens proposed per step
    pub num_speculative_tokens: usize,
}

impl SpeculativeConfig {
    /// Eagle drafting needs the last matched prefix block recomputed
    pub fn use_eagle(&self) -> bool {
        self.method == SpeculativeMethod::Eagle
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_speculative_tokens == 0 {
            return Err(TesseraError::config(
                "num_speculative_tokens must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        if !["trace", "debug", "info", "warn", "error"].contains(&self.level.as_str()) {
            return Err(TesseraError::config(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }
        if !["json", "pretty"].contains(&self.format.as_str()) {
            return Err(TesseraError::config("Log format must be one of: json, pretty"));
        }
        Ok(())
    }
}

/// Everything the engine core needs at construction time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineCoreConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub speculative: Option<SpeculativeConfig>,
}

impl EngineCoreConfig {
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.scheduler.validate()?;
        if let Some(spec) = &self.speculative {
            spec.validate()?;
        }
        Ok(())
    }

    pub fn use_eagle(&self) -> bool {
        self.speculative.as_ref().is_some_and(|s| s.use_eagle())
    }

    /// Slots reserved ahead of the computed tokens for draft proposals
    pub fn num_lookahead_tokens(&self) -> usize {
        self.speculative
            .as_ref()
            .map_or(0, |s| s.num_speculative_tokens)
    }
}
