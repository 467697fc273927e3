//! Configuration management for the engine core
//!
//! Settings load from a TOML file, or from defaults, and are then overridden
//! by `TESSERA_*` environment variables:
//!
//! - `TESSERA_LOG_LEVEL`
//! - `TESSERA_BLOCK_SIZE`
//! - `TESSERA_NUM_GPU_BLOCKS`

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use tessera_types::{
    CacheConfig, EngineCoreConfig, LoggingConfig, Result, SchedulerConfig, SpeculativeConfig,
    TesseraError,
};

pub const ENV_LOG_LEVEL: &str = "TESSERA_LOG_LEVEL";
pub const ENV_BLOCK_SIZE: &str = "TESSERA_BLOCK_SIZE";
pub const ENV_NUM_GPU_BLOCKS: &str = "TESSERA_NUM_GPU_BLOCKS";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Block size, memory budget and prefix caching
    pub cache: CacheConfig,
    /// Step budget and admission limits
    pub scheduler: SchedulerConfig,
    /// Draft-token settings, absent when speculative decoding is off
    pub speculative: Option<SpeculativeConfig>,
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate TOML without consulting the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TesseraError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply `TESSERA_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level.to_lowercase();
        }
        if let Some(value) = lookup(ENV_BLOCK_SIZE) {
            self.cache.block_size = parse_env(ENV_BLOCK_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_NUM_GPU_BLOCKS) {
            self.cache.num_gpu_blocks_override = Some(parse_env(ENV_NUM_GPU_BLOCKS, &value)?);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.engine_config().validate()?;
        self.logging.validate()
    }

    /// The part of the configuration the engine core consumes
    pub fn engine_config(&self) -> EngineCoreConfig {
        EngineCoreConfig {
            cache: self.cache.clone(),
            scheduler: self.scheduler.clone(),
            speculative: self.speculative.clone(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TesseraError::config(format!("Invalid value for {}: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cache.block_size, 16);
        assert_eq!(config.logging.level, "info");
        assert!(config.speculative.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [cache]
            block_size = 32

            [scheduler]
            max_num_seqs = 4
            max_num_batched_tokens = 512
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.block_size, 32);
        assert!(config.cache.enable_prefix_caching);
        assert_eq!(config.scheduler.max_num_seqs, 4);
        assert_eq!(config.scheduler.max_model_len, 4096);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_LOG_LEVEL, "DEBUG"),
            (ENV_BLOCK_SIZE, "32"),
            (ENV_NUM_GPU_BLOCKS, "128"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.cache.block_size, 32);
        assert_eq!(config.cache.num_gpu_blocks_override, Some(128));
    }

    #[test]
    fn test_bad_override_is_config_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == ENV_BLOCK_SIZE).then(|| "sixteen".to_string()))
            .unwrap_err();
        assert!(matches!(err, TesseraError::Config { .. }));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.cache.block_size = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
