//! Configuration types for inflight-batcher.
//!
//! Configuration is read once when the engine is built and never mutated by
//! the scheduler afterwards.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a preempted request gets its cache back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionMode {
    /// Drop every block and recompute the full history through prefill on
    /// resumption.
    #[default]
    Recompute,
    /// Copy the blocks to host memory and copy them back on resumption.
    /// Falls back to [`PreemptionMode::Recompute`] when host blocks run out.
    Swap,
}

/// KV cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per block.
    pub block_size: usize,
    /// Device pool capacity `C`, in blocks.
    pub num_blocks: usize,
    /// Host pool capacity used by swap preemption.
    pub num_host_blocks: usize,
    /// Share full prompt blocks between requests with identical prefixes.
    pub enable_prefix_caching: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            num_blocks: 1024,
            num_host_blocks: 0,
            enable_prefix_caching: false,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of sequences in one batch.
    pub max_batch_size: usize,
    /// Maximum number of tokens processed in one step
    /// (prefill tokens plus one per decoding sequence).
    pub max_aggregate_tokens: usize,
    /// Preemption policy.
    pub preemption_mode: PreemptionMode,
    /// Steps a request may be deferred for lack of blocks before it is
    /// terminated as resource exhausted.
    pub max_deferred_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 256,
            max_aggregate_tokens: 4096,
            preemption_mode: PreemptionMode::Recompute,
            max_deferred_steps: 1024,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// KV cache layout.
    pub cache: CacheConfig,
    /// Batching limits and preemption policy.
    pub scheduler: SchedulerConfig,
    /// End-of-sequence token, if the model has one.
    pub eos_token_id: Option<u32>,
}

impl EngineConfig {
    /// Load a configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every limit is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.cache.block_size == 0 {
            return Err(Error::Config("cache.block_size must be > 0".to_string()));
        }
        if self.cache.num_blocks == 0 {
            return Err(Error::Config("cache.num_blocks must be > 0".to_string()));
        }
        if self.scheduler.max_batch_size == 0 {
            return Err(Error::Config(
                "scheduler.max_batch_size must be > 0".to_string(),
            ));
        }
        if self.scheduler.max_aggregate_tokens < self.scheduler.max_batch_size {
            return Err(Error::Config(format!(
                "scheduler.max_aggregate_tokens ({}) must be >= max_batch_size ({})",
                self.scheduler.max_aggregate_tokens, self.scheduler.max_batch_size
            )));
        }
        if self.scheduler.preemption_mode == PreemptionMode::Swap
            && self.cache.num_host_blocks == 0
        {
            return Err(Error::Config(
                "swap preemption requires cache.num_host_blocks > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.block_size, 16);
        assert_eq!(config.scheduler.preemption_mode, PreemptionMode::Recompute);
    }

    #[test]
    fn test_rejects_zero_block_size() {
        let mut config = EngineConfig::default();
        config.cache.block_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_swap_needs_host_blocks() {
        let mut config = EngineConfig::default();
        config.scheduler.preemption_mode = PreemptionMode::Swap;
        assert!(config.validate().is_err());

        config.cache.num_host_blocks = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "cache": { "block_size": 4, "num_blocks": 10 },
                        "scheduler": { "preemption_mode": "swap" } }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.cache.block_size, 4);
        assert_eq!(config.cache.num_blocks, 10);
        assert_eq!(config.cache.num_host_blocks, 0);
        assert_eq!(config.scheduler.max_batch_size, 256);
        assert_eq!(config.scheduler.preemption_mode, PreemptionMode::Swap);
        assert_eq!(config.eos_token_id, None);
    }
}
