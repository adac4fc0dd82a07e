//! Configuration for the multi-part payment core.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! overrides:
//!
//! ```toml
//! max_parts = 12
//! strategy = "liquidity_based"
//!
//! [exclusion]
//! short_window_secs = 120
//! ```

use crate::lightning::splitter::{SplitLimits, SplitStrategy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default minimum part size (10 sat)
pub const DEFAULT_MIN_PART_SIZE_MSAT: u64 = 10_000;

/// Default maximum part size (10M sat)
pub const DEFAULT_MAX_PART_SIZE_MSAT: u64 = 10_000_000_000;

/// Default maximum number of parts per payment
pub const DEFAULT_MAX_PARTS: usize = 8;

/// Default number of retries for a single part
pub const DEFAULT_MAX_RETRIES_PER_PART: u32 = 3;

/// Default time a receiver waits for all parts of an MPP set
pub const DEFAULT_MPP_TIMEOUT_SECS: u64 = 60;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Exclusion window configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionConfig {
    /// Window for temporary node/channel failures
    pub short_window_secs: u64,
    /// Window for liquidity-class and unclassified failures
    pub default_window_secs: u64,
    /// Window for permanent failures
    pub long_window_secs: u64,
    /// Cap on the repeat-failure multiplier
    pub max_backoff_multiplier: u32,
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            short_window_secs: 5 * 60,
            default_window_secs: 30 * 60,
            long_window_secs: 2 * 60 * 60,
            max_backoff_multiplier: 4,
        }
    }
}

/// Liquidity model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityConfig {
    /// Weight of the newest outcome in the success-rate moving average
    pub ema_alpha: f64,
    /// Success rate assumed for a channel with no history
    pub initial_success_rate: f64,
    /// Liquidity hints older than this are pruned
    pub hint_max_age_secs: u64,
    /// Look-back window for the adaptive strategy's failure rate
    pub adaptive_window_secs: u64,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            initial_success_rate: 0.5,
            hint_max_age_secs: 60 * 60,
            adaptive_window_secs: 10 * 60,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MppConfig {
    /// Smallest part the splitter may produce
    pub min_part_size_msat: u64,
    /// Largest part the splitter should produce
    pub max_part_size_msat: u64,
    /// Maximum number of parts per payment
    pub max_parts: usize,
    /// Retries allowed for each part before it is final
    pub max_retries_per_part: u32,
    /// Retry failed parts automatically
    pub auto_retry: bool,
    /// Default split strategy
    pub strategy: SplitStrategy,
    /// Base delay for exponential retry backoff
    pub base_retry_delay_ms: u64,
    /// Fee budget per part, in parts per million of the part amount
    pub max_fee_ppm: u64,
    /// Receive-side timeout for collecting all parts
    pub mpp_timeout_secs: u64,
    /// Exclusion windows
    pub exclusion: ExclusionConfig,
    /// Liquidity model tuning
    pub liquidity: LiquidityConfig,
}

impl Default for MppConfig {
    fn default() -> Self {
        Self {
            min_part_size_msat: DEFAULT_MIN_PART_SIZE_MSAT,
            max_part_size_msat: DEFAULT_MAX_PART_SIZE_MSAT,
            max_parts: DEFAULT_MAX_PARTS,
            max_retries_per_part: DEFAULT_MAX_RETRIES_PER_PART,
            auto_retry: true,
            strategy: SplitStrategy::Adaptive,
            base_retry_delay_ms: 500,
            max_fee_ppm: 10_000,
            mpp_timeout_secs: DEFAULT_MPP_TIMEOUT_SECS,
            exclusion: ExclusionConfig::default(),
            liquidity: LiquidityConfig::default(),
        }
    }
}

impl MppConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        let config: MppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check that the limits are mutually consistent
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_part_size_msat == 0 {
            return Err(ConfigError::Invalid(
                "min_part_size_msat must be greater than zero".to_string(),
            ));
        }
        if self.min_part_size_msat > self.max_part_size_msat {
            return Err(ConfigError::Invalid(format!(
                "min_part_size_msat ({}) exceeds max_part_size_msat ({})",
                self.min_part_size_msat, self.max_part_size_msat
            )));
        }
        if self.max_parts == 0 {
            return Err(ConfigError::Invalid(
                "max_parts must be at least 1".to_string(),
            ));
        }
        if !(self.liquidity.ema_alpha > 0.0 && self.liquidity.ema_alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "liquidity.ema_alpha must be in (0, 1], got {}",
                self.liquidity.ema_alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.liquidity.initial_success_rate) {
            return Err(ConfigError::Invalid(format!(
                "liquidity.initial_success_rate must be in [0, 1], got {}",
                self.liquidity.initial_success_rate
            )));
        }
        if self.exclusion.max_backoff_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "exclusion.max_backoff_multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Splitter limits derived from this configuration
    pub fn split_limits(&self) -> SplitLimits {
        SplitLimits {
            min_part_size_msat: self.min_part_size_msat,
            max_part_size_msat: self.max_part_size_msat,
            max_parts: self.max_parts,
        }
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    /// Fee budget for routing `amount_msat`
    pub fn max_fee_msat(&self, amount_msat: u64) -> u64 {
        ((amount_msat as u128 * self.max_fee_ppm as u128) / 1_000_000) as u64
    }
}
