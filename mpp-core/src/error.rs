//! Crate-level error type
//!
//! Each component has its own error enum; [`MppCoreError`] wraps them so that
//! callers driving several components can use one `?`-friendly type.

use crate::config::ConfigError;
use crate::lightning::collector::CollectorError;
use crate::lightning::multipath::MppError;
use crate::lightning::payment::IdentifierError;
use crate::lightning::splitter::SplitError;
use crate::lightning::wire::DecodeError;
use thiserror::Error;

/// Main error type for the multi-part payment core
#[derive(Debug, Error)]
pub enum MppCoreError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed wire bytes
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Malformed identifiers
    #[error("Identifier error: {0}")]
    Identifier(#[from] IdentifierError),

    /// Split planning errors
    #[error("Split error: {0}")]
    Split(#[from] SplitError),

    /// Send-side errors
    #[error("Payment error: {0}")]
    Payment(#[from] MppError),

    /// Receive-side errors
    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),
}

/// Result type alias for multi-part payment operations
pub type MppCoreResult<T> = Result<T, MppCoreError>;

impl MppCoreError {
    /// Whether the error came from malformed input rather than internal state
    pub fn is_invalid_input(&self) -> bool {
        match self {
            MppCoreError::Decode(_) | MppCoreError::Identifier(_) => true,
            MppCoreError::Payment(e) => matches!(
                e,
                MppError::InvalidRequest(_) | MppError::InvalidIdentifier(_)
            ),
            MppCoreError::Config(e) => matches!(e, ConfigError::Invalid(_) | ConfigError::Parse(_)),
            MppCoreError::Split(_) | MppCoreError::Collector(_) => false,
        }
    }
}
