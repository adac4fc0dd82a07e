//! Payment failure codes and what to do about them
//!
//! Remote failures arrive as BOLT-4 failure codes. Each code is classified by
//! severity (which decides how long the offending channel is excluded) and
//! mapped to a recommended action for the part that hit it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Failure code flag: the onion itself was unreadable
pub const BADONION: u16 = 0x8000;
/// Failure code flag: retrying the same path will not help
pub const PERM: u16 = 0x4000;
/// Failure code flag: the failure is attributed to a node, not a channel
pub const NODE: u16 = 0x2000;
/// Failure code flag: a channel_update is attached
pub const UPDATE: u16 = 0x1000;

/// Highest exponent used by the retry backoff
pub const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Why a part failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    InvalidRealm,
    TemporaryNodeFailure,
    PermanentNodeFailure,
    RequiredNodeFeatureMissing,
    InvalidOnionVersion,
    InvalidOnionHmac,
    InvalidOnionKey,
    TemporaryChannelFailure,
    PermanentChannelFailure,
    RequiredChannelFeatureMissing,
    UnknownNextPeer,
    AmountBelowMinimum,
    FeeInsufficient,
    IncorrectCltvExpiry,
    ExpiryTooSoon,
    IncorrectOrUnknownPaymentDetails,
    FinalIncorrectCltvExpiry,
    FinalIncorrectHtlcAmount,
    ChannelDisabled,
    ExpiryTooFar,
    InvalidOnionPayload,
    MppTimeout,
    InvalidOnionBlinding,
    /// Our own first hop could not carry the amount (never on the wire)
    InsufficientBalance,
    /// The routing collaborator found no path (never on the wire)
    NoRoute,
    /// The payment was cancelled locally (never on the wire)
    Cancelled,
    /// A wire code this implementation does not know
    Unknown(u16),
}

/// How bad a failure is, which decides the exclusion window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureSeverity {
    /// Likely to clear up within minutes
    Transient,
    /// The channel could not carry the amount
    Liquidity,
    /// Will not clear up on its own
    Permanent,
    Unknown,
}

impl FailureCode {
    /// Decode a BOLT-4 failure code
    pub fn from_wire(code: u16) -> Self {
        match code {
            c if c == PERM | 1 => Self::InvalidRealm,
            c if c == NODE | 2 => Self::TemporaryNodeFailure,
            c if c == PERM | NODE | 2 => Self::PermanentNodeFailure,
            c if c == PERM | NODE | 3 => Self::RequiredNodeFeatureMissing,
            c if c == BADONION | PERM | 4 => Self::InvalidOnionVersion,
            c if c == BADONION | PERM | 5 => Self::InvalidOnionHmac,
            c if c == BADONION | PERM | 6 => Self::InvalidOnionKey,
            c if c == UPDATE | 7 => Self::TemporaryChannelFailure,
            c if c == PERM | 8 => Self::PermanentChannelFailure,
            c if c == PERM | 9 => Self::RequiredChannelFeatureMissing,
            c if c == PERM | 10 => Self::UnknownNextPeer,
            c if c == UPDATE | 11 => Self::AmountBelowMinimum,
            c if c == UPDATE | 12 => Self::FeeInsufficient,
            c if c == UPDATE | 13 => Self::IncorrectCltvExpiry,
            c if c == UPDATE | 14 => Self::ExpiryTooSoon,
            c if c == PERM | 15 => Self::IncorrectOrUnknownPaymentDetails,
            18 => Self::FinalIncorrectCltvExpiry,
            19 => Self::FinalIncorrectHtlcAmount,
            c if c == UPDATE | 20 => Self::ChannelDisabled,
            21 => Self::ExpiryTooFar,
            c if c == PERM | 22 => Self::InvalidOnionPayload,
            23 => Self::MppTimeout,
            c if c == BADONION | PERM | 24 => Self::InvalidOnionBlinding,
            other => Self::Unknown(other),
        }
    }

    /// Numeric BOLT-4 code, or `None` for local-only failures
    pub fn wire_code(&self) -> Option<u16> {
        let code = match self {
            Self::InvalidRealm => PERM | 1,
            Self::TemporaryNodeFailure => NODE | 2,
            Self::PermanentNodeFailure => PERM | NODE | 2,
            Self::RequiredNodeFeatureMissing => PERM | NODE | 3,
            Self::InvalidOnionVersion => BADONION | PERM | 4,
            Self::InvalidOnionHmac => BADONION | PERM | 5,
            Self::InvalidOnionKey => BADONION | PERM | 6,
            Self::TemporaryChannelFailure => UPDATE | 7,
            Self::PermanentChannelFailure => PERM | 8,
            Self::RequiredChannelFeatureMissing => PERM | 9,
            Self::UnknownNextPeer => PERM | 10,
            Self::AmountBelowMinimum => UPDATE | 11,
            Self::FeeInsufficient => UPDATE | 12,
            Self::IncorrectCltvExpiry => UPDATE | 13,
            Self::ExpiryTooSoon => UPDATE | 14,
            Self::IncorrectOrUnknownPaymentDetails => PERM | 15,
            Self::FinalIncorrectCltvExpiry => 18,
            Self::FinalIncorrectHtlcAmount => 19,
            Self::ChannelDisabled => UPDATE | 20,
            Self::ExpiryTooFar => 21,
            Self::InvalidOnionPayload => PERM | 22,
            Self::MppTimeout => 23,
            Self::InvalidOnionBlinding => BADONION | PERM | 24,
            Self::Unknown(code) => *code,
            Self::InsufficientBalance | Self::NoRoute | Self::Cancelled => return None,
        };
        Some(code)
    }

    pub fn is_permanent(&self) -> bool {
        self.wire_code().map(|c| c & PERM != 0).unwrap_or(false)
    }

    /// Whether the failing node (not just the channel) should be avoided
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            Self::PermanentNodeFailure
                | Self::RequiredNodeFeatureMissing
                | Self::TemporaryNodeFailure
        )
    }

    pub fn severity(&self) -> FailureSeverity {
        match self {
            Self::TemporaryNodeFailure | Self::TemporaryChannelFailure => {
                FailureSeverity::Transient
            }
            Self::AmountBelowMinimum | Self::InsufficientBalance => FailureSeverity::Liquidity,
            Self::PermanentNodeFailure
            | Self::PermanentChannelFailure
            | Self::RequiredNodeFeatureMissing
            | Self::RequiredChannelFeatureMissing => FailureSeverity::Permanent,
            _ => FailureSeverity::Unknown,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown failure 0x{:04x}", code),
            other => {
                let name = format!("{:?}", other);
                match other.wire_code() {
                    Some(code) => write!(f, "{} (0x{:04x})", name, code),
                    None => write!(f, "{}", name),
                }
            }
        }
    }
}

/// Recommended reaction to a failed part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendedAction {
    /// Try again, on another route if possible
    Retry,
    /// The amount was too large for the path; try a smaller amount
    Resplit { suggested_amount_msat: u64 },
    /// Retrying cannot succeed
    Abort,
}

/// Outcome of [`analyze_payment_error`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorAnalysis {
    pub action: RecommendedAction,
    /// How long to wait before the next attempt
    pub retry_delay: Duration,
    pub reason: &'static str,
}

impl ErrorAnalysis {
    pub fn should_retry(&self) -> bool {
        !matches!(self.action, RecommendedAction::Abort)
    }
}

/// Exponential backoff: `base * 2^min(retry_count, 5)`, scaled for node failures
pub fn retry_delay(code: FailureCode, retry_count: u32, base_delay: Duration) -> Duration {
    let exponent = retry_count.min(MAX_BACKOFF_EXPONENT);
    let node_factor = match code {
        FailureCode::TemporaryNodeFailure => 2,
        FailureCode::PermanentNodeFailure | FailureCode::RequiredNodeFeatureMissing => 3,
        _ => 1,
    };
    base_delay.saturating_mul((1u32 << exponent) * node_factor)
}

/// Map a failure to the action that gives the part its best chance
pub fn analyze_payment_error(
    code: FailureCode,
    amount_msat: u64,
    retry_count: u32,
    base_delay: Duration,
) -> ErrorAnalysis {
    let (action, reason) = match code {
        FailureCode::TemporaryChannelFailure => (
            RecommendedAction::Resplit {
                suggested_amount_msat: amount_msat / 2,
            },
            "channel lacked liquidity for this amount",
        ),
        FailureCode::InsufficientBalance => (
            RecommendedAction::Resplit {
                suggested_amount_msat: amount_msat.saturating_mul(3) / 4,
            },
            "first hop balance too low",
        ),
        FailureCode::AmountBelowMinimum => {
            (RecommendedAction::Abort, "part is below a channel minimum")
        }
        FailureCode::RequiredNodeFeatureMissing | FailureCode::RequiredChannelFeatureMissing => {
            (RecommendedAction::Abort, "required feature not supported")
        }
        FailureCode::IncorrectOrUnknownPaymentDetails | FailureCode::FinalIncorrectHtlcAmount => {
            (RecommendedAction::Abort, "destination rejected the payment details")
        }
        FailureCode::Cancelled => (RecommendedAction::Abort, "payment cancelled"),
        FailureCode::TemporaryNodeFailure => {
            (RecommendedAction::Retry, "node temporarily unavailable")
        }
        FailureCode::IncorrectCltvExpiry
        | FailureCode::ExpiryTooSoon
        | FailureCode::ExpiryTooFar
        | FailureCode::FinalIncorrectCltvExpiry => {
            (RecommendedAction::Retry, "CLTV timing mismatch")
        }
        FailureCode::Unknown(raw) if raw & PERM != 0 => {
            (RecommendedAction::Abort, "unknown permanent failure")
        }
        _ => (RecommendedAction::Retry, "route around the failure"),
    };

    ErrorAnalysis {
        action,
        retry_delay: retry_delay(code, retry_count, base_delay),
        reason,
    }
}
