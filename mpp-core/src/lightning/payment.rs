//! Payment identifiers and the HTLC dispatch collaborator.
//!
//! Byte-array newtypes are validated at construction so that the rest of the
//! crate never handles a hash, secret or node id of the wrong length.

use super::failure::FailureCode;
use super::router::Route;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Length errors raised when converting raw bytes into identifiers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("{kind} must be exactly {expected} bytes, got {actual}")]
    InvalidLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{kind} is not valid hex: {reason}")]
    InvalidHex { kind: &'static str, reason: String },
}

macro_rules! byte_array_id {
    ($(#[$meta:meta])* $name:ident, $len:expr, $kind:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn into_inner(self) -> [u8; $len] {
                self.0
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(hex_str: &str) -> Result<Self, IdentifierError> {
                let bytes = hex::decode(hex_str).map_err(|e| IdentifierError::InvalidHex {
                    kind: $kind,
                    reason: e.to_string(),
                })?;
                Self::try_from(bytes.as_slice())
            }

            /// First eight bytes as hex, for log lines
            pub fn short_hex(&self) -> String {
                hex::encode(&self.0[..8])
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = IdentifierError;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let array: [u8; $len] =
                    bytes.try_into().map_err(|_| IdentifierError::InvalidLength {
                        kind: $kind,
                        expected: $len,
                        actual: bytes.len(),
                    })?;
                Ok(Self(array))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

byte_array_id!(
    /// Payment hash - SHA256 hash of the payment preimage
    PaymentHash,
    32,
    "payment hash"
);

byte_array_id!(
    /// Payment secret shared between payer and payee, carried in `payment_data`
    PaymentSecret,
    32,
    "payment secret"
);

byte_array_id!(
    /// Payment preimage revealed by the payee on settlement
    PaymentPreimage,
    32,
    "payment preimage"
);

byte_array_id!(
    /// Compressed secp256k1 public key of a node
    NodeId,
    33,
    "node id"
);

impl PaymentPreimage {
    /// Hash this preimage commits to
    pub fn payment_hash(&self) -> PaymentHash {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        PaymentHash(hasher.finalize().into())
    }
}

/// BOLT-7 short channel id: block height, transaction index and output index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    pub fn from_parts(block: u32, tx_index: u32, output_index: u16) -> Self {
        Self(
            ((block as u64 & 0xFF_FFFF) << 40)
                | ((tx_index as u64 & 0xFF_FFFF) << 16)
                | output_index as u64,
        )
    }

    pub fn block(&self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & 0xFF_FFFF) as u32
    }

    pub fn output_index(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.block(), self.tx_index(), self.output_index())
    }
}

/// Identifier of one part of a multi-part payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartId(pub u64);

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "part-{}", self.0)
    }
}

/// Channel-local HTLC identifier on the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HtlcId(pub u64);

/// One part handed to the dispatcher
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub payment_hash: PaymentHash,
    pub part_id: PartId,
    /// Amount delivered to the payee by this part
    pub amount_msat: u64,
    pub route: Route,
    /// Encoded TLV stream for the final hop
    pub final_hop_payload: Vec<u8>,
}

/// Failure reported by the dispatcher for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFailure {
    pub code: FailureCode,
    /// Channel the failure is attributed to, if the error onion said so
    pub failing_channel: Option<ShortChannelId>,
    /// Node that produced the failure, if known
    pub failing_node: Option<NodeId>,
    pub message: String,
}

impl PartFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            failing_channel: None,
            failing_node: None,
            message: message.into(),
        }
    }

    pub fn at_channel(mut self, channel: ShortChannelId) -> Self {
        self.failing_channel = Some(channel);
        self
    }

    pub fn at_node(mut self, node: NodeId) -> Self {
        self.failing_node = Some(node);
        self
    }
}

impl fmt::Display for PartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(channel) = self.failing_channel {
            write!(f, " (channel {})", channel)?;
        }
        Ok(())
    }
}

/// Sends one HTLC along a route and waits for it to resolve.
///
/// Onion construction and the encrypted peer transport live behind this
/// trait. Implementations are expected to bound each call with their own
/// timeout.
#[async_trait]
pub trait HtlcDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<PaymentPreimage, PartFailure>;
}
