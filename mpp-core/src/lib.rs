//! Multi-part payment core for a Lightning payment channel client.
//!
//! The crate turns one large payment into several concurrently routed partial
//! payments, keeps per-channel liquidity and failure history to pick good
//! splits, and reassembles partial payments on the receiving side.
//!
//! # Layout
//! - [`lightning::wire`] - BigSize, truncated integers and TLV streams
//! - [`lightning::exclusion`] - decaying exclusion windows for failed channels and nodes
//! - [`lightning::liquidity`] - per-channel liquidity estimates and success rates
//! - [`lightning::splitter`] - the five split strategies
//! - [`lightning::multipath`] - send-side orchestration
//! - [`lightning::collector`] - receive-side aggregation
//!
//! Routing, HTLC dispatch and the encrypted transport are collaborators behind
//! the [`lightning::RoutingGraph`] and [`lightning::HtlcDispatcher`] traits.

pub mod config;
pub mod error;
pub mod lightning;
pub mod util;

pub use config::{ConfigError, ExclusionConfig, LiquidityConfig, MppConfig};
pub use error::{MppCoreError, MppCoreResult};
pub use util::clock::{Clock, ManualClock, SystemClock};
