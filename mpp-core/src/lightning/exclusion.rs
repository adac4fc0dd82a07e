//! Path exclusion with severity-scaled, decaying windows
//!
//! A failed channel is excluded for a window that depends on how bad the
//! failure was (see [`FailureSeverity`]). Repeat failures stretch the window
//! by `min(failure_count, max_backoff_multiplier)`. Node-attributable failures
//! also exclude the failing node.
//!
//! Exclusion is amount-aware: a channel that failed to carry 100k msat is only
//! excluded for attempts of at least that size.
//!
//! Entries are not removed when their window passes; call
//! [`PathExclusionManager::prune_expired`] from a periodic task.

use super::failure::{FailureCode, FailureSeverity};
use super::payment::{NodeId, ShortChannelId};
use crate::config::ExclusionConfig;
use crate::util::clock::Clock;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Failure history of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPathInfo {
    pub channel_id: ShortChannelId,
    pub failing_node: Option<NodeId>,
    pub failure_code: FailureCode,
    /// Time of the latest failure (ms)
    pub timestamp_ms: u64,
    /// Smallest amount this channel has failed to carry
    pub amount_msat: u64,
    pub failure_count: u32,
    /// The channel is excluded until this time (ms)
    pub exclusion_expiry_ms: u64,
}

impl FailedPathInfo {
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.exclusion_expiry_ms > now_ms
    }
}

/// Tracks channels and nodes that recently failed
pub struct PathExclusionManager {
    channels: DashMap<ShortChannelId, FailedPathInfo>,
    /// Node -> exclusion expiry (ms)
    nodes: DashMap<NodeId, u64>,
    config: ExclusionConfig,
    clock: Arc<dyn Clock>,
}

impl PathExclusionManager {
    pub fn new(config: ExclusionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            channels: DashMap::new(),
            nodes: DashMap::new(),
            config,
            clock,
        }
    }

    /// Base exclusion window for a failure code
    pub fn exclusion_window(&self, code: FailureCode) -> Duration {
        let secs = match code.severity() {
            FailureSeverity::Transient => self.config.short_window_secs,
            FailureSeverity::Permanent => self.config.long_window_secs,
            FailureSeverity::Liquidity | FailureSeverity::Unknown => {
                self.config.default_window_secs
            }
        };
        Duration::from_secs(secs)
    }

    /// Record a failure of `channel_id` while carrying `amount_msat`
    pub fn record_failure(
        &self,
        channel_id: ShortChannelId,
        failure_code: FailureCode,
        amount_msat: u64,
        failing_node: Option<NodeId>,
    ) -> FailedPathInfo {
        let now = self.clock.now_millis();
        let window_ms = self.exclusion_window(failure_code).as_millis() as u64;
        let max_multiplier = self.config.max_backoff_multiplier.max(1) as u64;

        let info = match self.channels.entry(channel_id) {
            Entry::Occupied(mut entry) => {
                let info = entry.get_mut();
                info.failure_count = info.failure_count.saturating_add(1);
                let multiplier = (info.failure_count as u64).min(max_multiplier);
                info.exclusion_expiry_ms = now.saturating_add(window_ms.saturating_mul(multiplier));
                info.failure_code = failure_code;
                info.timestamp_ms = now;
                info.amount_msat = info.amount_msat.min(amount_msat);
                if failing_node.is_some() {
                    info.failing_node = failing_node;
                }
                info.clone()
            }
            Entry::Vacant(entry) => entry
                .insert(FailedPathInfo {
                    channel_id,
                    failing_node,
                    failure_code,
                    timestamp_ms: now,
                    amount_msat,
                    failure_count: 1,
                    exclusion_expiry_ms: now.saturating_add(window_ms),
                })
                .clone(),
        };

        if failure_code.is_node_failure() {
            if let Some(node) = failing_node {
                let expiry = info.exclusion_expiry_ms;
                self.nodes
                    .entry(node)
                    .and_modify(|e| *e = (*e).max(expiry))
                    .or_insert(expiry);
                debug!("Excluding node {} until {}", node.short_hex(), expiry);
            }
        }

        debug!(
            "Channel {} excluded for {} ms after {} (failure #{})",
            channel_id,
            info.exclusion_expiry_ms.saturating_sub(now),
            failure_code,
            info.failure_count
        );

        info
    }

    /// Whether the channel is inside an exclusion window
    pub fn is_channel_excluded(&self, channel_id: ShortChannelId) -> bool {
        let now = self.clock.now_millis();
        self.channels
            .get(&channel_id)
            .map(|info| info.is_active(now))
            .unwrap_or(false)
    }

    /// Whether the channel is excluded for an attempt of `amount_msat`.
    ///
    /// Only true if the recorded failure happened at an amount no larger than
    /// the one being tried now.
    pub fn is_channel_excluded_for_amount(
        &self,
        channel_id: ShortChannelId,
        amount_msat: u64,
    ) -> bool {
        let now = self.clock.now_millis();
        self.channels
            .get(&channel_id)
            .map(|info| info.is_active(now) && info.amount_msat <= amount_msat)
            .unwrap_or(false)
    }

    pub fn is_node_excluded(&self, node: &NodeId) -> bool {
        let now = self.clock.now_millis();
        self.nodes.get(node).map(|e| *e > now).unwrap_or(false)
    }

    /// Channels currently inside an exclusion window
    pub fn excluded_channels(&self) -> Vec<ShortChannelId> {
        let now = self.clock.now_millis();
        self.channels
            .iter()
            .filter(|e| e.is_active(now))
            .map(|e| *e.key())
            .collect()
    }

    /// Nodes currently inside an exclusion window
    pub fn excluded_nodes(&self) -> Vec<NodeId> {
        let now = self.clock.now_millis();
        self.nodes
            .iter()
            .filter(|e| *e.value() > now)
            .map(|e| *e.key())
            .collect()
    }

    /// Failure history for a channel, active or not
    pub fn failure_info(&self, channel_id: ShortChannelId) -> Option<FailedPathInfo> {
        self.channels.get(&channel_id).map(|info| info.clone())
    }

    /// Clear any exclusion of a channel that just carried a payment
    pub fn record_success(&self, channel_id: ShortChannelId) {
        if self.channels.remove(&channel_id).is_some() {
            debug!("Channel {} succeeded, exclusion cleared", channel_id);
        }
    }

    /// Drop entries whose window has passed. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;

        self.channels.retain(|_, info| {
            let active = info.is_active(now);
            if !active {
                removed += 1;
            }
            active
        });
        self.nodes.retain(|_, expiry| {
            let active = *expiry > now;
            if !active {
                removed += 1;
            }
            active
        });

        if removed > 0 {
            debug!("Pruned {} expired exclusions", removed);
        }
        removed
    }

    /// Number of tracked channel entries, expired or not
    pub fn tracked_channels(&self) -> usize {
        self.channels.len()
    }
}
