//! Per-channel liquidity estimates
//!
//! Three pieces of state live here:
//!
//! * the authoritative [`ChannelLiquidity`] table: an upper bound on what each
//!   channel can carry plus an exponentially weighted success rate;
//! * advisory [`LiquidityHint`] intervals that decay back to `[0, capacity]`
//!   as they age and are pruned after `hint_max_age_secs`;
//! * a short attempt history feeding the adaptive split strategy.
//!
//! Table updates go through the `DashMap` entry API so each one is a single
//! read-modify-write on that channel. Concurrent parts may race on the same
//! channel; the last writer wins for the success rate and the available
//! estimate only ever shrinks on failure.

use super::payment::ShortChannelId;
use super::router::GraphChannel;
use crate::config::LiquidityConfig;
use crate::util::clock::Clock;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Liquidity estimate for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLiquidity {
    pub channel_id: ShortChannelId,
    /// Upper-bound estimate of what the channel can carry
    pub available_msat: u64,
    /// Moving average of outcomes, in [0, 1]
    pub success_rate: f64,
    pub last_successful_amount_msat: Option<u64>,
    pub last_failed_amount_msat: Option<u64>,
}

impl ChannelLiquidity {
    pub fn new(channel_id: ShortChannelId, available_msat: u64, success_rate: f64) -> Self {
        Self {
            channel_id,
            available_msat,
            success_rate,
            last_successful_amount_msat: None,
            last_failed_amount_msat: None,
        }
    }
}

/// Confidence interval on a channel's true liquidity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityHint {
    pub channel_id: ShortChannelId,
    pub min_liquidity_msat: u64,
    pub max_liquidity_msat: u64,
    pub capacity_msat: u64,
    pub last_update_ms: u64,
}

/// Outcome counts over the adaptive window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptStats {
    pub samples: usize,
    pub failures: usize,
}

impl AttemptStats {
    pub fn failure_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.failures as f64 / self.samples as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptRecord {
    timestamp_ms: u64,
    success: bool,
}

/// Liquidity table, hints and attempt history
pub struct LiquidityModel {
    channels: DashMap<ShortChannelId, ChannelLiquidity>,
    hints: DashMap<ShortChannelId, LiquidityHint>,
    capacities: DashMap<ShortChannelId, u64>,
    history: Mutex<VecDeque<AttemptRecord>>,
    config: LiquidityConfig,
    clock: Arc<dyn Clock>,
}

impl LiquidityModel {
    pub fn new(config: LiquidityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            channels: DashMap::new(),
            hints: DashMap::new(),
            capacities: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            config,
            clock,
        }
    }

    /// Register a channel from the graph, or tighten an existing entry to the
    /// channel's HTLC limit. Returns the current estimate.
    pub fn observe_channel(&self, channel: &GraphChannel) -> ChannelLiquidity {
        let limit = channel.max_htlc_msat();
        self.capacities
            .insert(channel.short_channel_id, channel.capacity_sat.saturating_mul(1000));

        let mut entry = self
            .channels
            .entry(channel.short_channel_id)
            .or_insert_with(|| {
                ChannelLiquidity::new(
                    channel.short_channel_id,
                    limit,
                    self.config.initial_success_rate,
                )
            });
        entry.available_msat = entry.available_msat.min(limit);
        entry.clone()
    }

    /// Current estimates for a set of channels, registering unseen ones
    pub fn snapshot(&self, channels: &[GraphChannel]) -> Vec<ChannelLiquidity> {
        channels.iter().map(|c| self.observe_channel(c)).collect()
    }

    /// Like [`snapshot`](Self::snapshot), with each estimate also held under
    /// the upper bound of its decayed hint. This is what a split should plan on.
    pub fn planning_snapshot(&self, channels: &[GraphChannel]) -> Vec<ChannelLiquidity> {
        channels
            .iter()
            .map(|channel| {
                let mut estimate = self.observe_channel(channel);
                if let Some(hint) = self.decayed_hint(channel.short_channel_id) {
                    estimate.available_msat = estimate.available_msat.min(hint.max_liquidity_msat);
                }
                estimate
            })
            .collect()
    }

    pub fn get(&self, channel_id: ShortChannelId) -> Option<ChannelLiquidity> {
        self.channels.get(&channel_id).map(|entry| entry.clone())
    }

    pub fn tracked_channels(&self) -> usize {
        self.channels.len()
    }

    fn entry_or_unknown(
        &self,
        channel_id: ShortChannelId,
    ) -> dashmap::mapref::one::RefMut<'_, ShortChannelId, ChannelLiquidity> {
        self.channels.entry(channel_id).or_insert_with(|| {
            ChannelLiquidity::new(channel_id, u64::MAX, self.config.initial_success_rate)
        })
    }

    /// A part of `amount_msat` settled over `channel_id`
    pub fn record_success(&self, channel_id: ShortChannelId, amount_msat: u64) {
        let alpha = self.config.ema_alpha;
        {
            let mut entry = self.entry_or_unknown(channel_id);
            entry.success_rate = alpha + (1.0 - alpha) * entry.success_rate;
            entry.last_successful_amount_msat = Some(amount_msat);
            debug!(
                "Liquidity {}: success at {} msat, rate {:.3}",
                channel_id, amount_msat, entry.success_rate
            );
        }

        self.update_hint(channel_id, |hint| {
            hint.min_liquidity_msat = hint.min_liquidity_msat.max(amount_msat);
            hint.max_liquidity_msat = hint.max_liquidity_msat.max(hint.min_liquidity_msat);
        });
        self.record_attempt(true);
    }

    /// A part of `amount_msat` failed over `channel_id`
    pub fn record_failure(&self, channel_id: ShortChannelId, amount_msat: u64) {
        let alpha = self.config.ema_alpha;
        let ceiling = amount_msat.saturating_sub(1);
        {
            let mut entry = self.entry_or_unknown(channel_id);
            entry.success_rate *= 1.0 - alpha;
            entry.available_msat = entry.available_msat.min(ceiling);
            entry.last_failed_amount_msat = Some(amount_msat);
            debug!(
                "Liquidity {}: failure at {} msat, available now {}, rate {:.3}",
                channel_id, amount_msat, entry.available_msat, entry.success_rate
            );
        }

        self.update_hint(channel_id, |hint| {
            hint.max_liquidity_msat = hint.max_liquidity_msat.min(ceiling);
            hint.min_liquidity_msat = hint.min_liquidity_msat.min(hint.max_liquidity_msat);
        });
        self.record_attempt(false);
    }

    /// Narrow the hint after error analysis suggested a smaller amount
    pub fn apply_resplit_suggestion(&self, channel_id: ShortChannelId, suggested_amount_msat: u64) {
        self.update_hint(channel_id, |hint| {
            hint.max_liquidity_msat = hint.max_liquidity_msat.min(suggested_amount_msat);
            hint.min_liquidity_msat = hint.min_liquidity_msat.min(hint.max_liquidity_msat);
        });
    }

    fn update_hint(&self, channel_id: ShortChannelId, update: impl FnOnce(&mut LiquidityHint)) {
        let now = self.clock.now_millis();
        let capacity = self
            .capacities
            .get(&channel_id)
            .map(|c| *c)
            .unwrap_or(u64::MAX);

        let mut hint = self.hints.entry(channel_id).or_insert_with(|| LiquidityHint {
            channel_id,
            min_liquidity_msat: 0,
            max_liquidity_msat: capacity,
            capacity_msat: capacity,
            last_update_ms: now,
        });
        update(&mut hint);
        hint.last_update_ms = now;
    }

    /// Hint as recorded, without decay
    pub fn hint(&self, channel_id: ShortChannelId) -> Option<LiquidityHint> {
        self.hints.get(&channel_id).map(|h| h.clone())
    }

    /// Hint widened linearly toward `[0, capacity]` by its age.
    ///
    /// A hint at `hint_max_age_secs` or older carries no information.
    pub fn decayed_hint(&self, channel_id: ShortChannelId) -> Option<LiquidityHint> {
        let hint = self.hint(channel_id)?;
        let max_age_ms = self.config.hint_max_age_secs.saturating_mul(1000) as u128;
        let age_ms = self.clock.now_millis().saturating_sub(hint.last_update_ms) as u128;

        if max_age_ms == 0 || age_ms >= max_age_ms {
            return Some(LiquidityHint {
                min_liquidity_msat: 0,
                max_liquidity_msat: hint.capacity_msat,
                ..hint
            });
        }

        let remaining = max_age_ms - age_ms;
        let min = hint.min_liquidity_msat as u128 * remaining / max_age_ms;
        let slack = hint.capacity_msat.saturating_sub(hint.max_liquidity_msat) as u128;
        let max = hint.max_liquidity_msat as u128 + slack * age_ms / max_age_ms;

        Some(LiquidityHint {
            min_liquidity_msat: min as u64,
            max_liquidity_msat: max.min(u64::MAX as u128) as u64,
            ..hint
        })
    }

    /// Remove hints older than `hint_max_age_secs`. Returns how many went.
    pub fn prune_old_hints(&self) -> usize {
        let now = self.clock.now_millis();
        let max_age_ms = self.config.hint_max_age_secs.saturating_mul(1000);
        let mut removed = 0;
        self.hints.retain(|_, hint| {
            let fresh = now.saturating_sub(hint.last_update_ms) < max_age_ms;
            if !fresh {
                removed += 1;
            }
            fresh
        });
        if removed > 0 {
            debug!("Pruned {} stale liquidity hints", removed);
        }
        removed
    }

    fn record_attempt(&self, success: bool) {
        let now = self.clock.now_millis();
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(AttemptRecord {
            timestamp_ms: now,
            success,
        });
        self.trim_history(&mut history, now);
    }

    fn trim_history(&self, history: &mut VecDeque<AttemptRecord>, now: u64) {
        let window_ms = self.config.adaptive_window_secs.saturating_mul(1000);
        while let Some(front) = history.front() {
            if now.saturating_sub(front.timestamp_ms) > window_ms {
                history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Attempt outcomes inside the adaptive window
    pub fn attempt_stats(&self) -> AttemptStats {
        let now = self.clock.now_millis();
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        self.trim_history(&mut history, now);
        AttemptStats {
            samples: history.len(),
            failures: history.iter().filter(|r| !r.success).count(),
        }
    }
}
