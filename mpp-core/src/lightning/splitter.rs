//! Payment splitting strategies
//!
//! A split turns `(amount, candidate channels, limits)` into an ordered list of
//! [`PartAllocation`]s. Every strategy is a pure function behind
//! [`SplitAlgorithm`]; [`PaymentSplitter`] validates the input, resolves the
//! adaptive strategy, caps the part count and checks that the parts add up to
//! the requested amount exactly.
//!
//! Amount arithmetic is integer only. Floating point is used to rank channels
//! and is converted to fixed-point weights before any amount is derived from it.

use super::liquidity::{AttemptStats, ChannelLiquidity};
use super::payment::ShortChannelId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Fraction of a channel's estimate the liquidity strategy will use, in percent
const LIQUIDITY_UTILIZATION_PCT: u128 = 80;

/// Cap on a hybrid part relative to its channel's estimate, in percent
const HYBRID_UTILIZATION_PCT: u128 = 85;

/// Per-part capacity target for the optimal part count, in percent of the
/// average channel estimate
const TARGET_CAPACITY_PCT: u128 = 80;

/// Success rate above which a single channel is trusted with the whole amount
const SINGLE_PART_SUCCESS_RATE: f64 = 0.9;

const WEIGHT_SCALE: f64 = 1_000_000.0;

/// Splitter errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SplitError {
    #[error("Cannot split a zero amount")]
    ZeroAmount,

    #[error("No candidate channels")]
    NoCandidateChannels,

    #[error("Insufficient liquidity: need {needed} msat, {available} msat available")]
    InsufficientLiquidity { needed: u64, available: u64 },

    #[error("No part count satisfies the limits (at least {min}, at most {max})")]
    NoValidPartCount { min: u64, max: u64 },

    #[error("Split produced {actual} msat for a {expected} msat payment")]
    SumMismatch { expected: u64, actual: u64 },
}

/// Result type for split operations
pub type SplitResult<T> = Result<T, SplitError>;

/// Strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    Equal,
    LiquidityBased,
    SuccessRateBased,
    Hybrid,
    #[default]
    Adaptive,
}

impl SplitStrategy {
    pub const ALL: [SplitStrategy; 5] = [
        SplitStrategy::Equal,
        SplitStrategy::LiquidityBased,
        SplitStrategy::SuccessRateBased,
        SplitStrategy::Hybrid,
        SplitStrategy::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SplitStrategy::Equal => "equal",
            SplitStrategy::LiquidityBased => "liquidity_based",
            SplitStrategy::SuccessRateBased => "success_rate_based",
            SplitStrategy::Hybrid => "hybrid",
            SplitStrategy::Adaptive => "adaptive",
        }
    }

    /// Algorithm implementing this strategy
    pub fn algorithm(self, stats: AttemptStats) -> Box<dyn SplitAlgorithm> {
        match self {
            SplitStrategy::Equal => Box::new(Equal),
            SplitStrategy::LiquidityBased => Box::new(LiquidityBased),
            SplitStrategy::SuccessRateBased => Box::new(SuccessRateBased),
            SplitStrategy::Hybrid => Box::new(Hybrid),
            SplitStrategy::Adaptive => Box::new(Adaptive { stats }),
        }
    }
}

impl fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        SplitStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| format!("unknown split strategy '{}'", s))
    }
}

/// Policy limits for a split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitLimits {
    pub min_part_size_msat: u64,
    pub max_part_size_msat: u64,
    pub max_parts: usize,
}

/// One part of a planned split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartAllocation {
    pub index: usize,
    pub amount_msat: u64,
    pub preferred_channel_id: Option<ShortChannelId>,
}

/// Output of [`PaymentSplitter::split`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    /// Concrete strategy that produced the parts (never `Adaptive`)
    pub strategy: SplitStrategy,
    pub parts: Vec<PartAllocation>,
}

impl SplitPlan {
    pub fn total_msat(&self) -> u64 {
        self.parts.iter().map(|p| p.amount_msat).sum()
    }
}

/// A split strategy
pub trait SplitAlgorithm: Send + Sync {
    fn strategy(&self) -> SplitStrategy;

    /// Allocate `amount_msat` over `channels`. The result always sums to
    /// `amount_msat` when `amount_msat > 0`.
    fn split(
        &self,
        amount_msat: u64,
        channels: &[ChannelLiquidity],
        limits: &SplitLimits,
    ) -> Vec<PartAllocation>;
}

/// `min(channels, max_parts)` equal shares, remainder on the first part
#[derive(Debug, Clone, Copy, Default)]
pub struct Equal;

impl SplitAlgorithm for Equal {
    fn strategy(&self) -> SplitStrategy {
        SplitStrategy::Equal
    }

    fn split(
        &self,
        amount_msat: u64,
        channels: &[ChannelLiquidity],
        limits: &SplitLimits,
    ) -> Vec<PartAllocation> {
        let sorted = sorted_by_available(channels);
        let count = sorted
            .len()
            .max(min_parts_for(amount_msat, limits))
            .min(limits.max_parts)
            .max(1) as u64;
        let share = amount_msat / count;
        let remainder = amount_msat % count;

        let parts = (0..count as usize)
            .map(|i| PartAllocation {
                index: i,
                amount_msat: if i == 0 {
                    (share + remainder).min(limits.max_part_size_msat)
                } else {
                    share
                },
                preferred_channel_id: sorted.get(i).map(|c| c.channel_id),
            })
            .collect();
        finalize(parts, amount_msat, &sorted, limits)
    }
}

/// Greedy fill of the largest channels up to 80% of their estimate
#[derive(Debug, Clone, Copy, Default)]
pub struct LiquidityBased;

impl SplitAlgorithm for LiquidityBased {
    fn strategy(&self) -> SplitStrategy {
        SplitStrategy::LiquidityBased
    }

    fn split(
        &self,
        amount_msat: u64,
        channels: &[ChannelLiquidity],
        limits: &SplitLimits,
    ) -> Vec<PartAllocation> {
        let sorted = sorted_by_available(channels);
        let mut parts = Vec::new();
        let mut remaining = amount_msat;

        for channel in &sorted {
            if parts.len() >= limits.max_parts || remaining == 0 {
                break;
            }
            let usable = percent_of(channel.available_msat, LIQUIDITY_UTILIZATION_PCT);
            let amount = remaining.min(usable).min(limits.max_part_size_msat);
            if amount == 0 || amount < limits.min_part_size_msat {
                continue;
            }
            parts.push(PartAllocation {
                index: parts.len(),
                amount_msat: amount,
                preferred_channel_id: Some(channel.channel_id),
            });
            remaining -= amount;
        }

        finalize(parts, amount_msat, &sorted, limits)
    }
}

/// Proportional to `success_rate × available_msat`
#[derive(Debug, Clone, Copy, Default)]
pub struct SuccessRateBased;

impl SplitAlgorithm for SuccessRateBased {
    fn strategy(&self) -> SplitStrategy {
        SplitStrategy::SuccessRateBased
    }

    fn split(
        &self,
        amount_msat: u64,
        channels: &[ChannelLiquidity],
        limits: &SplitLimits,
    ) -> Vec<PartAllocation> {
        let ranked = top_by_score(channels, limits.max_parts, |c| {
            c.success_rate * c.available_msat as f64
        });
        let weights = fixed_point_weights(&ranked);
        let total_weight: u128 = weights.iter().sum();

        let mut parts = Vec::new();
        let mut remaining = amount_msat;
        for ((channel, _), weight) in ranked.iter().zip(&weights) {
            if remaining == 0 || remaining < limits.min_part_size_msat {
                break;
            }
            let share = proportional(amount_msat, *weight, total_weight);
            let amount = share
                .max(limits.min_part_size_msat)
                .min(limits.max_part_size_msat)
                .min(remaining);
            if amount == 0 {
                continue;
            }
            parts.push(PartAllocation {
                index: parts.len(),
                amount_msat: amount,
                preferred_channel_id: Some(channel.channel_id),
            });
            remaining -= amount;
        }

        let ordered: Vec<ChannelLiquidity> = ranked.into_iter().map(|(c, _)| c).collect();
        finalize(parts, amount_msat, &ordered, limits)
    }
}

/// Proportional to `sqrt(available_msat) × success_rate²`, each part capped at
/// 85% of its channel's estimate
#[derive(Debug, Clone, Copy, Default)]
pub struct Hybrid;

impl SplitAlgorithm for Hybrid {
    fn strategy(&self) -> SplitStrategy {
        SplitStrategy::Hybrid
    }

    fn split(
        &self,
        amount_msat: u64,
        channels: &[ChannelLiquidity],
        limits: &SplitLimits,
    ) -> Vec<PartAllocation> {
        let ranked = top_by_score(channels, limits.max_parts, |c| {
            (c.available_msat as f64).sqrt() * c.success_rate * c.success_rate
        });
        let weights = fixed_point_weights(&ranked);
        let total_weight: u128 = weights.iter().sum();

        // (allocation, cap) pairs so the top-up pass knows the headroom
        let mut planned: Vec<(PartAllocation, u64)> = Vec::new();
        let mut remaining = amount_msat;
        for ((channel, _), weight) in ranked.iter().zip(&weights) {
            if remaining == 0 {
                break;
            }
            let cap = percent_of(channel.available_msat, HYBRID_UTILIZATION_PCT)
                .min(limits.max_part_size_msat);
            let share = proportional(amount_msat, *weight, total_weight);
            let amount = share.min(cap).min(remaining);
            if amount == 0 || amount < limits.min_part_size_msat {
                continue;
            }
            planned.push((
                PartAllocation {
                    index: planned.len(),
                    amount_msat: amount,
                    preferred_channel_id: Some(channel.channel_id),
                },
                cap,
            ));
            remaining -= amount;
        }

        // Top up parts that still have headroom under their cap
        for (part, cap) in planned.iter_mut() {
            if remaining == 0 {
                break;
            }
            let extra = cap.saturating_sub(part.amount_msat).min(remaining);
            part.amount_msat += extra;
            remaining -= extra;
        }

        let parts = planned.into_iter().map(|(part, _)| part).collect();
        let ordered: Vec<ChannelLiquidity> = ranked.into_iter().map(|(c, _)| c).collect();
        finalize(parts, amount_msat, &ordered, limits)
    }
}

/// Picks a concrete strategy from the recent failure rate
#[derive(Debug, Clone, Copy, Default)]
pub struct Adaptive {
    pub stats: AttemptStats,
}

impl Adaptive {
    /// Concrete strategy and adjusted limits for the current conditions
    pub fn resolve(&self, limits: &SplitLimits) -> (SplitStrategy, SplitLimits) {
        let failure_rate = self.stats.failure_rate();
        if failure_rate > 0.5 {
            let adjusted = SplitLimits {
                max_parts: limits.max_parts.saturating_mul(2),
                min_part_size_msat: (limits.min_part_size_msat / 2).max(1),
                ..*limits
            };
            (SplitStrategy::LiquidityBased, adjusted)
        } else if failure_rate < 0.1 && self.stats.samples >= 5 {
            (SplitStrategy::SuccessRateBased, *limits)
        } else {
            (SplitStrategy::Hybrid, *limits)
        }
    }
}

impl SplitAlgorithm for Adaptive {
    fn strategy(&self) -> SplitStrategy {
        SplitStrategy::Adaptive
    }

    fn split(
        &self,
        amount_msat: u64,
        channels: &[ChannelLiquidity],
        limits: &SplitLimits,
    ) -> Vec<PartAllocation> {
        let (strategy, adjusted) = self.resolve(limits);
        strategy.algorithm(self.stats).split(amount_msat, channels, &adjusted)
    }
}

/// Validating front end over the strategies
#[derive(Debug, Clone, Copy)]
pub struct PaymentSplitter {
    limits: SplitLimits,
}

impl PaymentSplitter {
    pub fn new(limits: SplitLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SplitLimits {
        &self.limits
    }

    /// Split `amount_msat` over `channels`.
    ///
    /// `stats` is only consulted by the adaptive strategy.
    pub fn split(
        &self,
        amount_msat: u64,
        channels: &[ChannelLiquidity],
        strategy: SplitStrategy,
        stats: AttemptStats,
    ) -> SplitResult<SplitPlan> {
        if amount_msat == 0 {
            return Err(SplitError::ZeroAmount);
        }
        if channels.is_empty() {
            return Err(SplitError::NoCandidateChannels);
        }
        let available: u128 = channels.iter().map(|c| c.available_msat as u128).sum();
        if available < amount_msat as u128 {
            return Err(SplitError::InsufficientLiquidity {
                needed: amount_msat,
                available: available.min(u64::MAX as u128) as u64,
            });
        }

        let (concrete, mut limits) = match strategy {
            SplitStrategy::Adaptive => Adaptive { stats }.resolve(&self.limits),
            other => (other, self.limits),
        };

        let part_count = optimal_part_count(amount_msat, channels, &limits)?;
        limits.max_parts = limits.max_parts.min(part_count);

        let parts = concrete.algorithm(stats).split(amount_msat, channels, &limits);
        let total: u64 = parts.iter().map(|p| p.amount_msat).sum();
        if total != amount_msat {
            return Err(SplitError::SumMismatch {
                expected: amount_msat,
                actual: total,
            });
        }

        debug!(
            "Split {} msat into {} parts with {} (requested {})",
            amount_msat,
            parts.len(),
            concrete,
            strategy
        );

        Ok(SplitPlan {
            strategy: concrete,
            parts,
        })
    }
}

/// Number of parts that balances reliability against liquidity coverage.
///
/// One part if the best channel can carry everything and rarely fails.
/// Otherwise the larger of the fewest channels whose estimates cover the amount
/// and the count implied by using 80% of the average estimate per part. The
/// result is clamped into `[⌈amount/max_part⌉, ⌊amount/min_part⌋] ∩ [1, max_parts]`.
pub fn optimal_part_count(
    amount_msat: u64,
    channels: &[ChannelLiquidity],
    limits: &SplitLimits,
) -> SplitResult<usize> {
    if channels.is_empty() {
        return Err(SplitError::NoCandidateChannels);
    }
    let sorted = sorted_by_available(channels);

    let lower = amount_msat.div_ceil(limits.max_part_size_msat.max(1)).max(1);
    let upper = (limits.max_parts as u64).min(amount_msat / limits.min_part_size_msat.max(1));
    if lower > upper {
        return Err(SplitError::NoValidPartCount {
            min: lower,
            max: upper,
        });
    }

    let best = &sorted[0];
    let estimate = if best.available_msat >= amount_msat
        && best.success_rate > SINGLE_PART_SUCCESS_RATE
    {
        1
    } else {
        let mut cumulative = 0u128;
        let mut covering = sorted.len() as u64;
        for (i, channel) in sorted.iter().enumerate() {
            cumulative += channel.available_msat as u128;
            if cumulative >= amount_msat as u128 {
                covering = i as u64 + 1;
                break;
            }
        }

        let total: u128 = sorted.iter().map(|c| c.available_msat as u128).sum();
        let target = total / sorted.len() as u128 * TARGET_CAPACITY_PCT / 100;
        let by_capacity = if target == 0 {
            sorted.len() as u64
        } else {
            (amount_msat as u128).div_ceil(target).min(u64::MAX as u128) as u64
        };

        covering.max(by_capacity)
    };

    Ok(estimate.clamp(lower, upper) as usize)
}

fn percent_of(amount_msat: u64, pct: u128) -> u64 {
    (amount_msat as u128 * pct / 100) as u64
}

fn proportional(amount_msat: u64, weight: u128, total_weight: u128) -> u64 {
    if total_weight == 0 {
        return 0;
    }
    (amount_msat as u128 * weight / total_weight) as u64
}

fn sorted_by_available(channels: &[ChannelLiquidity]) -> Vec<ChannelLiquidity> {
    let mut sorted = channels.to_vec();
    sorted.sort_by(|a, b| {
        b.available_msat
            .cmp(&a.available_msat)
            .then_with(|| a.channel_id.cmp(&b.channel_id))
    });
    sorted
}

/// Channels ranked by a score, best first, at most `limit` of them
fn top_by_score(
    channels: &[ChannelLiquidity],
    limit: usize,
    score: impl Fn(&ChannelLiquidity) -> f64,
) -> Vec<(ChannelLiquidity, f64)> {
    let mut scored: Vec<(ChannelLiquidity, f64)> = channels
        .iter()
        .map(|c| {
            let s = score(c);
            (c.clone(), if s.is_finite() && s > 0.0 { s } else { 0.0 })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| b.0.available_msat.cmp(&a.0.available_msat))
            .then_with(|| a.0.channel_id.cmp(&b.0.channel_id))
    });
    scored.truncate(limit.max(1));
    scored
}

/// Scores to integer weights; all-zero scores fall back to equal weights
fn fixed_point_weights(ranked: &[(ChannelLiquidity, f64)]) -> Vec<u128> {
    let max = ranked.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max);
    let weights: Vec<u128> = if max > 0.0 {
        ranked
            .iter()
            .map(|(_, s)| (s / max * WEIGHT_SCALE).round() as u128)
            .collect()
    } else {
        vec![0; ranked.len()]
    };
    if weights.iter().all(|w| *w == 0) {
        vec![1; ranked.len()]
    } else {
        weights
    }
}

/// Fewest parts that keep every part at or below `max_part_size_msat`
fn min_parts_for(amount_msat: u64, limits: &SplitLimits) -> usize {
    amount_msat.div_ceil(limits.max_part_size_msat.max(1)) as usize
}

/// Drop empty parts, spread any shortfall and renumber.
///
/// The shortfall first tops existing parts up to `max_part_size_msat`, in
/// order, then opens new parts while `max_parts` allows. Only when the limits
/// cannot hold the amount does the rest land on the first part.
fn finalize(
    parts: Vec<PartAllocation>,
    amount_msat: u64,
    ordered_channels: &[ChannelLiquidity],
    limits: &SplitLimits,
) -> Vec<PartAllocation> {
    if amount_msat == 0 {
        return Vec::new();
    }
    let mut parts: Vec<PartAllocation> = parts.into_iter().filter(|p| p.amount_msat > 0).collect();
    let cap = limits.max_part_size_msat.max(1);

    let allocated: u64 = parts.iter().map(|p| p.amount_msat).sum();
    let mut shortfall = amount_msat.saturating_sub(allocated);

    for part in parts.iter_mut() {
        if shortfall == 0 {
            break;
        }
        let extra = cap.saturating_sub(part.amount_msat).min(shortfall);
        part.amount_msat += extra;
        shortfall -= extra;
    }

    while shortfall > 0 && parts.len() < limits.max_parts.max(1) {
        let amount = shortfall.min(cap);
        let preferred_channel_id = if ordered_channels.is_empty() {
            None
        } else {
            Some(ordered_channels[parts.len() % ordered_channels.len()].channel_id)
        };
        parts.push(PartAllocation {
            index: parts.len(),
            amount_msat: amount,
            preferred_channel_id,
        });
        shortfall -= amount;
    }

    if shortfall > 0 {
        if let Some(first) = parts.first_mut() {
            first.amount_msat += shortfall;
        }
    }
    for (i, part) in parts.iter_mut().enumerate() {
        part.index = i;
    }
    parts
}
