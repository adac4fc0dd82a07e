//! Split Invariant Property Tests
//!
//! Whatever the channel set looks like, a successful split must account for
//! every millisatoshi and stay inside the configured limits.
//!
//! Test Coverage:
//! - Part sum equals the payment amount for all five strategies
//! - Part count never exceeds `max_parts`; no empty parts
//! - No part exceeds `max_part_size_msat`, including under adaptive widening
//! - Preferred channels come from the candidate set
//! - `optimal_part_count` stays inside its clamp

use mpp_core::lightning::{
    optimal_part_count, AttemptStats, ChannelLiquidity, PaymentSplitter, ShortChannelId,
    SplitError, SplitLimits, SplitStrategy,
};
use proptest::prelude::*;
use std::collections::HashSet;

const LIMITS: SplitLimits = SplitLimits {
    min_part_size_msat: 10_000,
    max_part_size_msat: 10_000_000_000,
    max_parts: 8,
};

/// Part size cap well below what a single channel can carry
const CAPPED: SplitLimits = SplitLimits {
    min_part_size_msat: 10_000,
    max_part_size_msat: 500_000_000,
    max_parts: 8,
};

fn channels_strategy() -> impl Strategy<Value = Vec<ChannelLiquidity>> {
    prop::collection::vec((10_000u64..5_000_000_000, 0.0f64..=1.0), 1..10).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (available, rate))| {
                ChannelLiquidity::new(ShortChannelId(1 + i as u64), available, rate)
            })
            .collect()
    })
}

fn amount_within(channels: &[ChannelLiquidity], fraction: f64) -> u64 {
    let total: u64 = channels.iter().map(|c| c.available_msat).sum();
    ((total as f64 * fraction) as u64).max(LIMITS.min_part_size_msat)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_every_strategy_conserves_the_amount(
        channels in channels_strategy(),
        fraction in 0.0f64..=1.0,
    ) {
        let amount = amount_within(&channels, fraction);
        let total: u64 = channels.iter().map(|c| c.available_msat).sum();
        prop_assume!(amount <= total);

        let splitter = PaymentSplitter::new(LIMITS);
        let ids: HashSet<ShortChannelId> = channels.iter().map(|c| c.channel_id).collect();

        for strategy in SplitStrategy::ALL {
            let plan = splitter
                .split(amount, &channels, strategy, AttemptStats::default())
                .map_err(|e| TestCaseError::fail(format!("{}: {}", strategy, e)))?;

            prop_assert_eq!(plan.total_msat(), amount, "{} lost msat", strategy);
            prop_assert!(!plan.parts.is_empty());
            prop_assert!(
                plan.parts.len() <= LIMITS.max_parts,
                "{} used {} parts",
                strategy,
                plan.parts.len()
            );
            prop_assert_ne!(plan.strategy, SplitStrategy::Adaptive);

            for (i, part) in plan.parts.iter().enumerate() {
                prop_assert_eq!(part.index, i);
                prop_assert!(part.amount_msat > 0);
                if let Some(channel) = part.preferred_channel_id {
                    prop_assert!(ids.contains(&channel));
                }
            }
        }
    }

    #[test]
    fn prop_adaptive_under_failures_still_conserves(
        channels in channels_strategy(),
        fraction in 0.0f64..=1.0,
        failures in 0usize..20,
    ) {
        let amount = amount_within(&channels, fraction);
        let total: u64 = channels.iter().map(|c| c.available_msat).sum();
        prop_assume!(amount <= total);

        let stats = AttemptStats { samples: 20, failures };
        let plan = PaymentSplitter::new(LIMITS)
            .split(amount, &channels, SplitStrategy::Adaptive, stats)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;

        prop_assert_eq!(plan.total_msat(), amount);
        // High failure rates widen the part budget
        prop_assert!(plan.parts.len() <= LIMITS.max_parts * 2);
    }

    #[test]
    fn prop_parts_never_exceed_max_part_size(
        channels in channels_strategy(),
        fraction in 0.0f64..=1.0,
        failures in 0usize..20,
    ) {
        let amount = amount_within(&channels, fraction);
        let total: u64 = channels.iter().map(|c| c.available_msat).sum();
        prop_assume!(amount <= total);
        prop_assume!(amount <= CAPPED.max_part_size_msat * CAPPED.max_parts as u64);

        let splitter = PaymentSplitter::new(CAPPED);
        let stats = AttemptStats { samples: 20, failures };
        for strategy in SplitStrategy::ALL {
            let plan = splitter
                .split(amount, &channels, strategy, stats)
                .map_err(|e| TestCaseError::fail(format!("{}: {}", strategy, e)))?;

            prop_assert_eq!(plan.total_msat(), amount, "{} lost msat", strategy);
            for part in &plan.parts {
                prop_assert!(
                    part.amount_msat <= CAPPED.max_part_size_msat,
                    "{} produced {} msat over the {} cap",
                    strategy,
                    part.amount_msat,
                    CAPPED.max_part_size_msat
                );
            }
        }
    }

    #[test]
    fn prop_optimal_part_count_is_clamped(
        channels in channels_strategy(),
        amount in 10_000u64..50_000_000_000,
    ) {
        let count = optimal_part_count(amount, &channels, &LIMITS)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let lower = amount.div_ceil(LIMITS.max_part_size_msat).max(1) as usize;
        let upper = LIMITS.max_parts.min((amount / LIMITS.min_part_size_msat) as usize);
        prop_assert!(count >= lower && count <= upper, "{} outside [{}, {}]", count, lower, upper);
    }
}

#[test]
fn test_split_rejects_what_cannot_be_carried() {
    let splitter = PaymentSplitter::new(LIMITS);
    let channels = vec![ChannelLiquidity::new(ShortChannelId(1), 50_000, 0.9)];

    assert_eq!(
        splitter.split(0, &channels, SplitStrategy::Equal, AttemptStats::default()),
        Err(SplitError::ZeroAmount)
    );
    assert_eq!(
        splitter.split(60_000, &[], SplitStrategy::Equal, AttemptStats::default()),
        Err(SplitError::NoCandidateChannels)
    );
    assert_eq!(
        splitter.split(60_000, &channels, SplitStrategy::Hybrid, AttemptStats::default()),
        Err(SplitError::InsufficientLiquidity {
            needed: 60_000,
            available: 50_000,
        })
    );
}
