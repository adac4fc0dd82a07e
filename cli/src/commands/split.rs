use crate::commands::{format_msat, format_output, print_info, print_row};
use crate::config::OutputFormat;
use crate::scenario::Scenario;
use anyhow::{Context, Result};
use colored::*;
use mpp_core::lightning::{
    optimal_part_count, ChannelLiquidity, LiquidityModel, PartAllocation, PaymentSplitter,
    SplitStrategy,
};
use mpp_core::{MppConfig, SystemClock};
use serde::Serialize;
use std::sync::Arc;

/// What the splitter would do for one amount, before anything is sent
#[derive(Debug, Clone, Serialize)]
pub struct SplitReport {
    pub scenario: String,
    pub amount_msat: u64,
    pub requested_strategy: SplitStrategy,
    pub strategy: SplitStrategy,
    pub optimal_part_count: usize,
    pub channels: Vec<ChannelLiquidity>,
    pub parts: Vec<PartAllocation>,
}

pub fn plan(
    config: &MppConfig,
    scenario: &Scenario,
    amount_msat: u64,
    strategy: Option<SplitStrategy>,
) -> Result<SplitReport> {
    let requested = strategy.unwrap_or(config.strategy);
    let model = LiquidityModel::new(config.liquidity.clone(), Arc::new(SystemClock));
    let channels = model.planning_snapshot(&scenario.local_channels());
    let limits = config.split_limits();

    let part_count = optimal_part_count(amount_msat, &channels, &limits)
        .context("No valid part count for this amount")?;
    let plan = PaymentSplitter::new(limits)
        .split(amount_msat, &channels, requested, model.attempt_stats())
        .with_context(|| format!("Failed to split {} msat", amount_msat))?;

    Ok(SplitReport {
        scenario: scenario.name.clone(),
        amount_msat,
        requested_strategy: requested,
        strategy: plan.strategy,
        optimal_part_count: part_count,
        channels,
        parts: plan.parts,
    })
}

pub fn run(
    config: &MppConfig,
    scenario: &Scenario,
    amount_msat: u64,
    strategy: Option<SplitStrategy>,
    format: &OutputFormat,
) -> Result<()> {
    let report = plan(config, scenario, amount_msat, strategy)?;

    if *format == OutputFormat::Json {
        return format_output(&report, format, None);
    }

    println!("\n{}", format!("Split plan for {}", report.scenario).bold().green());
    println!("{}", "=".repeat(50));
    print_row("Amount", format_msat(report.amount_msat));
    print_row("Strategy", &report.strategy);
    print_row("Optimal part count", report.optimal_part_count);
    if report.strategy != report.requested_strategy {
        print_info(&format!(
            "{} resolved to {}",
            report.requested_strategy, report.strategy
        ));
    }

    println!("\n{}", "Parts".bold());
    for part in &report.parts {
        let channel = part
            .preferred_channel_id
            .map(|scid| scid.to_string())
            .unwrap_or_else(|| "any".to_string());
        println!(
            "  #{:<3} {:>20}  via {}",
            part.index,
            format_msat(part.amount_msat),
            channel.cyan()
        );
    }
    Ok(())
}
