use crate::commands::{
    format_msat, format_output, print_info, print_row, print_success, print_warning,
};
use crate::config::OutputFormat;
use crate::scenario::Scenario;
use crate::simulation::{NetworkStats, SimulatedNetwork};
use anyhow::{bail, Result};
use colored::*;
use mpp_core::lightning::{
    GraphRouter, MppPartStatus, MppPayment, MppPaymentManager, MppPaymentStatus, MppStats,
    PaymentPreimage, PaymentRequest, SplitStrategy,
};
use mpp_core::{Clock, MppConfig, SystemClock};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Outcome of one simulated payment
#[derive(Debug, Clone, Serialize)]
pub struct SendReport {
    pub scenario: String,
    pub payment: MppPayment,
    pub stats: MppStats,
    pub network: NetworkStats,
}

/// Deterministic preimage so repeated runs of a scenario are comparable
pub fn derive_preimage(scenario: &str, amount_msat: u64) -> PaymentPreimage {
    let mut hasher = Sha256::new();
    hasher.update(b"mpp-sim preimage");
    hasher.update(scenario.as_bytes());
    hasher.update(amount_msat.to_be_bytes());
    PaymentPreimage::new(hasher.finalize().into())
}

fn derive_secret(preimage: &PaymentPreimage) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"mpp-sim secret");
    hasher.update(preimage.as_bytes());
    hasher.finalize().into()
}

pub async fn simulate(
    config: MppConfig,
    scenario: &Scenario,
    amount_msat: u64,
    strategy: Option<SplitStrategy>,
) -> Result<SendReport> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let network = Arc::new(SimulatedNetwork::new(scenario, &config, clock.clone()));
    let preimage = derive_preimage(&scenario.name, amount_msat);
    network.receiver().expect_payment(preimage);

    let router = GraphRouter::new(Arc::new(RwLock::new(scenario.graph())), scenario.sender);
    let manager = MppPaymentManager::new(
        config,
        scenario.sender,
        Arc::new(router),
        network.clone(),
        clock,
    );

    let mut request = PaymentRequest::new(
        preimage.payment_hash().as_bytes().to_vec(),
        derive_secret(&preimage).to_vec(),
        amount_msat,
        scenario.destination.as_bytes().to_vec(),
    );
    if let Some(strategy) = strategy {
        request = request.with_strategy(strategy);
    }

    info!(
        "Simulating {} msat from {} to {} over {} channels",
        amount_msat,
        scenario.sender.short_hex(),
        scenario.destination.short_hex(),
        scenario.channels.len()
    );
    let payment = manager.send_payment(request).await?;

    Ok(SendReport {
        scenario: scenario.name.clone(),
        payment,
        stats: manager.stats()?,
        network: network.stats(),
    })
}

pub async fn run(
    config: MppConfig,
    scenario: &Scenario,
    amount_msat: u64,
    strategy: Option<SplitStrategy>,
    format: &OutputFormat,
) -> Result<()> {
    let report = simulate(config, scenario, amount_msat, strategy).await?;
    let payment = &report.payment;

    if *format == OutputFormat::Json {
        format_output(&report, format, None)?;
    } else {
        print_text(&report);
    }

    if payment.status != MppPaymentStatus::Complete {
        bail!(
            "payment {} failed: {}",
            payment.payment_hash.short_hex(),
            payment.failure_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

fn print_text(report: &SendReport) {
    let payment = &report.payment;

    println!("\n{}", format!("Payment over {}", report.scenario).bold().green());
    println!("{}", "=".repeat(50));
    print_row("Payment hash", payment.payment_hash);
    print_row("Amount", format_msat(payment.total_amount_msat));
    if let Some(strategy) = payment.strategy {
        print_row("Strategy", strategy);
    }
    print_row("Fees", format_msat(payment.total_fees_msat));

    println!("\n{}", "Parts".bold());
    for part in &payment.parts {
        let status = match part.status {
            MppPartStatus::Settled => "settled".green(),
            MppPartStatus::Failed => "failed".red(),
            MppPartStatus::InFlight => "in flight".yellow(),
            MppPartStatus::Pending => "pending".normal(),
        };
        let via = part
            .route
            .as_ref()
            .and_then(|route| route.first_hop_channel())
            .map(|scid| scid.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<8} {:>20}  {:<10} retries {}  via {}",
            part.part_id,
            format_msat(part.amount_msat),
            status,
            part.retry_count,
            via.cyan()
        );
        if let Some(reason) = &part.failure_reason {
            println!("           {}", reason.dimmed());
        }
    }

    let network = &report.network;
    println!();
    print_info(&format!(
        "{} HTLCs forwarded, {} liquidity failures, {} flaky-node failures, {} receiver rejections",
        network.htlcs_forwarded,
        network.liquidity_failures,
        network.flaky_node_failures,
        network.receiver_rejections
    ));

    match payment.status {
        MppPaymentStatus::Complete => {
            let preimage = payment
                .preimage()
                .map(|p| p.to_hex())
                .unwrap_or_default();
            print_success(&format!("Payment complete, preimage {}", preimage));
        }
        _ => print_warning(&format!(
            "Payment {:?}: {}",
            payment.status,
            payment.failure_reason.as_deref().unwrap_or("no reason recorded")
        )),
    }
}
