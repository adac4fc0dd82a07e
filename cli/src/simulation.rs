//! In-memory network for the simulator
//!
//! [`SimulatedNetwork`] plays every node except the sender. Forwarding locks
//! the hidden liquidity of each hop; flaky relays refuse to forward. Parts
//! that reach the destination go through a real [`MppPaymentCollector`], and
//! a held part only learns the preimage once the collector fulfils the whole
//! set.

use crate::scenario::Scenario;
use async_trait::async_trait;
use mpp_core::lightning::{
    DispatchRequest, FailureCode, FinalHopPayload, HtlcAction, HtlcDispatcher, HtlcId,
    IncomingHtlc, MppPaymentCollector, NodeId, PartFailure, PaymentHash, PaymentPreimage, Route,
    ShortChannelId,
};
use mpp_core::{Clock, MppConfig};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Extra wait on top of the MPP timeout before a held part sweeps
const TIMEOUT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
enum Resolution {
    Fulfilled,
    Failed(FailureCode),
}

/// Counters reported after a simulated send
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkStats {
    pub htlcs_forwarded: usize,
    pub liquidity_failures: usize,
    pub flaky_node_failures: usize,
    pub receiver_rejections: usize,
}

/// Destination node: decodes payloads and answers per the collector
pub struct SimulatedReceiver {
    collector: MppPaymentCollector,
    preimages: Mutex<HashMap<PaymentHash, PaymentPreimage>>,
    held: Mutex<HashMap<HtlcId, oneshot::Sender<Resolution>>>,
    next_htlc_id: AtomicU64,
    hold_timeout: Duration,
}

impl SimulatedReceiver {
    pub fn new(config: &MppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            collector: MppPaymentCollector::from_config(config, clock),
            preimages: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            next_htlc_id: AtomicU64::new(0),
            hold_timeout: Duration::from_secs(config.mpp_timeout_secs) + TIMEOUT_GRACE,
        }
    }

    /// Make the receiver willing to settle payments for this preimage
    pub fn expect_payment(&self, preimage: PaymentPreimage) {
        if let Ok(mut preimages) = self.preimages.lock() {
            preimages.insert(preimage.payment_hash(), preimage);
        }
    }

    fn preimage(&self, payment_hash: &PaymentHash) -> Option<PaymentPreimage> {
        self.preimages.lock().ok()?.get(payment_hash).copied()
    }

    pub async fn receive(
        &self,
        request: &DispatchRequest,
        cltv_expiry: u32,
    ) -> Result<PaymentPreimage, PartFailure> {
        let Some(preimage) = self.preimage(&request.payment_hash) else {
            return Err(PartFailure::new(
                FailureCode::IncorrectOrUnknownPaymentDetails,
                "unknown payment hash",
            ));
        };
        let payload = FinalHopPayload::decode(&request.final_hop_payload).map_err(|e| {
            PartFailure::new(FailureCode::InvalidOnionPayload, format!("bad final payload: {}", e))
        })?;

        let htlc_id = HtlcId(self.next_htlc_id.fetch_add(1, Ordering::Relaxed));
        let htlc =
            IncomingHtlc::from_final_hop(htlc_id, request.payment_hash, cltv_expiry, &payload);

        // Held senders are registered under the same lock that resolves them,
        // so a fulfil can never race past a part that is about to wait.
        let waiter = {
            let mut held = self.held.lock().map_err(|_| internal_failure())?;
            let action = self
                .collector
                .process_incoming_htlc(htlc)
                .map_err(|_| internal_failure())?;
            match action {
                HtlcAction::Hold { received_msat, remaining_msat } => {
                    debug!(
                        "Receiver holding {} ({} msat in, {} to go)",
                        htlc_id.0, received_msat, remaining_msat
                    );
                    let (tx, rx) = oneshot::channel();
                    held.insert(htlc_id, tx);
                    rx
                }
                HtlcAction::Fulfill { htlc_ids, received_msat } => {
                    info!(
                        "Receiver fulfilled {} with {} msat over {} HTLCs",
                        request.payment_hash.short_hex(),
                        received_msat,
                        htlc_ids.len()
                    );
                    resolve(&mut held, &htlc_ids, htlc_id, || Resolution::Fulfilled);
                    return Ok(preimage);
                }
                HtlcAction::Reject { reason, fail_back } => {
                    warn!("Receiver rejected HTLC {}: {:?}", htlc_id.0, reason);
                    let code = reason.failure_code();
                    resolve(&mut held, &fail_back, htlc_id, || Resolution::Failed(code));
                    return Err(PartFailure::new(code, format!("receiver rejected: {:?}", reason)));
                }
            }
        };

        match tokio::time::timeout(self.hold_timeout, waiter).await {
            Ok(Ok(Resolution::Fulfilled)) => Ok(preimage),
            Ok(Ok(Resolution::Failed(code))) => {
                Err(PartFailure::new(code, "receiver failed the held HTLC"))
            }
            Ok(Err(_)) => Err(internal_failure()),
            Err(_) => {
                let mut held = self.held.lock().map_err(|_| internal_failure())?;
                let expired = self.collector.check_timeouts().map_err(|_| internal_failure())?;
                resolve(&mut held, &expired, htlc_id, || {
                    Resolution::Failed(FailureCode::MppTimeout)
                });
                held.remove(&htlc_id);
                Err(PartFailure::new(FailureCode::MppTimeout, "parts did not arrive in time"))
            }
        }
    }
}

/// Wake every held HTLC in `ids` except the caller's own
fn resolve(
    held: &mut HashMap<HtlcId, oneshot::Sender<Resolution>>,
    ids: &[HtlcId],
    own: HtlcId,
    resolution: impl Fn() -> Resolution,
) {
    for id in ids.iter().filter(|id| **id != own) {
        if let Some(tx) = held.remove(id) {
            let _ = tx.send(resolution());
        }
    }
}

fn internal_failure() -> PartFailure {
    PartFailure::new(FailureCode::TemporaryNodeFailure, "receiver state unavailable")
}

/// Every node other than the sender
pub struct SimulatedNetwork {
    balances: Mutex<HashMap<ShortChannelId, u64>>,
    flaky_nodes: HashSet<NodeId>,
    hop_latency: Duration,
    receiver: SimulatedReceiver,
    forwarded: AtomicUsize,
    liquidity_failures: AtomicUsize,
    flaky_failures: AtomicUsize,
    rejections: AtomicUsize,
}

impl SimulatedNetwork {
    pub fn new(scenario: &Scenario, config: &MppConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            balances: Mutex::new(scenario.hidden_liquidity()),
            flaky_nodes: scenario.flaky_nodes.iter().copied().collect(),
            hop_latency: Duration::from_millis(scenario.hop_latency_ms),
            receiver: SimulatedReceiver::new(config, clock),
            forwarded: AtomicUsize::new(0),
            liquidity_failures: AtomicUsize::new(0),
            flaky_failures: AtomicUsize::new(0),
            rejections: AtomicUsize::new(0),
        }
    }

    pub fn receiver(&self) -> &SimulatedReceiver {
        &self.receiver
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            htlcs_forwarded: self.forwarded.load(Ordering::Relaxed),
            liquidity_failures: self.liquidity_failures.load(Ordering::Relaxed),
            flaky_node_failures: self.flaky_failures.load(Ordering::Relaxed),
            receiver_rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    pub fn balance(&self, channel: ShortChannelId) -> Option<u64> {
        self.balances.lock().ok()?.get(&channel).copied()
    }

    /// Check every hop and reserve its amount, all or nothing
    fn lock_liquidity(&self, route: &Route) -> Result<(), PartFailure> {
        let last = route.hops.len().saturating_sub(1);
        for (i, hop) in route.hops.iter().enumerate() {
            if i < last && self.flaky_nodes.contains(&hop.node_id) {
                self.flaky_failures.fetch_add(1, Ordering::Relaxed);
                return Err(PartFailure::new(
                    FailureCode::TemporaryNodeFailure,
                    format!("node {} refused to forward", hop.node_id.short_hex()),
                )
                .at_node(hop.node_id)
                .at_channel(route.hops[i + 1].short_channel_id));
            }
        }

        let mut balances = self.balances.lock().map_err(|_| internal_failure())?;
        for (i, hop) in route.hops.iter().enumerate() {
            let available = balances.get(&hop.short_channel_id).copied().unwrap_or(0);
            if available < hop.amount_msat {
                self.liquidity_failures.fetch_add(1, Ordering::Relaxed);
                let code = if i == 0 {
                    FailureCode::InsufficientBalance
                } else {
                    FailureCode::TemporaryChannelFailure
                };
                return Err(PartFailure::new(
                    code,
                    format!(
                        "{} msat needed on {}, {} available",
                        hop.amount_msat, hop.short_channel_id, available
                    ),
                )
                .at_channel(hop.short_channel_id));
            }
        }
        for hop in &route.hops {
            if let Some(balance) = balances.get_mut(&hop.short_channel_id) {
                *balance -= hop.amount_msat;
            }
        }
        Ok(())
    }

    fn release_liquidity(&self, route: &Route) {
        if let Ok(mut balances) = self.balances.lock() {
            for hop in &route.hops {
                if let Some(balance) = balances.get_mut(&hop.short_channel_id) {
                    *balance += hop.amount_msat;
                }
            }
        }
    }
}

#[async_trait]
impl HtlcDispatcher for SimulatedNetwork {
    async fn dispatch(&self, request: DispatchRequest) -> Result<PaymentPreimage, PartFailure> {
        if !self.hop_latency.is_zero() {
            tokio::time::sleep(self.hop_latency * request.route.len() as u32).await;
        }
        self.lock_liquidity(&request.route)?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);

        let cltv_expiry = request.route.total_cltv_delta;
        let outcome = self.receiver.receive(&request, cltv_expiry).await;
        if outcome.is_err() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            self.release_liquidity(&request.route);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::tests::{node_hex, sample_toml};
    use mpp_core::lightning::{
        GraphRouter, MppPaymentManager, MppPaymentStatus, PaymentData, PaymentRequest,
        PaymentSecret, RouteHop,
    };
    use mpp_core::{ManualClock, SystemClock};
    use std::sync::RwLock;

    fn scenario() -> Scenario {
        Scenario::from_toml_str(&sample_toml()).unwrap()
    }

    fn node(tag: u8) -> NodeId {
        NodeId::from_hex(&node_hex(tag)).unwrap()
    }

    fn direct_request(hash: PaymentHash, amount_msat: u64, total_msat: u64) -> DispatchRequest {
        let payload = FinalHopPayload {
            amt_to_forward_msat: amount_msat,
            outgoing_cltv_value: 144,
            payment_data: Some(PaymentData::new(PaymentSecret::new([1; 32]), total_msat)),
        };
        DispatchRequest {
            payment_hash: hash,
            part_id: mpp_core::lightning::PartId(1),
            amount_msat,
            route: Route {
                hops: vec![RouteHop {
                    node_id: node(0xdd),
                    short_channel_id: ShortChannelId(201),
                    amount_msat,
                    fee_msat: 0,
                    cltv_expiry_delta: 40,
                }],
                total_fee_msat: 0,
                total_amount_msat: amount_msat,
                total_cltv_delta: 40,
            },
            final_hop_payload: payload.encode(),
        }
    }

    #[tokio::test]
    async fn test_held_parts_settle_together() {
        let network = Arc::new(SimulatedNetwork::new(
            &scenario(),
            &MppConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        let preimage = PaymentPreimage::new([9; 32]);
        network.receiver().expect_payment(preimage);
        let hash = preimage.payment_hash();

        let first = {
            let network = Arc::clone(&network);
            tokio::spawn(async move { network.dispatch(direct_request(hash, 400, 1_000)).await })
        };
        // Let the first part reach the receiver
        while network.stats().htlcs_forwarded == 0 {
            tokio::task::yield_now().await;
        }
        let second = network.dispatch(direct_request(hash, 600, 1_000)).await;

        assert_eq!(second.unwrap(), preimage);
        assert_eq!(first.await.unwrap().unwrap(), preimage);
        assert_eq!(network.balance(ShortChannelId(201)), Some(10_000_000 - 1_000));
    }

    #[tokio::test]
    async fn test_unknown_payment_releases_liquidity() {
        let network = SimulatedNetwork::new(
            &scenario(),
            &MppConfig::default(),
            Arc::new(ManualClock::default()),
        );
        let failure = network
            .dispatch(direct_request(PaymentHash::new([3; 32]), 500, 500))
            .await
            .unwrap_err();

        assert_eq!(failure.code, FailureCode::IncorrectOrUnknownPaymentDetails);
        assert_eq!(network.balance(ShortChannelId(201)), Some(10_000_000));
        assert_eq!(network.stats().receiver_rejections, 1);
    }

    #[tokio::test]
    async fn test_send_avoids_flaky_relay_and_thin_channel() {
        let scenario = scenario();
        let config = MppConfig {
            base_retry_delay_ms: 0,
            ..MppConfig::default()
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let network = Arc::new(SimulatedNetwork::new(&scenario, &config, clock.clone()));
        let preimage = PaymentPreimage::new([0x42; 32]);
        network.receiver().expect_payment(preimage);

        let router = GraphRouter::new(Arc::new(RwLock::new(scenario.graph())), scenario.sender);
        let manager = MppPaymentManager::new(
            config,
            scenario.sender,
            Arc::new(router),
            network.clone(),
            clock,
        );

        // Relay b is flaky and relay a only has 700k msat towards the destination
        let request = PaymentRequest::new(
            preimage.payment_hash().as_bytes().to_vec(),
            vec![7u8; 32],
            600_000,
            scenario.destination.as_bytes().to_vec(),
        );
        let payment = manager.send_payment(request).await.unwrap();

        assert_eq!(payment.status, MppPaymentStatus::Complete, "{:?}", payment.failure_reason);
        assert_eq!(payment.settled_amount_msat(), 600_000);
        for part in payment.settled_parts() {
            let route = part.route.as_ref().unwrap();
            assert!(route.hops.iter().all(|hop| hop.node_id != node(0x11)));
        }
    }
}
