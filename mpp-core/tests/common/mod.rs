//! Shared fixtures for the integration suites
//!
//! `fan_out_graph` builds a sender with `n` first hops, each leading through
//! its own relay to a single destination. `LedgerDispatcher` settles or fails
//! HTLCs against balances the sender cannot see.

#![allow(dead_code)]

use async_trait::async_trait;
use mpp_core::lightning::{
    ChannelInfo, DispatchRequest, FailureCode, GraphRouter, HtlcDispatcher, NetworkGraph, NodeId,
    PartFailure, PaymentPreimage, PaymentRequest, ShortChannelId,
};
use mpp_core::{ManualClock, MppConfig};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub const PREIMAGE: [u8; 32] = [0x42; 32];
pub const SECRET: [u8; 32] = [0x5e; 32];

pub fn node(tag: u8) -> NodeId {
    let mut bytes = [tag; 33];
    bytes[0] = 0x02;
    NodeId::new(bytes)
}

pub fn sender() -> NodeId {
    node(0x01)
}

pub fn destination() -> NodeId {
    node(0xdd)
}

/// First-hop channel id for relay `i`
pub fn first_hop(i: u64) -> ShortChannelId {
    ShortChannelId(100 + i)
}

/// Relay-to-destination channel id for relay `i`
pub fn last_hop(i: u64) -> ShortChannelId {
    ShortChannelId(200 + i)
}

pub fn channel(id: ShortChannelId, a: NodeId, b: NodeId, capacity_sat: u64) -> ChannelInfo {
    ChannelInfo {
        short_channel_id: id,
        node_one: a,
        node_two: b,
        capacity_sat,
        htlc_maximum_msat: None,
        base_fee_msat: 0,
        fee_rate_millionths: 1_000,
        cltv_expiry_delta: 40,
        is_active: true,
    }
}

/// Sender -> relay_i -> destination for `i` in `0..relays`
pub fn fan_out_graph(relays: u64, capacity_sat: u64) -> Arc<RwLock<NetworkGraph>> {
    let mut graph = NetworkGraph::new();
    for i in 0..relays {
        let relay = node(0x10 + i as u8);
        graph.add_channel(channel(first_hop(i), sender(), relay, capacity_sat));
        graph.add_channel(channel(last_hop(i), relay, destination(), capacity_sat * 10));
    }
    Arc::new(RwLock::new(graph))
}

pub fn router(graph: Arc<RwLock<NetworkGraph>>) -> Arc<GraphRouter> {
    Arc::new(GraphRouter::new(graph, sender()))
}

pub fn fast_config() -> MppConfig {
    MppConfig {
        base_retry_delay_ms: 0,
        ..MppConfig::default()
    }
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::default())
}

pub fn request(amount_msat: u64) -> PaymentRequest {
    let hash = PaymentPreimage::new(PREIMAGE).payment_hash();
    PaymentRequest::new(
        hash.as_bytes().to_vec(),
        SECRET.to_vec(),
        amount_msat,
        destination().as_bytes().to_vec(),
    )
}

/// Settles an HTLC only if every hop's hidden balance covers it
pub struct LedgerDispatcher {
    balances: Mutex<HashMap<ShortChannelId, u64>>,
    broken: HashSet<ShortChannelId>,
    delay: Duration,
    delivered: Mutex<Vec<DispatchRequest>>,
    pub calls: AtomicUsize,
}

impl LedgerDispatcher {
    /// Unknown channels have unlimited balance
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            broken: HashSet::new(),
            delay: Duration::ZERO,
            delivered: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_balance(self, channel: ShortChannelId, balance_msat: u64) -> Self {
        if let Ok(mut balances) = self.balances.lock() {
            balances.insert(channel, balance_msat);
        }
        self
    }

    /// Every HTLC over `channel` fails with `temporary_channel_failure`
    pub fn with_broken(mut self, channel: ShortChannelId) -> Self {
        self.broken.insert(channel);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests that reached the destination
    pub fn delivered(&self) -> Vec<DispatchRequest> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl HtlcDispatcher for LedgerDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<PaymentPreimage, PartFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut balances = self.balances.lock().unwrap();
            for hop in &request.route.hops {
                if self.broken.contains(&hop.short_channel_id) {
                    return Err(PartFailure::new(
                        FailureCode::TemporaryChannelFailure,
                        "channel broken",
                    )
                    .at_channel(hop.short_channel_id));
                }
                if let Some(balance) = balances.get(&hop.short_channel_id) {
                    if *balance < hop.amount_msat {
                        return Err(PartFailure::new(
                            FailureCode::TemporaryChannelFailure,
                            format!("{} msat available", balance),
                        )
                        .at_channel(hop.short_channel_id));
                    }
                }
            }
            for hop in &request.route.hops {
                if let Some(balance) = balances.get_mut(&hop.short_channel_id) {
                    *balance -= hop.amount_msat;
                }
            }
        }

        self.delivered.lock().unwrap().push(request);
        Ok(PaymentPreimage::new(PREIMAGE))
    }
}
