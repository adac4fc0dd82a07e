//! Routing collaborator and an in-memory graph router
//!
//! The payment manager never computes paths itself; it asks a [`RoutingGraph`]
//! for one route per part. [`GraphRouter`] is a self-contained implementation
//! over a [`NetworkGraph`] used by the simulator and the tests.

use super::payment::{NodeId, ShortChannelId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Default hop limit for the graph router
pub const DEFAULT_MAX_HOPS: usize = 20;

/// Channel as seen by the splitter: identity and size limits only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphChannel {
    pub short_channel_id: ShortChannelId,
    pub capacity_sat: u64,
    pub htlc_maximum_msat: Option<u64>,
}

impl GraphChannel {
    /// Largest amount a single HTLC can move over this channel
    pub fn max_htlc_msat(&self) -> u64 {
        let capacity_msat = self.capacity_sat.saturating_mul(1000);
        match self.htlc_maximum_msat {
            Some(max) => max.min(capacity_msat),
            None => capacity_msat,
        }
    }
}

/// One hop of a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Node at the far end of the channel
    pub node_id: NodeId,
    pub short_channel_id: ShortChannelId,
    /// Amount carried over this channel
    pub amount_msat: u64,
    /// Fee charged for using this channel (zero for the sender's own channel)
    pub fee_msat: u64,
    pub cltv_expiry_delta: u16,
}

/// A complete route from the sender to the destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub hops: Vec<RouteHop>,
    pub total_fee_msat: u64,
    /// Amount leaving the sender, fees included
    pub total_amount_msat: u64,
    pub total_cltv_delta: u32,
}

impl Route {
    pub fn first_hop_channel(&self) -> Option<ShortChannelId> {
        self.hops.first().map(|hop| hop.short_channel_id)
    }

    /// Amount delivered to the destination
    pub fn delivered_msat(&self) -> u64 {
        self.total_amount_msat.saturating_sub(self.total_fee_msat)
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// Restrictions the manager places on a single route lookup
#[derive(Debug, Clone, Default)]
pub struct RouteConstraints {
    /// Force the route to leave the sender over this channel
    pub first_hop: Option<ShortChannelId>,
    pub avoid_channels: HashSet<ShortChannelId>,
    /// Intermediate nodes to avoid; the endpoints are never filtered
    pub avoid_nodes: HashSet<NodeId>,
}

impl RouteConstraints {
    pub fn with_first_hop(mut self, channel: ShortChannelId) -> Self {
        self.first_hop = Some(channel);
        self
    }
}

/// Path-finding collaborator.
///
/// Implementations must bound their own work; `find_route` returns `None`
/// when no path satisfies the amount, fee budget and constraints.
#[async_trait]
pub trait RoutingGraph: Send + Sync {
    async fn find_route(
        &self,
        source: &NodeId,
        destination: &NodeId,
        amount_msat: u64,
        max_fee_msat: u64,
        constraints: &RouteConstraints,
    ) -> Option<Route>;

    /// Channels the sender could use as a first hop
    async fn all_channels(&self) -> Vec<GraphChannel>;
}

/// Channel in the in-memory graph. Policies are symmetric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub short_channel_id: ShortChannelId,
    pub node_one: NodeId,
    pub node_two: NodeId,
    pub capacity_sat: u64,
    #[serde(default)]
    pub htlc_maximum_msat: Option<u64>,
    #[serde(default)]
    pub base_fee_msat: u32,
    #[serde(default)]
    pub fee_rate_millionths: u32,
    #[serde(default = "default_cltv_delta")]
    pub cltv_expiry_delta: u16,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_cltv_delta() -> u16 {
    40
}

fn default_active() -> bool {
    true
}

impl ChannelInfo {
    /// Fee for forwarding `amount_msat` over this channel
    pub fn channel_fee(&self, amount_msat: u64) -> u64 {
        let proportional = (amount_msat as u128 * self.fee_rate_millionths as u128) / 1_000_000;
        self.base_fee_msat as u64 + proportional as u64
    }

    pub fn max_htlc_msat(&self) -> u64 {
        self.as_graph_channel().max_htlc_msat()
    }

    pub fn other_end(&self, node: &NodeId) -> Option<&NodeId> {
        if *node == self.node_one {
            Some(&self.node_two)
        } else if *node == self.node_two {
            Some(&self.node_one)
        } else {
            None
        }
    }

    pub fn as_graph_channel(&self) -> GraphChannel {
        GraphChannel {
            short_channel_id: self.short_channel_id,
            capacity_sat: self.capacity_sat,
            htlc_maximum_msat: self.htlc_maximum_msat,
        }
    }
}

/// Network graph: nodes with adjacency lists, channels by id
#[derive(Debug, Clone, Default)]
pub struct NetworkGraph {
    nodes: HashMap<NodeId, Vec<ShortChannelId>>,
    channels: HashMap<ShortChannelId, ChannelInfo>,
}

impl NetworkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node_id: NodeId) {
        self.nodes.entry(node_id).or_default();
    }

    /// Insert or replace a channel
    pub fn add_channel(&mut self, channel: ChannelInfo) {
        let scid = channel.short_channel_id;
        for node in [channel.node_one, channel.node_two] {
            let adjacent = self.nodes.entry(node).or_default();
            if !adjacent.contains(&scid) {
                adjacent.push(scid);
            }
        }
        self.channels.insert(scid, channel);
    }

    pub fn remove_channel(&mut self, channel_id: ShortChannelId) -> Option<ChannelInfo> {
        let channel = self.channels.remove(&channel_id)?;
        for node in [&channel.node_one, &channel.node_two] {
            if let Some(adjacent) = self.nodes.get_mut(node) {
                adjacent.retain(|id| *id != channel_id);
            }
        }
        Some(channel)
    }

    pub fn get_channel(&self, channel_id: ShortChannelId) -> Option<&ChannelInfo> {
        self.channels.get(&channel_id)
    }

    pub fn get_node_channels(&self, node_id: &NodeId) -> Vec<&ChannelInfo> {
        self.nodes
            .get(node_id)
            .map(|ids| ids.iter().filter_map(|id| self.channels.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Dijkstra router over a shared [`NetworkGraph`].
///
/// The search runs backward from the destination so that each hop's fee is
/// computed on the amount it actually forwards.
pub struct GraphRouter {
    graph: Arc<RwLock<NetworkGraph>>,
    /// The local node; its own channels are the only valid first hops
    local_node: NodeId,
    max_hops: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteState {
    fee_msat: u64,
    /// Amount that has to arrive at `node`
    amount_msat: u64,
    cltv: u32,
    node: NodeId,
    /// Hops from `node` to the destination, nearest first
    path: Vec<RouteHop>,
}

impl Ord for RouteState {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior
        other
            .fee_msat
            .cmp(&self.fee_msat)
            .then_with(|| other.path.len().cmp(&self.path.len()))
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for RouteState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl GraphRouter {
    pub fn new(graph: Arc<RwLock<NetworkGraph>>, local_node: NodeId) -> Self {
        Self {
            graph,
            local_node,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops.max(1);
        self
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Synchronous path search; see [`RoutingGraph::find_route`]
    pub fn find_route_sync(
        &self,
        source: &NodeId,
        destination: &NodeId,
        amount_msat: u64,
        max_fee_msat: u64,
        constraints: &RouteConstraints,
    ) -> Option<Route> {
        if source == destination || amount_msat == 0 {
            return None;
        }

        let graph = match self.graph.read() {
            Ok(graph) => graph,
            Err(_) => {
                warn!("Network graph lock poisoned; no route");
                return None;
            }
        };

        let mut heap = BinaryHeap::new();
        let mut best_fee: HashMap<NodeId, u64> = HashMap::new();
        let mut visited: HashSet<NodeId> = HashSet::new();

        heap.push(RouteState {
            fee_msat: 0,
            amount_msat,
            cltv: 0,
            node: *destination,
            path: Vec::new(),
        });
        best_fee.insert(*destination, 0);

        while let Some(current) = heap.pop() {
            if !visited.insert(current.node) {
                continue;
            }

            if current.node == *source {
                let mut hops = current.path;
                hops.reverse();
                debug!(
                    "Found {}-hop route to {} carrying {} msat (fee {})",
                    hops.len(),
                    destination.short_hex(),
                    amount_msat,
                    current.fee_msat
                );
                return Some(Route {
                    hops,
                    total_fee_msat: current.fee_msat,
                    total_amount_msat: current.amount_msat,
                    total_cltv_delta: current.cltv,
                });
            }

            if current.path.len() >= self.max_hops {
                continue;
            }

            for channel in graph.get_node_channels(&current.node) {
                if !channel.is_active
                    || constraints.avoid_channels.contains(&channel.short_channel_id)
                {
                    continue;
                }
                let Some(upstream) = channel.other_end(&current.node) else {
                    continue;
                };
                if visited.contains(upstream) {
                    continue;
                }
                let upstream_is_source = upstream == source;
                if upstream_is_source {
                    if let Some(first_hop) = constraints.first_hop {
                        if channel.short_channel_id != first_hop {
                            continue;
                        }
                    }
                } else if constraints.avoid_nodes.contains(upstream) {
                    continue;
                }

                if channel.max_htlc_msat() < current.amount_msat {
                    continue;
                }

                // The sender does not pay itself for its own channel
                let hop_fee = if upstream_is_source {
                    0
                } else {
                    channel.channel_fee(current.amount_msat)
                };
                let fee_msat = current.fee_msat.saturating_add(hop_fee);
                if fee_msat > max_fee_msat {
                    continue;
                }
                if fee_msat >= best_fee.get(upstream).copied().unwrap_or(u64::MAX) {
                    continue;
                }
                best_fee.insert(*upstream, fee_msat);

                let cltv = if upstream_is_source {
                    current.cltv
                } else {
                    current.cltv + channel.cltv_expiry_delta as u32
                };

                let mut path = current.path.clone();
                path.push(RouteHop {
                    node_id: current.node,
                    short_channel_id: channel.short_channel_id,
                    amount_msat: current.amount_msat,
                    fee_msat: hop_fee,
                    cltv_expiry_delta: channel.cltv_expiry_delta,
                });

                heap.push(RouteState {
                    fee_msat,
                    amount_msat: current.amount_msat.saturating_add(hop_fee),
                    cltv,
                    node: *upstream,
                    path,
                });
            }
        }

        debug!(
            "No route from {} to {} for {} msat",
            source.short_hex(),
            destination.short_hex(),
            amount_msat
        );
        None
    }
}

#[async_trait]
impl RoutingGraph for GraphRouter {
    async fn find_route(
        &self,
        source: &NodeId,
        destination: &NodeId,
        amount_msat: u64,
        max_fee_msat: u64,
        constraints: &RouteConstraints,
    ) -> Option<Route> {
        self.find_route_sync(source, destination, amount_msat, max_fee_msat, constraints)
    }

    async fn all_channels(&self) -> Vec<GraphChannel> {
        match self.graph.read() {
            Ok(graph) => graph
                .get_node_channels(&self.local_node)
                .into_iter()
                .filter(|channel| channel.is_active)
                .map(ChannelInfo::as_graph_channel)
                .collect(),
            Err(_) => {
                warn!("Network graph lock poisoned; reporting no channels");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::new([byte; 33])
    }

    fn channel(id: u64, a: u8, b: u8, capacity_sat: u64, base_fee_msat: u32) -> ChannelInfo {
        ChannelInfo {
            short_channel_id: ShortChannelId(id),
            node_one: node(a),
            node_two: node(b),
            capacity_sat,
            htlc_maximum_msat: None,
            base_fee_msat,
            fee_rate_millionths: 0,
            cltv_expiry_delta: 40,
            is_active: true,
        }
    }

    // 1 -- 2 -- 4 (cheap), 1 -- 3 -- 4 (expensive)
    fn diamond() -> GraphRouter {
        let mut graph = NetworkGraph::new();
        graph.add_channel(channel(12, 1, 2, 100, 0));
        graph.add_channel(channel(24, 2, 4, 100, 10));
        graph.add_channel(channel(13, 1, 3, 100, 0));
        graph.add_channel(channel(34, 3, 4, 100, 50));
        GraphRouter::new(Arc::new(RwLock::new(graph)), node(1))
    }

    #[test]
    fn test_cheapest_route_and_fees() {
        let router = diamond();
        let route = router
            .find_route_sync(&node(1), &node(4), 10_000, 1_000, &RouteConstraints::default())
            .unwrap();

        assert_eq!(route.first_hop_channel(), Some(ShortChannelId(12)));
        assert_eq!(route.len(), 2);
        assert_eq!(route.total_fee_msat, 10);
        assert_eq!(route.total_amount_msat, 10_010);
        assert_eq!(route.delivered_msat(), 10_000);
        assert_eq!(route.hops[0].amount_msat, 10_010);
        assert_eq!(route.hops[1].node_id, node(4));
        assert_eq!(route.total_cltv_delta, 40);
    }

    #[test]
    fn test_first_hop_and_avoid_constraints() {
        let router = diamond();
        let forced = RouteConstraints::default().with_first_hop(ShortChannelId(13));
        let route = router
            .find_route_sync(&node(1), &node(4), 10_000, 1_000, &forced)
            .unwrap();
        assert_eq!(route.first_hop_channel(), Some(ShortChannelId(13)));
        assert_eq!(route.total_fee_msat, 50);

        let mut avoid = RouteConstraints::default();
        avoid.avoid_nodes.insert(node(2));
        let route = router
            .find_route_sync(&node(1), &node(4), 10_000, 1_000, &avoid)
            .unwrap();
        assert_eq!(route.first_hop_channel(), Some(ShortChannelId(13)));
    }

    #[test]
    fn test_fee_budget_and_capacity_limits() {
        let router = diamond();
        let mut avoid = RouteConstraints::default();
        avoid.avoid_channels.insert(ShortChannelId(24));
        assert!(router
            .find_route_sync(&node(1), &node(4), 10_000, 49, &avoid)
            .is_none());

        // 100 sat channels cannot carry 200 sat
        assert!(router
            .find_route_sync(&node(1), &node(4), 200_000, 1_000, &RouteConstraints::default())
            .is_none());
    }

    #[tokio::test]
    async fn test_all_channels_lists_local_channels() {
        let router = diamond();
        let mut ids: Vec<_> = router
            .all_channels()
            .await
            .into_iter()
            .map(|c| c.short_channel_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![ShortChannelId(12), ShortChannelId(13)]);
    }

    #[test]
    fn test_graph_remove_channel() {
        let mut graph = NetworkGraph::new();
        graph.add_channel(channel(1, 1, 2, 10, 0));
        assert_eq!(graph.channel_count(), 1);
        assert!(graph.remove_channel(ShortChannelId(1)).is_some());
        assert!(graph.get_node_channels(&node(1)).is_empty());
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn test_htlc_maximum_caps_capacity() {
        let channel = GraphChannel {
            short_channel_id: ShortChannelId(1),
            capacity_sat: 1_000,
            htlc_maximum_msat: Some(400_000),
        };
        assert_eq!(channel.max_htlc_msat(), 400_000);
    }
}
