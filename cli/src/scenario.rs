//! Simulation scenarios
//!
//! A scenario is a TOML file describing a small network: the sending and
//! receiving nodes, the channels between nodes and, for each channel, the
//! liquidity that is really available (which the sender never sees).
//!
//! ```toml
//! name = "three-relays"
//! sender = "02aa…"
//! destination = "03dd…"
//! flaky_nodes = ["02bb…"]
//!
//! [[channels]]
//! short_channel_id = 100
//! node_one = "02aa…"
//! node_two = "02bb…"
//! capacity_sat = 1000000
//! liquidity_msat = 250000000
//! ```

use anyhow::{bail, Context, Result};
use mpp_core::lightning::{ChannelInfo, GraphChannel, NetworkGraph, NodeId, ShortChannelId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioChannel {
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
    /// Spendable balance in the forwarding direction; full capacity if unset
    #[serde(default)]
    pub liquidity_msat: Option<u64>,
}

fn default_cltv_delta() -> u16 {
    40
}

fn default_latency_ms() -> u64 {
    5
}

impl ScenarioChannel {
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            short_channel_id: self.short_channel_id,
            node_one: self.node_one,
            node_two: self.node_two,
            capacity_sat: self.capacity_sat,
            htlc_maximum_msat: self.htlc_maximum_msat,
            base_fee_msat: self.base_fee_msat,
            fee_rate_millionths: self.fee_rate_millionths,
            cltv_expiry_delta: self.cltv_expiry_delta,
            is_active: true,
        }
    }

    pub fn hidden_liquidity_msat(&self) -> u64 {
        self.liquidity_msat
            .unwrap_or_else(|| self.capacity_sat.saturating_mul(1000))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub sender: NodeId,
    pub destination: NodeId,
    /// Nodes that fail every HTLC they are asked to forward
    #[serde(default)]
    pub flaky_nodes: Vec<NodeId>,
    /// Simulated delay per hop
    #[serde(default = "default_latency_ms")]
    pub hop_latency_ms: u64,
    pub channels: Vec<ScenarioChannel>,
}

impl Scenario {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(contents).context("Failed to parse scenario")?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid scenario {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.sender == self.destination {
            bail!("sender and destination must differ");
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.node_one == channel.node_two {
                bail!("channel {} connects a node to itself", channel.short_channel_id);
            }
            if !seen.insert(channel.short_channel_id) {
                bail!("duplicate channel {}", channel.short_channel_id);
            }
        }
        if self.local_channels().is_empty() {
            bail!("sender {} has no channels", self.sender.short_hex());
        }
        Ok(())
    }

    pub fn graph(&self) -> NetworkGraph {
        let mut graph = NetworkGraph::new();
        for channel in &self.channels {
            graph.add_channel(channel.info());
        }
        graph
    }

    /// The sender's own channels, as the splitter sees them
    pub fn local_channels(&self) -> Vec<GraphChannel> {
        self.channels
            .iter()
            .filter(|c| c.node_one == self.sender || c.node_two == self.sender)
            .map(|c| c.info().as_graph_channel())
            .collect()
    }

    pub fn hidden_liquidity(&self) -> HashMap<ShortChannelId, u64> {
        self.channels
            .iter()
            .map(|c| (c.short_channel_id, c.hidden_liquidity_msat()))
            .collect()
    }
}
