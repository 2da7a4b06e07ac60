//! Registry entries for remote nodes and their runtime reputation.
//!
//! A [`Chain`] holds two parallel vectors: the immutable node descriptions as
//! read from the on-chain registry, and the locally mutated weights. The link
//! between them is the slot index, which is also what node selection hands
//! around.

use ethers::types::H160;

use crate::chainspec::ChainSpec;
use crate::constants::DEFAULT_RESPONSE_TIME_MS;

/// A remote node as registered on chain. Immutable once installed; the list
/// is only ever replaced wholesale by a verified refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// Position in the on-chain registry.
    pub index: u32,
    /// JSON-RPC endpoint.
    pub url: String,
    /// Address the node signs attestations with.
    pub address: H160,
    /// Stake backing the node's honesty.
    pub deposit: u64,
    /// Capability bitmask.
    pub props: u64,
    /// Relative serving capacity.
    pub capacity: u32,
}

/// Locally tracked reputation for one node. Mutated by the send loop only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeWeight {
    pub weight: f32,
    pub response_count: u32,
    pub total_response_time_ms: u64,
    /// Epoch milliseconds until which the node is excluded. Zero means the
    /// node is not blacklisted.
    pub blacklisted_until_ms: u64,
}

impl Default for NodeWeight {
    fn default() -> Self {
        Self {
            weight: 1.0,
            response_count: 0,
            total_response_time_ms: 0,
            blacklisted_until_ms: 0,
        }
    }
}

impl NodeWeight {
    /// Average response time, falling back to the assumed default until the
    /// node has answered at least once.
    pub fn avg_response_time_ms(&self) -> u64 {
        if self.response_count == 0 {
            DEFAULT_RESPONSE_TIME_MS
        } else {
            self.total_response_time_ms / u64::from(self.response_count)
        }
    }

    pub fn is_blacklisted(&self, now_ms: u64) -> bool {
        self.blacklisted_until_ms > now_ms
    }

    /// Records one observed round trip.
    pub fn track_response(&mut self, elapsed_ms: u64) {
        self.response_count += 1;
        self.total_response_time_ms += elapsed_ms;
    }
}

/// Per-chain registry state.
#[derive(Debug, Clone)]
pub struct Chain {
    pub chain_id: u64,
    /// Address of the node-registry contract.
    pub contract: H160,
    /// Block number the node list was last verified at.
    pub last_block: u64,
    /// Set when the list must be refreshed before the next selection.
    pub needs_update: bool,
    pub nodes: Vec<NodeEntry>,
    pub weights: Vec<NodeWeight>,
    pub spec: ChainSpec,
}

impl Chain {
    pub fn new(chain_id: u64, contract: H160, spec: ChainSpec) -> Self {
        Self {
            chain_id,
            contract,
            last_block: 0,
            needs_update: true,
            nodes: Vec::new(),
            weights: Vec::new(),
            spec,
        }
    }

    /// Installs a fresh node list, resetting all weights.
    /// `nodes.len() == weights.len()` holds by construction.
    pub fn install_nodes(&mut self, nodes: Vec<NodeEntry>, last_block: u64) {
        self.weights = vec![NodeWeight::default(); nodes.len()];
        self.nodes = nodes;
        self.last_block = last_block;
        self.needs_update = false;
    }

    pub fn blacklisted_count(&self, now_ms: u64) -> usize {
        self.weights.iter().filter(|w| w.is_blacklisted(now_ms)).count()
    }

    /// Drops every blacklist mark. Used by the liveness override when more
    /// than half the registry is excluded.
    pub fn clear_blacklists(&mut self) {
        for weight in &mut self.weights {
            weight.blacklisted_until_ms = 0;
        }
    }
}
