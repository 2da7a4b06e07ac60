//! Client configuration.

use serde::{Deserialize, Serialize};

/// How strictly responses must be proven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verification {
    /// Skip all verification. Debugging only.
    Never,
    /// Verify headers and Merkle proofs.
    #[default]
    Proof,
    /// Additionally replay `eth_call` through the local EVM.
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Chain the client talks to.
    pub chain_id: u64,
    /// Cap on the registry size fetched with a node-list refresh.
    pub node_limit: u32,
    /// Nodes with a smaller deposit are never selected.
    pub min_deposit: u64,
    /// Number of nodes asked in parallel per request.
    pub request_count: u8,
    /// Per-round transport timeout.
    pub timeout_ms: u32,
    pub verification: Verification,
    /// Distinct registered signers required to accept a header.
    pub signature_count: u8,
    /// Rounds of reselection before a request fails.
    pub retry_budget: u8,
    /// Blacklist window after a failed proof.
    pub blacklist_trust_ms: u64,
    /// Blacklist window after a timeout or malformed response.
    pub blacklist_transport_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            node_limit: 0,
            min_deposit: 0,
            request_count: 1,
            timeout_ms: 10_000,
            verification: Verification::Proof,
            signature_count: 1,
            retry_budget: 2,
            blacklist_trust_ms: 3_600_000,
            blacklist_transport_ms: 30_000,
        }
    }
}
