//! Persistent caching of the verified node list.
//!
//! The blob format is versioned and big-endian throughout:
//!
//! ```text
//! u8   version (=1)
//! [20] registry contract
//! u64  lastBlock
//! u32  N
//! N ×  { f32-bits weight, u32 responseCount, u64 totalResponseTimeMs,
//!        u64 blacklistedUntilMs }
//! N ×  { u32 capacity, u32 index, u64 deposit, u64 props, [20] address,
//!        u32 urlLen, urlLen × u8 }
//! ```
//!
//! A version mismatch is reported; any truncation simply drops the cache.
//! Store failures are logged and ignored — caching must never fail a
//! request.

use ethers::types::H160;
use thiserror::Error;

use veritas_types::nodes::{Chain, NodeEntry, NodeWeight};

const CACHE_VERSION: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cached nodelist has version {0}, expected {CACHE_VERSION}")]
    BadVersion(u8),
    #[error("cached nodelist is truncated")]
    Truncated,
    #[error("cached nodelist has a malformed url")]
    BadUrl,
}

/// Host-provided persistent key-value store.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>);
}

/// In-memory storage for tests and short-lived embedders.
#[derive(Debug, Default)]
pub struct MemStorage {
    entries: parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().insert(key.to_owned(), value);
    }
}

pub fn cache_key(chain_id: u64) -> String {
    format!("nodelist_{chain_id:x}")
}

/// The chain fields the cache round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedNodeList {
    pub contract: H160,
    pub last_block: u64,
    pub nodes: Vec<NodeEntry>,
    pub weights: Vec<NodeWeight>,
}

pub fn encode_node_list(chain: &Chain) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + chain.nodes.len() * 96);
    out.push(CACHE_VERSION);
    out.extend_from_slice(chain.contract.as_bytes());
    out.extend_from_slice(&chain.last_block.to_be_bytes());
    out.extend_from_slice(&(chain.nodes.len() as u32).to_be_bytes());
    for weight in &chain.weights {
        out.extend_from_slice(&weight.weight.to_bits().to_be_bytes());
        out.extend_from_slice(&weight.response_count.to_be_bytes());
        out.extend_from_slice(&weight.total_response_time_ms.to_be_bytes());
        out.extend_from_slice(&weight.blacklisted_until_ms.to_be_bytes());
    }
    for node in &chain.nodes {
        out.extend_from_slice(&node.capacity.to_be_bytes());
        out.extend_from_slice(&node.index.to_be_bytes());
        out.extend_from_slice(&node.deposit.to_be_bytes());
        out.extend_from_slice(&node.props.to_be_bytes());
        out.extend_from_slice(node.address.as_bytes());
        out.extend_from_slice(&(node.url.len() as u32).to_be_bytes());
        out.extend_from_slice(node.url.as_bytes());
    }
    out
}

pub fn decode_node_list(bytes: &[u8]) -> Result<CachedNodeList, CacheError> {
    let mut reader = Reader { bytes, position: 0 };
    let version = reader.take_u8()?;
    if version != CACHE_VERSION {
        return Err(CacheError::BadVersion(version));
    }
    let contract = H160::from_slice(reader.take(20)?);
    let last_block = reader.take_u64()?;
    let count = reader.take_u32()? as usize;

    let mut weights = Vec::with_capacity(count);
    for _ in 0..count {
        weights.push(NodeWeight {
            weight: f32::from_bits(reader.take_u32()?),
            response_count: reader.take_u32()?,
            total_response_time_ms: reader.take_u64()?,
            blacklisted_until_ms: reader.take_u64()?,
        });
    }
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        let capacity = reader.take_u32()?;
        let index = reader.take_u32()?;
        let deposit = reader.take_u64()?;
        let props = reader.take_u64()?;
        let address = H160::from_slice(reader.take(20)?);
        let url_len = reader.take_u32()? as usize;
        let url = String::from_utf8(reader.take(url_len)?.to_vec())
            .map_err(|_| CacheError::BadUrl)?;
        nodes.push(NodeEntry { index, url, address, deposit, props, capacity });
    }
    Ok(CachedNodeList { contract, last_block, nodes, weights })
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CacheError> {
        let end = self.position.checked_add(len).ok_or(CacheError::Truncated)?;
        let slice = self.bytes.get(self.position..end).ok_or(CacheError::Truncated)?;
        self.position = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, CacheError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, CacheError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn take_u64(&mut self) -> Result<u64, CacheError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use veritas_types::chainspec::ChainSpec;

    use super::*;

    fn sample_chain() -> Chain {
        let mut chain = Chain::new(1, H160::from_low_u64_be(0x123), ChainSpec::mainnet());
        chain.install_nodes(
            vec![
                NodeEntry {
                    index: 0,
                    url: "https://node-a.example".into(),
                    address: H160::from_low_u64_be(0xaaa),
                    deposit: 1_000,
                    props: 0xffff,
                    capacity: 2,
                },
                NodeEntry {
                    index: 1,
                    url: "https://node-b.example".into(),
                    address: H160::from_low_u64_be(0xbbb),
                    deposit: 500,
                    props: 3,
                    capacity: 1,
                },
            ],
            41,
        );
        chain.weights[1].track_response(120);
        chain.weights[1].blacklisted_until_ms = 99_000;
        chain
    }

    #[test]
    fn cache_roundtrip_is_byte_exact() {
        let chain = sample_chain();
        let blob = encode_node_list(&chain);
        let decoded = decode_node_list(&blob).unwrap();
        assert_eq!(decoded.contract, chain.contract);
        assert_eq!(decoded.last_block, 41);
        assert_eq!(decoded.nodes, chain.nodes);
        assert_eq!(decoded.weights, chain.weights);
        // Re-encoding yields the identical blob.
        let mut chain2 = Chain::new(1, decoded.contract, ChainSpec::mainnet());
        chain2.nodes = decoded.nodes;
        chain2.weights = decoded.weights;
        chain2.last_block = decoded.last_block;
        assert_eq!(encode_node_list(&chain2), blob);
    }

    #[test]
    fn version_mismatch_is_reported() {
        let mut blob = encode_node_list(&sample_chain());
        blob[0] = 2;
        assert_eq!(decode_node_list(&blob).unwrap_err(), CacheError::BadVersion(2));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = encode_node_list(&sample_chain());
        for cut in [1usize, 10, 40, blob.len() - 1] {
            assert_eq!(
                decode_node_list(&blob[..cut]).unwrap_err(),
                CacheError::Truncated,
                "cut at {cut}"
            );
        }
    }
}
