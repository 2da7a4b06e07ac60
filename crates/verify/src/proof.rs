//! Verification of a Merkle Patricia Trie proof against a trusted root.
//!
//! A proof is an ordered list of RLP-encoded nodes. The first must hash to
//! the trusted root; every descent by hash must match the keccak of the next
//! element; embedded children (shorter than 32 bytes) are walked in place.
//! The walk either witnesses a value at the key (inclusion), or demonstrates
//! that no value can exist at the key (exclusion).

use ethers::types::H256;
use ethers::utils::keccak256;
use thiserror::Error;

use veritas_types::constants::{EMPTY_STORAGE_ROOT, MERKLE_DEPTH_MAX};
use veritas_types::utils::hex_encode;

use crate::node::{NodeError, NodeRef, TrieNode};
use crate::path::{NibblePath, PathError, PrefixComparison};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("Proof is empty but the root is not the empty-trie root")]
    EmptyProof,
    #[error("Node {index} hashes to {computed} but {expected} was expected")]
    HashMismatch { index: usize, computed: String, expected: String },
    #[error("Proof traversal exceeded the maximum depth of {MERKLE_DEPTH_MAX}")]
    DepthExceeded,
    #[error("Proof ends while the traversal still descends by hash")]
    Incomplete,
    #[error("Proof continues past its terminal node")]
    TrailingNodes,
    #[error("Proof witnesses {witnessed} but {claimed} was claimed")]
    ValueMismatch { witnessed: String, claimed: String },
    #[error("Proof witnesses a value where non-existence was claimed")]
    UnexpectedValue,
    #[error("Proof witnesses non-existence where value {0} was claimed")]
    MissingValue(String),
    #[error("Node {index}: {source}")]
    Node { index: usize, source: NodeError },
    #[error("Path error {0}")]
    Path(#[from] PathError),
}

/// The verdict a structurally valid proof delivers for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verified {
    Inclusion,
    Exclusion,
}

/// What a complete walk witnessed at the key.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    /// The trie holds this value at the key.
    Value(Vec<u8>),
    /// The trie provably holds nothing at the key.
    Absent,
}

/// What a single proof element contributed to the walk.
enum Step {
    Descend(H256),
    Done(Outcome),
}

/// Checks that `proof`, anchored at `root`, witnesses exactly `expected` at
/// `key` — or non-existence when `expected` is `None`. Any structural
/// deviation is an error; a clean walk that contradicts the claim is too.
pub fn verify_proof(
    root: H256,
    key: &[u8],
    proof: &[Vec<u8>],
    expected: Option<&[u8]>,
) -> Result<Verified, ProofError> {
    match (walk(root, key, proof)?, expected) {
        (Outcome::Value(witnessed), Some(claimed)) => {
            if witnessed == claimed {
                Ok(Verified::Inclusion)
            } else {
                Err(ProofError::ValueMismatch {
                    witnessed: hex_encode(witnessed),
                    claimed: hex_encode(claimed),
                })
            }
        }
        (Outcome::Value(_), None) => Err(ProofError::UnexpectedValue),
        (Outcome::Absent, None) => Ok(Verified::Exclusion),
        (Outcome::Absent, Some(claimed)) => Err(ProofError::MissingValue(hex_encode(claimed))),
    }
}

/// Walks the proof and returns the witnessed value, erroring when the proof
/// shows the key absent. Used where the caller wants the value itself, such
/// as transaction and receipt lookups by index.
pub fn extract_proved_value(
    root: H256,
    key: &[u8],
    proof: &[Vec<u8>],
) -> Result<Vec<u8>, ProofError> {
    match walk(root, key, proof)? {
        Outcome::Value(value) => Ok(value),
        Outcome::Absent => Err(ProofError::MissingValue("any".to_owned())),
    }
}

fn walk(root: H256, key: &[u8], proof: &[Vec<u8>]) -> Result<Outcome, ProofError> {
    if proof.is_empty() {
        // An empty trie proves every key absent; anything else needs nodes.
        if root == EMPTY_STORAGE_ROOT {
            return Ok(Outcome::Absent);
        }
        return Err(ProofError::EmptyProof);
    }

    let mut traversal = NibblePath::from_key(key);
    let mut expected_hash = root;
    let mut depth = 0usize;

    for (index, raw_node) in proof.iter().enumerate() {
        let computed = H256(keccak256(raw_node));
        if computed != expected_hash {
            return Err(ProofError::HashMismatch {
                index,
                computed: hex_encode(computed),
                expected: hex_encode(expected_hash),
            });
        }
        let is_last = index + 1 == proof.len();
        match walk_one(raw_node, &mut traversal, &mut depth, index)? {
            Step::Descend(hash) => {
                if is_last {
                    return Err(ProofError::Incomplete);
                }
                expected_hash = hash;
            }
            Step::Done(outcome) => {
                if !is_last {
                    return Err(ProofError::TrailingNodes);
                }
                return Ok(outcome);
            }
        }
    }
    Err(ProofError::Incomplete)
}

/// Walks one proof element, following embedded children in place.
fn walk_one(
    raw: &[u8],
    traversal: &mut NibblePath,
    depth: &mut usize,
    index: usize,
) -> Result<Step, ProofError> {
    let node_err = |source| ProofError::Node { index, source };
    let mut current = raw.to_vec();
    loop {
        *depth += 1;
        if *depth > MERKLE_DEPTH_MAX {
            return Err(ProofError::DepthExceeded);
        }
        match TrieNode::decode(&current).map_err(node_err)? {
            TrieNode::Empty => return Ok(Step::Done(Outcome::Absent)),
            TrieNode::Branch { children, value } => {
                if traversal.is_exhausted() {
                    return Ok(Step::Done(match value {
                        Some(value) => Outcome::Value(value),
                        None => Outcome::Absent,
                    }));
                }
                let nibble = traversal.next_nibble()?;
                match &children[nibble as usize] {
                    NodeRef::Empty => return Ok(Step::Done(Outcome::Absent)),
                    NodeRef::Hash(hash) => return Ok(Step::Descend(*hash)),
                    NodeRef::Embedded(child) => current = child.clone(),
                }
            }
            TrieNode::Leaf { partial, value } => {
                match compare(traversal, &partial).map_err(node_err)? {
                    PrefixComparison::Diverges { .. } => {
                        // A different leaf occupies the slot this key would
                        // hash into, so the key cannot be present.
                        return Ok(Step::Done(Outcome::Absent));
                    }
                    PrefixComparison::Matches { nibbles } => {
                        traversal.skip(nibbles)?;
                        if traversal.is_exhausted() {
                            return Ok(Step::Done(Outcome::Value(value)));
                        }
                        // Key continues below a leaf: nothing can be there.
                        return Ok(Step::Done(Outcome::Absent));
                    }
                }
            }
            TrieNode::Extension { partial, child } => match compare(traversal, &partial).map_err(node_err)? {
                PrefixComparison::Diverges { .. } => return Ok(Step::Done(Outcome::Absent)),
                PrefixComparison::Matches { nibbles } => {
                    traversal.skip(nibbles)?;
                    match child {
                        NodeRef::Hash(hash) => return Ok(Step::Descend(hash)),
                        NodeRef::Embedded(inner) => current = inner,
                        NodeRef::Empty => return Err(node_err(NodeError::ExtensionWithoutChild)),
                    }
                }
            },
        }
    }
}

/// Partial-path comparison where a partial longer than the remaining key
/// counts as divergence rather than an error: such a node proves the key
/// absent.
fn compare(traversal: &NibblePath, partial: &[u8]) -> Result<PrefixComparison, NodeError> {
    let encoded = encode_for_compare(partial);
    match traversal.compare_prefix(&encoded) {
        Ok(result) => Ok(result),
        Err(PathError::PartialPathTooLong) => Ok(PrefixComparison::Diverges { at: 0 }),
        Err(other) => Err(NodeError::Path(other)),
    }
}

/// Re-encodes already-decoded nibbles so [`NibblePath::compare_prefix`] can
/// consume them. Always uses the extension encoding; the leaf flag was
/// consumed during node decoding.
fn encode_for_compare(nibbles: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(1 + nibbles.len() / 2);
    let odd = nibbles.len() % 2 == 1;
    if odd {
        encoded.push(0x10 | nibbles[0]);
    } else {
        encoded.push(0x00);
    }
    let body = if odd { &nibbles[1..] } else { nibbles };
    for pair in body.chunks(2) {
        encoded.push((pair[0] << 4) | pair[1]);
    }
    encoded
}
