//! Structural decoding of a single Merkle PATRICIA Trie node.

use ethers::types::H256;
use rlp::Rlp;
use thiserror::Error;

use crate::path::{decode_hex_prefix, PathError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("RLP decode error {0}")]
    Decode(String),
    #[error("Trie node must have 2 or 17 items, got {0}")]
    InvalidItemCount(usize),
    #[error("Branch child must be empty, a 32 byte hash or an embedded node")]
    InvalidChildReference,
    #[error("Extension node child is empty")]
    ExtensionWithoutChild,
    #[error("Trie path error {0}")]
    Path(#[from] PathError),
}

impl From<rlp::DecoderError> for NodeError {
    fn from(err: rlp::DecoderError) -> Self {
        NodeError::Decode(err.to_string())
    }
}

/// Reference from a node to a child node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRef {
    /// No child in this slot.
    Empty,
    /// keccak of the child's RLP; the child is the next proof element.
    Hash(H256),
    /// Child shorter than 32 bytes, inlined into the parent. Holds the raw
    /// RLP which is walked in place without rehashing.
    Embedded(Vec<u8>),
}

/// A decoded trie node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrieNode {
    /// 17-item node: 16 children plus an optional value.
    Branch { children: Vec<NodeRef>, value: Option<Vec<u8>> },
    /// 2-item node: hex-prefixed partial path plus either a value (leaf) or
    /// a child reference (extension).
    Leaf { partial: Vec<u8>, value: Vec<u8> },
    Extension { partial: Vec<u8>, child: NodeRef },
    /// The empty node (RLP of the empty string).
    Empty,
}

impl TrieNode {
    pub fn decode(raw: &[u8]) -> Result<Self, NodeError> {
        let rlp = Rlp::new(raw);
        if rlp.is_data() && rlp.data()?.is_empty() {
            return Ok(TrieNode::Empty);
        }
        match rlp.item_count()? {
            17 => {
                let mut children = Vec::with_capacity(16);
                for slot in 0..16 {
                    children.push(child_ref(&rlp.at(slot)?)?);
                }
                let value_item = rlp.at(16)?;
                let value_bytes = value_item.data()?;
                let value =
                    if value_bytes.is_empty() { None } else { Some(value_bytes.to_vec()) };
                Ok(TrieNode::Branch { children, value })
            }
            2 => {
                let encoded_partial = rlp.at(0)?.data()?;
                let (partial, is_leaf) = decode_hex_prefix(encoded_partial)?;
                let second = rlp.at(1)?;
                if is_leaf {
                    Ok(TrieNode::Leaf { partial, value: second.data()?.to_vec() })
                } else {
                    let child = child_ref(&second)?;
                    if child == NodeRef::Empty {
                        return Err(NodeError::ExtensionWithoutChild);
                    }
                    Ok(TrieNode::Extension { partial, child })
                }
            }
            other => Err(NodeError::InvalidItemCount(other)),
        }
    }
}

fn child_ref(item: &Rlp) -> Result<NodeRef, NodeError> {
    if item.is_list() {
        return Ok(NodeRef::Embedded(item.as_raw().to_vec()));
    }
    let data = item.data()?;
    match data.len() {
        0 => Ok(NodeRef::Empty),
        32 => Ok(NodeRef::Hash(H256::from_slice(data))),
        _ => Err(NodeError::InvalidChildReference),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(hex_node: &str) -> TrieNode {
        TrieNode::decode(&hex::decode(hex_node).unwrap()).unwrap()
    }

    /// Account leaf from a mainnet proof: list[path, rlp(account)].
    #[test]
    fn decodes_account_leaf() {
        let node = decode(
            "f8669d33269ec9b8f075a4723d27c611ac1c52a464f3516b25e0105a0d1c2210b846f844018\
             0a03836d7e3afb674e5180b7564e096f6f3e30308878a443fe59012ced093544b7fa02cfdfbd\
             d943ec0153ed07b97f03eb765dc11cc79c6f750effcc2d126f93c4b31",
        );
        match node {
            TrieNode::Leaf { partial, value } => {
                assert_eq!(partial.len(), 57);
                assert_eq!(value.len(), 70);
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn decodes_extension() {
        let node =
            decode("e210a0c01ed7b75d88d88add6ef9744c598fff626eac250bc209e6b4d11069e93aefb8");
        match node {
            TrieNode::Extension { partial, child } => {
                assert_eq!(partial, vec![0x0]);
                assert!(matches!(child, NodeRef::Hash(_)));
            }
            other => panic!("expected extension, got {other:?}"),
        }
    }

    #[test]
    fn decodes_branch_with_empty_slots() {
        let node = decode(
            "f891a097d37274c14dc79a9874f3387ef34e7dbfbbed0fb3caf668d57323f7fb152f7980808\
             0808080a0e05bb037e849d9733f2b57d5132f96c57eb2eca763a5ebbb53f52f88c4cd7abb808\
             0808080a0f9dd0c1cfce2ce11694839a45f4beb3d5ac9af39ddd9949075c6be1223373a0ca0c\
             7219989da6535f0fbaf34d9633adde100c81c6f3efd0b9a423fa4886245fa8c8080",
        );
        match node {
            TrieNode::Branch { children, value } => {
                assert_eq!(children.len(), 16);
                assert!(value.is_none());
                assert!(matches!(children[0], NodeRef::Hash(_)));
                assert_eq!(children[1], NodeRef::Empty);
            }
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn decodes_empty_node() {
        assert_eq!(TrieNode::decode(&[0x80]).unwrap(), TrieNode::Empty);
    }

    #[test]
    fn rejects_other_item_counts() {
        // A 3-item list is not a trie node.
        let raw = rlp::encode_list::<Vec<u8>, _>(&[vec![1u8], vec![2u8], vec![3u8]]);
        assert_eq!(
            TrieNode::decode(&raw).unwrap_err(),
            NodeError::InvalidItemCount(3)
        );
    }
}
