//! Traversal paths through a Merkle PATRICIA Trie proof.
//!
//! Trie keys are byte strings (a keccak hash for state and storage tries, an
//! RLP-encoded index for transaction and receipt tries). Navigation happens
//! in nibbles, 16 choices per level. Leaf and extension nodes carry a
//! hex-prefix-encoded partial path: the first nibble encodes leaf/extension
//! and odd/even padding.
//!
//! When the partial path of a terminal node diverges from the key, the key is
//! not in the trie; whether that makes the proof an exclusion proof or a
//! verification failure is decided by the caller.

use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PathError {
    #[error("Attempted traversal past the end of the key")]
    PathExhausted,
    #[error("Node partial path is empty")]
    PartialPathEmpty,
    #[error("Invalid hex-prefix encoding nibble {0}")]
    InvalidPrefix(u8),
    #[error("Partial path is longer than the remaining key")]
    PartialPathTooLong,
}

/// The key of a proof, expanded to nibbles, with a cursor for the traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NibblePath {
    nibbles: Vec<u8>,
    visiting: usize,
}

impl NibblePath {
    /// Expands key bytes into a nibble sequence: `0xbc3a` -> `[b, c, 3, a]`.
    pub fn from_key(key: &[u8]) -> Self {
        let nibbles = key.iter().flat_map(|byte| [byte >> 4, byte & 0x0f]).collect();
        Self { nibbles, visiting: 0 }
    }

    /// True once every nibble of the key has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.visiting == self.nibbles.len()
    }

    pub fn remaining(&self) -> usize {
        self.nibbles.len() - self.visiting
    }

    /// Consumes and returns the next nibble, for selecting a branch child.
    pub fn next_nibble(&mut self) -> Result<u8, PathError> {
        let nibble = *self.nibbles.get(self.visiting).ok_or(PathError::PathExhausted)?;
        self.visiting += 1;
        Ok(nibble)
    }

    /// Compares a node's hex-prefix-encoded partial path against the
    /// remaining key without consuming anything.
    pub fn compare_prefix(&self, encoded: &[u8]) -> Result<PrefixComparison, PathError> {
        let (partial, _) = decode_hex_prefix(encoded)?;
        if partial.len() > self.remaining() {
            return Err(PathError::PartialPathTooLong);
        }
        for (offset, nibble) in partial.iter().enumerate() {
            if self.nibbles[self.visiting + offset] != *nibble {
                return Ok(PrefixComparison::Diverges { at: self.visiting + offset });
            }
        }
        Ok(PrefixComparison::Matches { nibbles: partial.len() })
    }

    /// Advances the cursor past `count` nibbles already validated with
    /// [`Self::compare_prefix`].
    pub fn skip(&mut self, count: usize) -> Result<(), PathError> {
        if count > self.remaining() {
            return Err(PathError::PathExhausted);
        }
        self.visiting += count;
        Ok(())
    }
}

/// Outcome of matching a node's partial path against the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixComparison {
    Matches { nibbles: usize },
    Diverges { at: usize },
}

/// Decodes a hex-prefix-encoded partial path, returning the nibbles and
/// whether the node is a leaf (flag bit 0x20 of the first byte).
pub fn decode_hex_prefix(encoded: &[u8]) -> Result<(Vec<u8>, bool), PathError> {
    let first = *encoded.first().ok_or(PathError::PartialPathEmpty)?;
    let flag = first >> 4;
    let is_leaf = match flag {
        0 | 1 => false,
        2 | 3 => true,
        other => return Err(PathError::InvalidPrefix(other)),
    };
    let is_odd = flag & 1 == 1;
    let mut nibbles = Vec::with_capacity(encoded.len() * 2);
    if is_odd {
        nibbles.push(first & 0x0f);
    }
    for byte in &encoded[1..] {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    Ok((nibbles, is_leaf))
}
