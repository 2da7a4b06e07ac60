//! Well-known protocol constants.

use ethers::types::H256;

/// keccak256 of the empty byte string. An account with this code hash holds
/// no code.
pub const EMPTY_CODE_HASH: H256 = H256([
    0xc5, 0xd2, 0x46, 0x01, 0x86, 0xf7, 0x23, 0x3c, 0x92, 0x7e, 0x7d, 0xb2, 0xdc, 0xc7, 0x03,
    0xc0, 0xe5, 0x00, 0xb6, 0x53, 0xca, 0x82, 0x27, 0x3b, 0x7b, 0xfa, 0xd8, 0x04, 0x5d, 0x85,
    0xa4, 0x70,
]);

/// Root hash of an empty Merkle Patricia Trie: keccak256(rlp(""))
pub const EMPTY_STORAGE_ROOT: H256 = H256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
]);

/// Maximum trie depth a proof may traverse. A 32 byte key has 64 nibbles, so
/// any longer traversal is malicious.
pub const MERKLE_DEPTH_MAX: usize = 64;

/// Average response time assumed for a node that has not answered yet, in
/// milliseconds. Also the numerator scale of the node weight formula.
pub const DEFAULT_RESPONSE_TIME_MS: u64 = 500;
