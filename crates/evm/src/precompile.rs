//! Precompiled contracts at addresses 1..=8.

use ethers::types::{H160, H256, RecoveryMessage, Signature, U256};
use sha2::{Digest, Sha256};

use veritas_types::chainspec::EipFlags;

use crate::EvmError;

/// True when `address` designates a precompiled contract under the active
/// rule set.
pub fn is_precompile(address: H160, flags: EipFlags) -> bool {
    let bytes = address.as_bytes();
    if bytes[..19].iter().any(|b| *b != 0) {
        return false;
    }
    match bytes[19] {
        1..=4 => true,
        5 => flags.contains(EipFlags::EIP198),
        6 | 7 => flags.contains(EipFlags::EIP196),
        8 => flags.contains(EipFlags::EIP197),
        _ => false,
    }
}

/// Runs the precompile, returning `(gas_used, output)`.
pub fn execute(address: H160, input: &[u8]) -> Result<(u64, Vec<u8>), EvmError> {
    match address.as_bytes()[19] {
        1 => ecrecover(input),
        2 => sha256(input),
        4 => identity(input),
        other => Err(EvmError::InvalidEnv(format!(
            "precompile 0x{other:02x} is not available in this interpreter"
        ))),
    }
}

/// Address 1: `ecrecover(hash, v, r, s) -> address`, zero-padded to a word.
/// Returns empty output (not an error) on an unrecoverable signature, as the
/// real precompile does.
fn ecrecover(input: &[u8]) -> Result<(u64, Vec<u8>), EvmError> {
    const GAS: u64 = 3_000;
    let mut padded = [0u8; 128];
    let len = input.len().min(128);
    padded[..len].copy_from_slice(&input[..len]);

    let hash = H256::from_slice(&padded[..32]);
    let v = U256::from_big_endian(&padded[32..64]);
    let r = U256::from_big_endian(&padded[64..96]);
    let s = U256::from_big_endian(&padded[96..128]);
    if v > U256::from(u64::MAX) {
        return Ok((GAS, Vec::new()));
    }
    let signature = Signature { r, s, v: v.as_u64() };
    match signature.recover(RecoveryMessage::Hash(hash)) {
        Ok(address) => {
            let mut output = vec![0u8; 32];
            output[12..].copy_from_slice(address.as_bytes());
            Ok((GAS, output))
        }
        Err(_) => Ok((GAS, Vec::new())),
    }
}

/// Address 2: SHA-256.
fn sha256(input: &[u8]) -> Result<(u64, Vec<u8>), EvmError> {
    let words = (input.len() as u64).div_ceil(32);
    let gas = 60 + 12 * words;
    let digest = Sha256::digest(input);
    Ok((gas, digest.to_vec()))
}

/// Address 4: identity.
fn identity(input: &[u8]) -> Result<(u64, Vec<u8>), EvmError> {
    let words = (input.len() as u64).div_ceil(32);
    Ok((15 + 3 * words, input.to_vec()))
}
