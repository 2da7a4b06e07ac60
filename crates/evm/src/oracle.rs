//! The boundary between the interpreter and the world it executes against.

use std::collections::HashMap;

use ethers::types::{H160, H256, U256};
use ethers::utils::keccak256;

use crate::EvmError;

/// Block-level values exposed to the executing code.
#[derive(Debug, Clone, Default)]
pub struct BlockEnv {
    pub number: u64,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub coinbase: H160,
    pub difficulty: U256,
}

/// Source of account state, code and block data.
///
/// Implementations must be pure: the same query always returns the same
/// answer for the lifetime of one execution. The trust-minimized client backs
/// this with Merkle-proven values; missing data is an [`EvmError::InvalidEnv`]
/// and aborts the replay.
pub trait StateOracle {
    fn balance(&self, address: H160) -> Result<U256, EvmError>;
    fn nonce(&self, address: H160) -> Result<U256, EvmError>;
    fn code(&self, address: H160) -> Result<Vec<u8>, EvmError>;
    fn code_hash(&self, address: H160) -> Result<H256, EvmError>;
    fn storage(&self, address: H160, key: H256) -> Result<U256, EvmError>;
    fn block_hash(&self, number: u64) -> Result<H256, EvmError>;
    fn block_env(&self) -> Result<BlockEnv, EvmError>;
}

/// In-memory oracle for tests and offline execution.
#[derive(Debug, Clone, Default)]
pub struct MemoryOracle {
    pub balances: HashMap<H160, U256>,
    pub nonces: HashMap<H160, U256>,
    pub codes: HashMap<H160, Vec<u8>>,
    pub storage: HashMap<(H160, H256), U256>,
    pub block_hashes: HashMap<u64, H256>,
    pub block: BlockEnv,
}

impl MemoryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, address: H160, code: Vec<u8>) -> Self {
        self.codes.insert(address, code);
        self
    }

    pub fn with_storage(mut self, address: H160, key: H256, value: U256) -> Self {
        self.storage.insert((address, key), value);
        self
    }

    pub fn with_balance(mut self, address: H160, balance: U256) -> Self {
        self.balances.insert(address, balance);
        self
    }
}

impl StateOracle for MemoryOracle {
    fn balance(&self, address: H160) -> Result<U256, EvmError> {
        Ok(self.balances.get(&address).copied().unwrap_or_default())
    }

    fn nonce(&self, address: H160) -> Result<U256, EvmError> {
        Ok(self.nonces.get(&address).copied().unwrap_or_default())
    }

    fn code(&self, address: H160) -> Result<Vec<u8>, EvmError> {
        Ok(self.codes.get(&address).cloned().unwrap_or_default())
    }

    fn code_hash(&self, address: H160) -> Result<H256, EvmError> {
        Ok(H256(keccak256(self.code(address)?)))
    }

    fn storage(&self, address: H160, key: H256) -> Result<U256, EvmError> {
        Ok(self.storage.get(&(address, key)).copied().unwrap_or_default())
    }

    fn block_hash(&self, number: u64) -> Result<H256, EvmError> {
        self.block_hashes
            .get(&number)
            .copied()
            .ok_or_else(|| EvmError::InvalidEnv(format!("no hash for block {number}")))
    }

    fn block_env(&self) -> Result<BlockEnv, EvmError> {
        Ok(self.block.clone())
    }
}
