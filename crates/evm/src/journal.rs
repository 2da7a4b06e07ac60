//! Overlay of state changes made during execution.
//!
//! Reads fall through to the [`crate::StateOracle`] when the journal has no
//! entry. A sub-call receives a clone of the parent journal; the parent
//! adopts it when the child stops cleanly and keeps its own when the child
//! reverts.

use std::collections::HashMap;

use ethers::types::{H160, H256, U256};

#[derive(Debug, Clone, Default)]
pub struct Journal {
    storage: HashMap<(H160, H256), U256>,
    balances: HashMap<H160, U256>,
    nonces: HashMap<H160, U256>,
    codes: HashMap<H160, Vec<u8>>,
    logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub address: H160,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(&self, address: H160, key: H256) -> Option<U256> {
        self.storage.get(&(address, key)).copied()
    }

    pub fn set_storage(&mut self, address: H160, key: H256, value: U256) {
        self.storage.insert((address, key), value);
    }

    pub fn balance(&self, address: H160) -> Option<U256> {
        self.balances.get(&address).copied()
    }

    pub fn set_balance(&mut self, address: H160, value: U256) {
        self.balances.insert(address, value);
    }

    pub fn nonce(&self, address: H160) -> Option<U256> {
        self.nonces.get(&address).copied()
    }

    pub fn set_nonce(&mut self, address: H160, value: U256) {
        self.nonces.insert(address, value);
    }

    pub fn code(&self, address: H160) -> Option<&Vec<u8>> {
        self.codes.get(&address)
    }

    pub fn set_code(&mut self, address: H160, code: Vec<u8>) {
        self.codes.insert(address, code);
    }

    pub fn log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }
}
