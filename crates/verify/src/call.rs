//! `eth_call` verification: every account the call touches must be proven,
//! and in FULL mode the call is replayed through the local EVM and its
//! output compared with the server's answer.

use std::collections::HashMap;

use ethers::types::{H160, H256, U256};
use serde_json::Value;

use veritas_evm::{BlockEnv, CallParams, Evm, EvmError, ExecFlags, ExecStatus, StateOracle, TxEnv};
use veritas_types::config::Verification;
use veritas_types::utils::{self, hex_decode};

use crate::account::{verify_envelope_accounts, ProvenAccount};
use crate::header::BlockHeader;
use crate::{rejected, VerifyCtx, VerifyError};

pub fn verify(ctx: &VerifyCtx) -> Result<(), VerifyError> {
    let call = ctx
        .param(0)
        .ok_or_else(|| rejected("eth_call needs a transaction parameter"))?;
    let to = call
        .get("to")
        .and_then(Value::as_str)
        .map(utils::parse_h160)
        .transpose()?
        .ok_or_else(|| rejected("eth_call without a target contract"))?;

    let header = ctx.verify_envelope_header(None)?;
    crate::account::check_requested_block(ctx, &header)?;
    let accounts = verify_envelope_accounts(ctx, &header, to)?;

    // In PROOF mode the proven accounts are all that can be checked; the
    // replay below is what FULL adds.
    if ctx.verification != Verification::Full {
        return Ok(());
    }

    let oracle = ProvenState::new(&accounts, &header);
    let flags = ctx.spec.eip_at(header.number);

    let caller = call
        .get("from")
        .and_then(Value::as_str)
        .map(utils::parse_h160)
        .transpose()?
        .unwrap_or_default();
    let value = call
        .get("value")
        .and_then(Value::as_str)
        .map(utils::parse_quantity_u256)
        .transpose()?
        .unwrap_or_default();
    let data = call
        .get("data")
        .or_else(|| call.get("input"))
        .and_then(Value::as_str)
        .map(hex_decode)
        .transpose()?
        .unwrap_or_default();
    let gas = call
        .get("gas")
        .and_then(Value::as_str)
        .map(utils::parse_quantity_u64)
        .transpose()?
        .unwrap_or(header.gas_limit);
    let gas_price = call
        .get("gasPrice")
        .and_then(Value::as_str)
        .map(utils::parse_quantity_u256)
        .transpose()?
        .unwrap_or_default();

    let outcome = Evm::call(
        &oracle,
        flags,
        // The replay may write storage internally; nothing is persisted.
        ExecFlags { static_call: false, no_finalize: true },
        TxEnv { origin: caller, gas_price },
        CallParams { address: to, code_address: to, caller, value, data, gas },
    )?;
    if outcome.status != ExecStatus::Stopped {
        return Err(rejected("the re-executed call did not succeed"));
    }

    let reported = ctx
        .result
        .as_str()
        .map(hex_decode)
        .transpose()?
        .ok_or_else(|| rejected("eth_call result must be a hex string"))?;
    if outcome.output != reported {
        return Err(rejected(
            "the result of the re-executed call does not match the response",
        ));
    }
    Ok(())
}

/// State oracle backed exclusively by proven data. Anything the execution
/// asks for that the envelope did not prove aborts the replay — a correct
/// server includes every touched account, slot and code blob.
pub struct ProvenState {
    accounts: HashMap<H160, ProvenAccount>,
    block: BlockEnv,
}

impl ProvenState {
    pub fn new(accounts: &[ProvenAccount], header: &BlockHeader) -> Self {
        let accounts = accounts
            .iter()
            .map(|account| (account.address, account.clone()))
            .collect();
        Self {
            accounts,
            block: BlockEnv {
                number: header.number,
                timestamp: header.timestamp,
                gas_limit: header.gas_limit,
                coinbase: H160::zero(),
                difficulty: header.difficulty,
            },
        }
    }

    fn account(&self, address: H160) -> Result<&ProvenAccount, EvmError> {
        self.accounts
            .get(&address)
            .ok_or_else(|| EvmError::InvalidEnv(format!("account {address:?} is not proven")))
    }
}

impl StateOracle for ProvenState {
    fn balance(&self, address: H160) -> Result<U256, EvmError> {
        Ok(self.account(address)?.balance)
    }

    fn nonce(&self, address: H160) -> Result<U256, EvmError> {
        Ok(self.account(address)?.nonce)
    }

    fn code(&self, address: H160) -> Result<Vec<u8>, EvmError> {
        let account = self.account(address)?;
        match &account.code {
            Some(code) => Ok(code.clone()),
            None if account.code_hash == veritas_types::constants::EMPTY_CODE_HASH => {
                Ok(Vec::new())
            }
            None => Err(EvmError::InvalidEnv(format!(
                "code of {address:?} is not part of the proof"
            ))),
        }
    }

    fn code_hash(&self, address: H160) -> Result<H256, EvmError> {
        Ok(self.account(address)?.code_hash)
    }

    fn storage(&self, address: H160, key: H256) -> Result<U256, EvmError> {
        let slot = U256::from_big_endian(key.as_bytes());
        self.account(address)?
            .proven_slot(slot)
            .ok_or_else(|| EvmError::InvalidEnv(format!("storage slot {key:?} is not proven")))
    }

    fn block_hash(&self, number: u64) -> Result<H256, EvmError> {
        Err(EvmError::InvalidEnv(format!(
            "no proven hash for block {number}"
        )))
    }

    fn block_env(&self) -> Result<BlockEnv, EvmError> {
        Ok(self.block.clone())
    }
}
