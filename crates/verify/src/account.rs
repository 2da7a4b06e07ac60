//! Account-state verification: `eth_getBalance`, `eth_getCode`,
//! `eth_getStorageAt` and `eth_getTransactionCount`, plus the shared
//! account/storage proof walk that the call and node-list verifiers reuse.

use ethers::types::{H160, H256, U256};
use ethers::utils::keccak256;
use serde_json::Value;

use veritas_types::constants::{EMPTY_CODE_HASH, EMPTY_STORAGE_ROOT};
use veritas_types::envelope::AccountProof;
use veritas_types::utils::{self, hex_decode};

use crate::header::BlockHeader;
use crate::proof::verify_proof;
use crate::serialize::{serialize_account, serialize_storage_value};
use crate::{rejected, VerifyCtx, VerifyError};

/// An account whose state (and requested storage slots) has been tied to a
/// verified state root.
#[derive(Debug, Clone)]
pub struct ProvenAccount {
    pub address: H160,
    pub nonce: U256,
    pub balance: U256,
    pub code_hash: H256,
    pub storage_hash: H256,
    /// Proven `(slot, value)` pairs; exclusion proofs appear with value 0.
    pub storage: Vec<(U256, U256)>,
    /// Contract code, present and hash-checked when the envelope carried it.
    pub code: Option<Vec<u8>>,
}

impl ProvenAccount {
    /// The untouched-account rule: proving non-existence requires every
    /// field at its default.
    pub fn is_empty(&self, account_start_nonce: u64) -> bool {
        self.nonce == U256::from(account_start_nonce)
            && self.balance.is_zero()
            && self.code_hash == EMPTY_CODE_HASH
            && self.storage_hash == EMPTY_STORAGE_ROOT
    }

    pub fn proven_slot(&self, slot: U256) -> Option<U256> {
        self.storage
            .iter()
            .find(|(key, _)| *key == slot)
            .map(|(_, value)| *value)
    }
}

/// Verifies one envelope account entry against the header's state root:
/// the account proof itself, every storage proof against the account's
/// storage root, and the code hash when code is attached.
pub fn verify_account_entry(
    entry: &AccountProof,
    state_root: H256,
    account_start_nonce: u64,
) -> Result<ProvenAccount, VerifyError> {
    let address = utils::parse_h160(&entry.address)?;
    let nonce = utils::parse_quantity_u256(&entry.nonce)?;
    let balance = utils::parse_quantity_u256(&entry.balance)?;
    let code_hash = utils::parse_h256(&entry.code_hash)?;
    let storage_hash = utils::parse_h256(&entry.storage_hash)?;

    let account = ProvenAccount {
        address,
        nonce,
        balance,
        code_hash,
        storage_hash,
        storage: Vec::new(),
        code: None,
    };

    let nodes = decode_nodes(&entry.account_proof)?;
    let path = keccak256(address.as_bytes());
    let expected = if account.is_empty(account_start_nonce) {
        None
    } else {
        Some(serialize_account(nonce, balance, storage_hash, code_hash))
    };
    verify_proof(state_root, &path, &nodes, expected.as_deref())
        .map_err(|err| rejected(format!("invalid account proof for {}: {err}", entry.address)))?;

    let mut storage = Vec::with_capacity(entry.storage_proof.len());
    for slot_proof in &entry.storage_proof {
        let slot = utils::parse_quantity_u256(&slot_proof.key)?;
        let value = utils::parse_quantity_u256(&slot_proof.value)?;
        let mut slot_bytes = [0u8; 32];
        slot.to_big_endian(&mut slot_bytes);
        let slot_path = keccak256(slot_bytes);
        let nodes = decode_nodes(&slot_proof.proof)?;
        let expected = serialize_storage_value(value);
        verify_proof(storage_hash, &slot_path, &nodes, expected.as_deref()).map_err(|err| {
            rejected(format!("invalid storage proof for slot {}: {err}", slot_proof.key))
        })?;
        storage.push((slot, value));
    }

    let code = match &entry.code {
        Some(code_hex) => {
            let code = hex_decode(code_hex)?;
            if H256(keccak256(&code)) != code_hash {
                return Err(rejected(format!(
                    "code in the proof does not match the codeHash of {}",
                    entry.address
                )));
            }
            Some(code)
        }
        None => None,
    };

    Ok(ProvenAccount { storage, code, ..account })
}

/// Verifies every account in the envelope and returns them, requiring the
/// account at `subject` to be among them.
pub(crate) fn verify_envelope_accounts(
    ctx: &VerifyCtx,
    header: &BlockHeader,
    subject: H160,
) -> Result<Vec<ProvenAccount>, VerifyError> {
    let envelope = ctx.envelope()?;
    if envelope.accounts.is_empty() {
        return Err(rejected("no accounts in the proof"));
    }
    let mut accounts = Vec::with_capacity(envelope.accounts.len());
    for entry in &envelope.accounts {
        accounts.push(verify_account_entry(
            entry,
            header.state_root,
            ctx.spec.account_start_nonce,
        )?);
    }
    if !accounts.iter().any(|account| account.address == subject) {
        return Err(rejected(
            "the account this request is about was not part of the proof",
        ));
    }
    Ok(accounts)
}

pub fn verify(ctx: &VerifyCtx) -> Result<(), VerifyError> {
    let header = ctx.verify_envelope_header(None)?;
    check_requested_block(ctx, &header)?;

    let subject = utils::parse_h160(ctx.param_str(0)?)?;
    let accounts = verify_envelope_accounts(ctx, &header, subject)?;
    let account = accounts
        .iter()
        .find(|account| account.address == subject)
        .ok_or_else(|| rejected("the account this request is about was not part of the proof"))?;

    match ctx.method {
        "eth_getBalance" => {
            let reported = result_quantity(ctx.result)?;
            if reported != account.balance {
                return Err(rejected("the balance in the proof is different"));
            }
        }
        "eth_getTransactionCount" => {
            let reported = result_quantity(ctx.result)?;
            if reported != account.nonce {
                return Err(rejected("the nonce in the proof is different"));
            }
        }
        "eth_getCode" => {
            let reported = ctx
                .result
                .as_str()
                .ok_or_else(|| rejected("code result must be a hex string"))?;
            let code = hex_decode(reported)?;
            if code.is_empty() {
                if account.code_hash != EMPTY_CODE_HASH {
                    return Err(rejected("the code must be empty"));
                }
            } else if H256(keccak256(&code)) != account.code_hash {
                return Err(rejected("the codehash in the proof is different"));
            }
        }
        "eth_getStorageAt" => {
            let slot = utils::parse_quantity_u256(ctx.param_str(1)?)?;
            let reported = result_quantity(ctx.result)?;
            match account.proven_slot(slot) {
                Some(value) if value == reported => {}
                Some(_) => return Err(rejected("the storage result does not match")),
                None => return Err(rejected("no storage proof for the requested slot")),
            }
        }
        other => return Err(rejected(format!("not an account method: {other}"))),
    }
    Ok(())
}

/// The header must describe the requested block, unless the caller asked for
/// a tag like `latest`.
pub(crate) fn check_requested_block(
    ctx: &VerifyCtx,
    header: &BlockHeader,
) -> Result<(), VerifyError> {
    let params = ctx.params.as_array().map(Vec::as_slice).unwrap_or(&[]);
    let Some(block_param) = params.last().and_then(Value::as_str) else {
        return Ok(());
    };
    if !block_param.starts_with("0x") {
        return Ok(());
    }
    let requested = utils::parse_quantity_u64(block_param)?;
    if requested != header.number {
        return Err(rejected("the blockheader has the wrong blocknumber"));
    }
    Ok(())
}

fn result_quantity(result: &Value) -> Result<U256, VerifyError> {
    let text = result
        .as_str()
        .ok_or_else(|| rejected("result must be a hex quantity"))?;
    Ok(utils::parse_quantity_u256(text)?)
}

pub(crate) fn decode_nodes(nodes: &[String]) -> Result<Vec<Vec<u8>>, VerifyError> {
    nodes
        .iter()
        .map(|node| hex_decode(node).map_err(VerifyError::from))
        .collect()
}
