//! `eth_getTransactionReceipt` verification: the receipt is proven against
//! the header's receipts root, and tied to the requested transaction through
//! a second proof against the transaction root.

use ethers::types::H256;
use ethers::utils::keccak256;
use serde_json::Value;

use veritas_types::chainspec::EipFlags;
use veritas_types::utils::{self, parse_quantity_u64};

use crate::account::decode_nodes;
use crate::proof::extract_proved_value;
use crate::serialize::{serialize_receipt, tx_trie_key};
use crate::{rejected, VerifyCtx, VerifyError};

pub fn verify(ctx: &VerifyCtx) -> Result<(), VerifyError> {
    let tx_hash = utils::parse_h256(ctx.param_str(0)?)?;
    let envelope = ctx.envelope()?;

    let reported_block_hash = ctx
        .result
        .get("blockHash")
        .and_then(Value::as_str)
        .map(utils::parse_h256)
        .transpose()?;
    let header = ctx.verify_envelope_header(reported_block_hash)?;

    let tx_index = envelope
        .tx_index
        .ok_or_else(|| rejected("no transaction index in the proof"))?;
    let key = tx_trie_key(tx_index);

    // The transaction proof ties the receipt position to the requested hash.
    let tx_nodes = decode_nodes(&envelope.tx_proof)?;
    let raw_tx = extract_proved_value(header.tx_root, &key, &tx_nodes)
        .map_err(|err| rejected(format!("could not verify the tx proof: {err}")))?;
    if H256(keccak256(&raw_tx)) != tx_hash {
        return Err(rejected("the transactionHash is not the same as expected"));
    }

    let receipt_nodes = decode_nodes(&envelope.merkle_proof)?;
    let raw_receipt = extract_proved_value(header.receipts_root, &key, &receipt_nodes)
        .map_err(|err| rejected(format!("could not verify the receipt proof: {err}")))?;

    let eip658 = ctx.spec.eip_at(header.number).contains(EipFlags::EIP658);
    if serialize_receipt(ctx.result, eip658)? != raw_receipt {
        return Err(rejected("could not verify the receipt data"));
    }

    // Cross-check the reported positioning fields.
    let reported_hash = ctx
        .result
        .get("transactionHash")
        .and_then(Value::as_str)
        .map(utils::parse_h256)
        .transpose()?;
    if reported_hash != Some(tx_hash) {
        return Err(rejected("wrong transactionHash in the receipt"));
    }
    let reported_index = ctx
        .result
        .get("transactionIndex")
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?;
    if reported_index != Some(tx_index) {
        return Err(rejected("wrong transactionIndex in the receipt"));
    }
    let reported_number = ctx
        .result
        .get("blockNumber")
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?;
    if reported_number != Some(header.number) {
        return Err(rejected("wrong blockNumber in the receipt"));
    }
    Ok(())
}
