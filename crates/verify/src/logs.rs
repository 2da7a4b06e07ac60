//! `eth_getLogs` verification.
//!
//! Every log in the result must be backed by a receipt that is proven twice:
//! the transaction proof ties the trie position to a transaction hash, the
//! receipt proof yields the receipt RLP the log data is checked against.
//! Finally each log is re-matched against the caller's filter options, so a
//! node cannot smuggle in unrelated (but individually valid) logs. The order
//! of the server-returned array is preserved; verification never reorders.

use ethers::types::H256;
use ethers::utils::keccak256;
use rlp::Rlp;
use serde_json::Value;

use veritas_types::utils::{self, hex_decode, parse_quantity_u64};

use crate::account::decode_nodes;
use crate::header;
use crate::proof::extract_proved_value;
use crate::serialize::tx_trie_key;
use crate::{rejected, VerifyCtx, VerifyError};

/// A receipt proven under a verified header, indexed by transaction hash.
struct ProvenReceipt {
    tx_hash: H256,
    receipt_rlp: Vec<u8>,
    block_number: u64,
    block_hash: H256,
    tx_index: u64,
}

pub fn verify(ctx: &VerifyCtx) -> Result<(), VerifyError> {
    let logs = ctx
        .result
        .as_array()
        .ok_or_else(|| rejected("the result must be an array"))?;
    if logs.is_empty() {
        return Ok(());
    }
    let envelope = ctx.envelope()?;
    if envelope.log_proof.is_empty() {
        return Err(rejected("no proof for logs found"));
    }

    let mut receipts: Vec<ProvenReceipt> = Vec::with_capacity(logs.len());
    for block_proof in &envelope.log_proof {
        let raw_header = hex_decode(&block_proof.block)?;
        let block_header = header::verify_header(
            &raw_header,
            None,
            ctx.spec,
            &envelope.signatures,
            ctx.node_addresses,
            usize::from(ctx.signature_count),
        )?;
        let block_hash = block_header.hash();

        for receipt_entry in &block_proof.receipts {
            if receipts.len() == logs.len() {
                return Err(rejected("too many receipts in the proof"));
            }
            let key = tx_trie_key(receipt_entry.tx_index);

            let tx_nodes = decode_nodes(&receipt_entry.tx_proof)?;
            let raw_tx = extract_proved_value(block_header.tx_root, &key, &tx_nodes)
                .map_err(|err| rejected(format!("invalid tx merkle proof: {err}")))?;
            let tx_hash = H256(keccak256(&raw_tx));
            if utils::parse_h256(&receipt_entry.tx_hash)? != tx_hash {
                return Err(rejected("invalid tx hash"));
            }

            let receipt_nodes = decode_nodes(&receipt_entry.proof)?;
            let receipt_rlp =
                extract_proved_value(block_header.receipts_root, &key, &receipt_nodes)
                    .map_err(|err| rejected(format!("invalid receipt proof: {err}")))?;

            receipts.push(ProvenReceipt {
                tx_hash,
                receipt_rlp,
                block_number: block_header.number,
                block_hash,
                tx_index: receipt_entry.tx_index,
            });
        }
    }
    if receipts.len() != logs.len() {
        return Err(rejected("invalid receipts len in proof"));
    }

    let options = ctx.param(0).cloned().unwrap_or(Value::Null);
    for log in logs {
        verify_log(log, &receipts)?;
        if !matches_filter(log, &options)? {
            return Err(rejected("filter mismatch"));
        }
    }
    Ok(())
}

/// Checks one reported log against the receipt RLP it claims to come from.
fn verify_log(log: &Value, receipts: &[ProvenReceipt]) -> Result<(), VerifyError> {
    let tx_hash = log
        .get("transactionHash")
        .and_then(Value::as_str)
        .map(utils::parse_h256)
        .transpose()?
        .ok_or_else(|| rejected("log has no transactionHash"))?;
    let receipt = receipts
        .iter()
        .find(|receipt| receipt.tx_hash == tx_hash)
        .ok_or_else(|| rejected("missing proof for log"))?;

    // receipt = [status_or_root, cumulative_gas, bloom, logs]
    let decoded = Rlp::new(&receipt.receipt_rlp);
    let log_list = decoded
        .at(3)
        .map_err(|err| rejected(format!("invalid log-data: {err}")))?;

    let position = log
        .get("transactionLogIndex")
        .or_else(|| log.get("logIndex"))
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?
        .ok_or_else(|| rejected("log has no index"))? as usize;
    let entry = log_list
        .at(position)
        .map_err(|_| rejected("invalid log index"))?;

    // entry = [address, [topics...], data]
    let address = log
        .get("address")
        .and_then(Value::as_str)
        .map(hex_decode)
        .transpose()?
        .ok_or_else(|| rejected("log has no address"))?;
    let entry_address = entry
        .at(0)
        .and_then(|item| item.data())
        .map_err(|err| rejected(format!("invalid address in receipt: {err}")))?;
    if entry_address != address.as_slice() {
        return Err(rejected("invalid address"));
    }

    let topics = log
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| rejected("log has no topics"))?;
    let entry_topics = entry.at(1).map_err(|err| rejected(format!("invalid topics: {err}")))?;
    let topic_count = entry_topics
        .item_count()
        .map_err(|err| rejected(format!("invalid topics: {err}")))?;
    if topic_count != topics.len() {
        return Err(rejected("invalid topics len"));
    }
    for (index, topic) in topics.iter().enumerate() {
        let reported = topic
            .as_str()
            .map(utils::parse_h256)
            .transpose()?
            .ok_or_else(|| rejected("topic must be a hash"))?;
        let proven = entry_topics
            .at(index)
            .and_then(|item| item.data())
            .map_err(|err| rejected(format!("invalid topic: {err}")))?;
        if proven != reported.as_bytes() {
            return Err(rejected("invalid topic"));
        }
    }

    let data = log
        .get("data")
        .and_then(Value::as_str)
        .map(hex_decode)
        .transpose()?
        .ok_or_else(|| rejected("log has no data"))?;
    let entry_data = entry
        .at(2)
        .and_then(|item| item.data())
        .map_err(|err| rejected(format!("invalid data: {err}")))?;
    if entry_data != data.as_slice() {
        return Err(rejected("invalid data"));
    }

    // Positioning fields must match the proven receipt.
    let block_number = log
        .get("blockNumber")
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?;
    if block_number != Some(receipt.block_number) {
        return Err(rejected("invalid blocknumber"));
    }
    let block_hash = log
        .get("blockHash")
        .and_then(Value::as_str)
        .map(utils::parse_h256)
        .transpose()?;
    if block_hash != Some(receipt.block_hash) {
        return Err(rejected("invalid blockhash"));
    }
    if log.get("removed").and_then(Value::as_bool).unwrap_or(false) {
        return Err(rejected("must be removed=false"));
    }
    let tx_index = log
        .get("transactionIndex")
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?;
    if tx_index != Some(receipt.tx_index) {
        return Err(rejected("wrong transactionIndex"));
    }
    Ok(())
}

/// Re-applies the caller's filter options to a verified log.
pub(crate) fn matches_filter(log: &Value, options: &Value) -> Result<bool, VerifyError> {
    if options.is_null() {
        return Ok(true);
    }
    Ok(matches_address(log, options)?
        && matches_range(log, options)?
        && matches_topics(log, options))
}

fn matches_address(log: &Value, options: &Value) -> Result<bool, VerifyError> {
    let log_address = log.get("address").and_then(Value::as_str).unwrap_or_default();
    match options.get("address") {
        // address filter is optional
        None | Some(Value::Null) => Ok(true),
        Some(Value::String(wanted)) => Ok(same_hex(wanted, log_address)),
        Some(Value::Array(wanted)) => Ok(wanted
            .iter()
            .filter_map(Value::as_str)
            .any(|candidate| same_hex(candidate, log_address))),
        Some(_) => Ok(false),
    }
}

fn matches_range(log: &Value, options: &Value) -> Result<bool, VerifyError> {
    if let Some(block_hash) = options.get("blockHash").and_then(Value::as_str) {
        let log_hash = log.get("blockHash").and_then(Value::as_str).unwrap_or_default();
        return Ok(same_hex(block_hash, log_hash));
    }
    let Some(number) = log
        .get("blockNumber")
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?
    else {
        return Ok(false);
    };
    if let Some(from) = options.get("fromBlock").and_then(Value::as_str) {
        if from.starts_with("0x") && number < parse_quantity_u64(from)? {
            return Ok(false);
        }
    }
    if let Some(to) = options.get("toBlock").and_then(Value::as_str) {
        if to.starts_with("0x") && number > parse_quantity_u64(to)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Topic rules: `null` is a wildcard, an array is an OR, a missing position
/// matches anything.
fn matches_topics(log: &Value, options: &Value) -> bool {
    let Some(wanted) = options.get("topics").and_then(Value::as_array) else {
        return true;
    };
    let empty = Vec::new();
    let log_topics = log.get("topics").and_then(Value::as_array).unwrap_or(&empty);
    if wanted.len() > log_topics.len() {
        return false;
    }
    for (position, filter_entry) in wanted.iter().enumerate() {
        let log_topic = log_topics[position].as_str().unwrap_or_default();
        let matched = match filter_entry {
            Value::Null => true,
            Value::String(topic) => same_hex(topic, log_topic),
            Value::Array(any_of) => any_of
                .iter()
                .filter_map(Value::as_str)
                .any(|candidate| same_hex(candidate, log_topic)),
            _ => false,
        };
        if !matched {
            return false;
        }
    }
    true
}

fn same_hex(a: &str, b: &str) -> bool {
    a.trim_start_matches("0x").eq_ignore_ascii_case(b.trim_start_matches("0x"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_log() -> Value {
        json!({
            "address": "0xdac17f958d2ee523a2206206994597c13d831ec7",
            "blockNumber": "0x10",
            "blockHash": format!("0x{}", "ab".repeat(32)),
            "topics": [
                "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef",
                format!("0x{}", "01".repeat(32))
            ],
            "data": "0x",
            "removed": false
        })
    }

    #[test]
    fn wildcard_and_or_topic_matching() {
        let log = sample_log();
        // null wildcard in first position
        let options = json!({"topics": [null, format!("0x{}", "01".repeat(32))]});
        assert!(matches_filter(&log, &options).unwrap());
        // OR array
        let options = json!({"topics": [[
            format!("0x{}", "ff".repeat(32)),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        ]]});
        assert!(matches_filter(&log, &options).unwrap());
        // mismatch
        let options = json!({"topics": [format!("0x{}", "ee".repeat(32))]});
        assert!(!matches_filter(&log, &options).unwrap());
        // more filter topics than log topics
        let options = json!({"topics": [null, null, null]});
        assert!(!matches_filter(&log, &options).unwrap());
    }

    #[test]
    fn address_matching_single_and_array() {
        let log = sample_log();
        let options = json!({"address": "0xdAC17F958D2ee523a2206206994597C13D831ec7"});
        assert!(matches_filter(&log, &options).unwrap());
        let options = json!({"address": [
            "0x0000000000000000000000000000000000000001",
            "0xdac17f958d2ee523a2206206994597c13d831ec7"
        ]});
        assert!(matches_filter(&log, &options).unwrap());
        let options = json!({"address": "0x0000000000000000000000000000000000000001"});
        assert!(!matches_filter(&log, &options).unwrap());
    }

    #[test]
    fn block_range_and_hash_are_exclusive_paths() {
        let log = sample_log();
        let options = json!({"fromBlock": "0x1", "toBlock": "0x20"});
        assert!(matches_filter(&log, &options).unwrap());
        let options = json!({"fromBlock": "0x11"});
        assert!(!matches_filter(&log, &options).unwrap());
        let options = json!({"toBlock": "0xf"});
        assert!(!matches_filter(&log, &options).unwrap());
        // blockHash takes precedence over the range
        let options = json!({"blockHash": format!("0x{}", "ab".repeat(32)), "fromBlock": "0xffff"});
        assert!(matches_filter(&log, &options).unwrap());
        let options = json!({"blockHash": format!("0x{}", "cd".repeat(32))});
        assert!(!matches_filter(&log, &options).unwrap());
    }
}
