//! `eth_getTransactionByHash` verification: the raw transaction is proven
//! against the header's transaction root, the hash re-derived, the signature
//! recovered and every reported field cross-checked.

use ethers::types::{RecoveryMessage, Signature, H256, U256};
use ethers::utils::keccak256;
use serde_json::Value;

use veritas_types::utils::{self, parse_quantity_u256, parse_quantity_u64};

use crate::account::decode_nodes;
use crate::proof::extract_proved_value;
use crate::serialize::{chain_id_from_v, serialize_tx, tx_sighash, tx_trie_key};
use crate::{rejected, VerifyCtx, VerifyError};

/// All signatures whose s-value exceeds secp256k1n/2 are invalid (EIP-2).
const SECP256K1N_HALF: [u8; 32] = [
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46, 0x68, 0x1b,
    0x20, 0xa0,
];

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
    let nodes = decode_nodes(&envelope.merkle_proof)?;
    let raw_tx = extract_proved_value(header.tx_root, &tx_trie_key(tx_index), &nodes)
        .map_err(|err| rejected(format!("could not verify the tx proof: {err}")))?;

    if H256(keccak256(&raw_tx)) != tx_hash {
        return Err(rejected("the transactionHash is not the same as expected"));
    }

    verify_tx_values(ctx.result, &raw_tx)?;

    let reported_index = ctx
        .result
        .get("transactionIndex")
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?;
    if reported_index != Some(tx_index) {
        return Err(rejected("wrong transaction index"));
    }
    let reported_number = ctx
        .result
        .get("blockNumber")
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?;
    if reported_number != Some(header.number) {
        return Err(rejected("wrong block number"));
    }

    // Finally, the reported fields must re-serialize to the proven bytes.
    if serialize_tx(ctx.result)? != raw_tx {
        return Err(rejected("could not verify the transaction data"));
    }
    Ok(())
}

/// Field-level checks shared with the block verifier: hash, replay
/// protection, low-s rule and sender recovery.
pub(crate) fn verify_tx_values(tx: &Value, raw_tx: &[u8]) -> Result<(), VerifyError> {
    let reported_hash = tx
        .get("hash")
        .and_then(Value::as_str)
        .map(utils::parse_h256)
        .transpose()?
        .ok_or_else(|| rejected("transaction has no hash field"))?;
    if H256(keccak256(raw_tx)) != reported_hash {
        return Err(rejected("wrong transactionHash"));
    }

    let v = field_quantity(tx, "v")?;
    let r = field_quantity(tx, "r")?;
    let s = field_quantity(tx, "s")?;
    if v > U256::from(u64::MAX) {
        return Err(rejected("invalid v-value of the signature"));
    }
    let v = v.as_u64();
    let chain_id = chain_id_from_v(v);

    if let Some(reported) = tx.get("chainId").and_then(Value::as_str) {
        if parse_quantity_u64(reported)? != chain_id.unwrap_or(0) {
            return Err(rejected("wrong chainId"));
        }
    }

    if s > U256::from_big_endian(&SECP256K1N_HALF) {
        return Err(rejected("invalid s-value of the signature"));
    }

    let sighash = tx_sighash(raw_tx, chain_id)?;
    let signature = Signature { r, s, v };
    let sender = signature
        .recover(RecoveryMessage::Hash(sighash))
        .map_err(|err| rejected(format!("could not recover signature: {err}")))?;

    let reported_from = tx
        .get("from")
        .and_then(Value::as_str)
        .map(utils::parse_h160)
        .transpose()?;
    match reported_from {
        Some(from) if from == sender => Ok(()),
        Some(_) => Err(rejected("invalid from address")),
        None => Err(rejected("transaction has no from field")),
    }
}

fn field_quantity(tx: &Value, field: &str) -> Result<U256, VerifyError> {
    let text = tx
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| rejected(format!("transaction has no {field} field")))?;
    Ok(parse_quantity_u256(text)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// The first transaction on mainnet (block 46147), with its documented
    /// signature. Its sender is 0xa1e4380a3b1f749673e270229993ee55f35663b4.
    fn first_tx() -> Value {
        json!({
            "hash": "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060",
            "nonce": "0x0",
            "gasPrice": "0x2d79883d2000",
            "gas": "0x5208",
            "to": "0x5df9b87991262f6ba471f09758cde1c0fc1de734",
            "value": "0x7a69",
            "input": "0x",
            "from": "0xa1e4380a3b1f749673e270229993ee55f35663b4",
            "v": "0x1c",
            "r": "0x88ff6cf0fefd94db46111149ae4bfc179e9b94721fffd821d38d16464b3f71d0",
            "s": "0x45e0aff800961cfce805daef7016b9b675c137a6a41a548f7b60a3484c06a33a"
        })
    }

    #[test]
    fn recovers_the_documented_sender() {
        let tx = first_tx();
        let raw = serialize_tx(&tx).unwrap();
        verify_tx_values(&tx, &raw).unwrap();
    }

    #[test]
    fn wrong_sender_is_rejected() {
        let mut tx = first_tx();
        tx["from"] = json!("0x0000000000000000000000000000000000000001");
        let raw = serialize_tx(&tx).unwrap();
        let err = verify_tx_values(&tx, &raw).unwrap_err();
        assert!(err.to_string().contains("invalid from address"));
    }

    #[test]
    fn high_s_is_rejected() {
        let mut tx = first_tx();
        // secp256k1n - 1: far above the low-s bound.
        tx["s"] = json!("0xfffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364140");
        let raw = serialize_tx(&tx).unwrap();
        let err = verify_tx_values(&tx, &raw).unwrap_err();
        assert!(err.to_string().contains("invalid s-value"));
    }

    #[test]
    fn tampered_raw_bytes_change_the_hash() {
        let tx = first_tx();
        let mut raw = serialize_tx(&tx).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let err = verify_tx_values(&tx, &raw).unwrap_err();
        assert!(err.to_string().contains("wrong transactionHash"));
    }
}
