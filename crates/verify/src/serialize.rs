//! Canonical RLP serialization of consensus objects from their JSON-RPC
//! representation.
//!
//! Proof verification compares trie values byte-for-byte, so every encoder
//! here must produce exactly the bytes the network consensus produces:
//! integers as minimal big-endian (zero is the empty string), addresses and
//! hashes at fixed width, absent `to` as the empty string.

use ethers::types::{H256, U256};
use rlp::{Rlp, RlpStream};
use serde_json::Value;
use thiserror::Error;

use veritas_types::utils::{
    self, hex_decode, parse_quantity_u256, trim_leading_zeros, UtilsError,
};

#[derive(Debug, Error, PartialEq)]
pub enum SerializeError {
    #[error("Missing field {0}")]
    MissingField(&'static str),
    #[error("Field {field} error: {source}")]
    BadField { field: &'static str, source: UtilsError },
    #[error("RLP decode error {0}")]
    Decode(String),
}

impl From<rlp::DecoderError> for SerializeError {
    fn from(err: rlp::DecoderError) -> Self {
        SerializeError::Decode(err.to_string())
    }
}

fn str_field<'a>(object: &'a Value, field: &'static str) -> Result<&'a str, SerializeError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or(SerializeError::MissingField(field))
}

fn quantity_field(object: &Value, field: &'static str) -> Result<U256, SerializeError> {
    parse_quantity_u256(str_field(object, field)?)
        .map_err(|source| SerializeError::BadField { field, source })
}

fn bytes_field(object: &Value, field: &'static str) -> Result<Vec<u8>, SerializeError> {
    hex_decode(str_field(object, field)?)
        .map_err(|source| SerializeError::BadField { field, source })
}

fn append_quantity(stream: &mut RlpStream, value: U256) {
    stream.append(&utils::u256_min_be(value));
}

/// RLP of an account state entry: `[nonce, balance, storage_root, code_hash]`.
pub fn serialize_account(
    nonce: U256,
    balance: U256,
    storage_root: H256,
    code_hash: H256,
) -> Vec<u8> {
    let mut stream = RlpStream::new_list(4);
    append_quantity(&mut stream, nonce);
    append_quantity(&mut stream, balance);
    stream.append(&storage_root.as_bytes().to_vec());
    stream.append(&code_hash.as_bytes().to_vec());
    stream.out().to_vec()
}

/// RLP of a storage value as stored in the trie: the minimal big-endian
/// bytes, RLP-wrapped. A zero value is not stored at all and yields `None`.
pub fn serialize_storage_value(value: U256) -> Option<Vec<u8>> {
    if value.is_zero() {
        return None;
    }
    let mut stream = RlpStream::new();
    append_quantity(&mut stream, value);
    Some(stream.out().to_vec())
}

/// Trie key for a transaction or receipt at `index`: `rlp(index)`.
pub fn tx_trie_key(index: u64) -> Vec<u8> {
    rlp::encode(&index).to_vec()
}

/// Serializes a legacy transaction from its JSON-RPC object:
/// `[nonce, gasPrice, gas, to, value, input, v, r, s]`.
pub fn serialize_tx(tx: &Value) -> Result<Vec<u8>, SerializeError> {
    let mut stream = RlpStream::new_list(9);
    append_quantity(&mut stream, quantity_field(tx, "nonce")?);
    append_quantity(&mut stream, quantity_field(tx, "gasPrice")?);
    append_quantity(&mut stream, quantity_field(tx, "gas")?);
    match tx.get("to").and_then(Value::as_str) {
        Some(to) => {
            let to = hex_decode(to)
                .map_err(|source| SerializeError::BadField { field: "to", source })?;
            stream.append(&to);
        }
        // Contract creation: `to` is the empty string.
        None => {
            stream.append_empty_data();
        }
    }
    append_quantity(&mut stream, quantity_field(tx, "value")?);
    stream.append(&bytes_field(tx, "input")?);
    append_quantity(&mut stream, quantity_field(tx, "v")?);
    append_quantity(&mut stream, quantity_field(tx, "r")?);
    append_quantity(&mut stream, quantity_field(tx, "s")?);
    Ok(stream.out().to_vec())
}

/// Rebuilds the digest a legacy transaction was signed over, from its raw
/// RLP: the first six fields, plus `[chain_id, 0, 0]` under replay
/// protection.
pub fn tx_sighash(raw_tx: &[u8], chain_id: Option<u64>) -> Result<H256, SerializeError> {
    let decoded = Rlp::new(raw_tx);
    let item_count = decoded.item_count()?;
    if item_count != 9 {
        return Err(SerializeError::Decode(format!(
            "legacy transaction must have 9 fields, got {item_count}"
        )));
    }
    let field_count = if chain_id.is_some() { 9 } else { 6 };
    let mut stream = RlpStream::new_list(field_count);
    for index in 0..6 {
        stream.append_raw(decoded.at(index)?.as_raw(), 1);
    }
    if let Some(chain_id) = chain_id {
        stream.append(&trim_leading_zeros(&chain_id.to_be_bytes()).to_vec());
        stream.append_empty_data();
        stream.append_empty_data();
    }
    Ok(H256(ethers::utils::keccak256(stream.out())))
}

/// The EIP-155 chain id encoded in a transaction's `v`, if any.
pub fn chain_id_from_v(v: u64) -> Option<u64> {
    if v >= 35 {
        Some((v - 35) / 2)
    } else {
        None
    }
}

/// Serializes a receipt from its JSON-RPC object. Post-Byzantium receipts
/// (EIP-658) carry a status code; earlier ones an intermediate state root.
pub fn serialize_receipt(receipt: &Value, eip658: bool) -> Result<Vec<u8>, SerializeError> {
    let mut stream = RlpStream::new_list(4);
    if eip658 {
        append_quantity(&mut stream, quantity_field(receipt, "status")?);
    } else {
        stream.append(&bytes_field(receipt, "root")?);
    }
    append_quantity(&mut stream, quantity_field(receipt, "cumulativeGasUsed")?);
    stream.append(&bytes_field(receipt, "logsBloom")?);

    let logs = receipt
        .get("logs")
        .and_then(Value::as_array)
        .ok_or(SerializeError::MissingField("logs"))?;
    stream.begin_list(logs.len());
    for log in logs {
        stream.begin_list(3);
        stream.append(&bytes_field(log, "address")?);
        let topics = log
            .get("topics")
            .and_then(Value::as_array)
            .ok_or(SerializeError::MissingField("topics"))?;
        stream.begin_list(topics.len());
        for topic in topics {
            let topic = topic.as_str().ok_or(SerializeError::MissingField("topics"))?;
            let bytes = hex_decode(topic)
                .map_err(|source| SerializeError::BadField { field: "topics", source })?;
            stream.append(&bytes);
        }
        stream.append(&bytes_field(log, "data")?);
    }
    Ok(stream.out().to_vec())
}

#[cfg(test)]
mod tests {
    use ethers::utils::keccak256;
    use serde_json::json;

    use super::*;

    #[test]
    fn account_serialization_strips_leading_zeros() {
        let raw = serialize_account(
            U256::zero(),
            U256::from(0x0de0b6b3a7640000u64),
            H256::zero(),
            H256::zero(),
        );
        let decoded = Rlp::new(&raw);
        assert_eq!(decoded.item_count().unwrap(), 4);
        // nonce 0 -> empty string
        assert!(decoded.at(0).unwrap().data().unwrap().is_empty());
        // balance keeps no leading zero byte
        assert_eq!(decoded.at(1).unwrap().data().unwrap()[0], 0x0d);
    }

    #[test]
    fn storage_zero_is_not_stored() {
        assert!(serialize_storage_value(U256::zero()).is_none());
        let one = serialize_storage_value(U256::one()).unwrap();
        assert_eq!(one, vec![0x01]);
        let wide = serialize_storage_value(U256::from(0x0100)).unwrap();
        assert_eq!(wide, vec![0x82, 0x01, 0x00]);
    }

    #[test]
    fn tx_trie_keys() {
        assert_eq!(tx_trie_key(0), vec![0x80]);
        assert_eq!(tx_trie_key(1), vec![0x01]);
        assert_eq!(tx_trie_key(128), vec![0x81, 0x80]);
    }

    /// Mainnet transaction
    /// 0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060
    /// (block 46147) — the first transaction on the chain.
    #[test]
    fn serializes_the_first_mainnet_transaction() {
        let tx = json!({
            "nonce": "0x0",
            "gasPrice": "0x2d79883d2000",
            "gas": "0x5208",
            "to": "0x5df9b87991262f6ba471f09758cde1c0fc1de734",
            "value": "0x7a69",
            "input": "0x",
            "v": "0x1c",
            "r": "0x88ff6cf0fefd94db46111149ae4bfc179e9b94721fffd821d38d16464b3f71d0",
            "s": "0x45e0aff800961cfce805daef7016b9b675c137a6a41a548f7b60a3484c06a33a"
        });
        let raw = serialize_tx(&tx).unwrap();
        assert_eq!(
            hex::encode(keccak256(&raw)),
            "5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060"
        );
    }

    #[test]
    fn sighash_differs_with_replay_protection() {
        let tx = json!({
            "nonce": "0x1",
            "gasPrice": "0x3b9aca00",
            "gas": "0x5208",
            "to": "0x5df9b87991262f6ba471f09758cde1c0fc1de734",
            "value": "0x0",
            "input": "0x",
            "v": "0x25",
            "r": "0x1",
            "s": "0x1"
        });
        let raw = serialize_tx(&tx).unwrap();
        let legacy = tx_sighash(&raw, None).unwrap();
        let protected = tx_sighash(&raw, Some(1)).unwrap();
        assert_ne!(legacy, protected);
        assert_eq!(chain_id_from_v(0x25), Some(1));
        assert_eq!(chain_id_from_v(0x1b), None);
    }

    #[test]
    fn receipt_serialization_by_era() {
        let receipt = json!({
            "status": "0x1",
            "root": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
            "cumulativeGasUsed": "0x5208",
            "logsBloom": format!("0x{}", "00".repeat(256)),
            "logs": [{
                "address": "0x5df9b87991262f6ba471f09758cde1c0fc1de734",
                "topics": ["0x0000000000000000000000000000000000000000000000000000000000000001"],
                "data": "0xff"
            }]
        });
        let byzantium = serialize_receipt(&receipt, true).unwrap();
        let frontier = serialize_receipt(&receipt, false).unwrap();
        assert_ne!(byzantium, frontier);
        let decoded = Rlp::new(&byzantium);
        assert_eq!(decoded.item_count().unwrap(), 4);
        assert_eq!(decoded.at(0).unwrap().data().unwrap(), [0x01]);
        // frontier era encodes the 32-byte root instead of the status
        assert_eq!(Rlp::new(&frontier).at(0).unwrap().data().unwrap().len(), 32);
    }

    #[test]
    fn rlp_roundtrips_are_exact() {
        for value in [0u64, 1, 127, 128, 256, u64::MAX] {
            let encoded = rlp::encode(&value);
            assert_eq!(rlp::decode::<u64>(&encoded).unwrap(), value);
        }
        for bytes in [vec![], vec![0x00], vec![0x7f], vec![0x80], vec![0xab; 60]] {
            let encoded = rlp::encode(&bytes);
            assert_eq!(rlp::decode::<Vec<u8>>(&encoded).unwrap(), bytes);
        }
        let list: Vec<Vec<u8>> = vec![vec![], vec![1, 2, 3], vec![0xff; 40]];
        let encoded = rlp::encode_list::<Vec<u8>, _>(&list);
        assert_eq!(rlp::decode_list::<Vec<u8>>(&encoded), list);
    }
}
