//! Wire model of a JSON-RPC response and the proof envelope that accompanies
//! it.
//!
//! Servers attach everything required for local verification under the `in3`
//! key: the RLP block header, signed attestations over it, account and
//! storage proofs, and transaction/receipt proofs for log queries. Values are
//! kept as the hex strings from the wire; verifiers parse them with the
//! helpers in [`crate::utils`] so malformed data surfaces as a verification
//! failure, not a deserialization panic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One JSON-RPC response, possibly carrying a proof envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcResponse {
    pub id: Value,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(rename = "in3", skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofEnvelope>,
}

impl RpcResponse {
    /// The error as a display string, whatever shape the server chose.
    pub fn error_text(&self) -> Option<String> {
        self.error.as_ref().map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProofEnvelope {
    /// RLP-encoded block header, 0x-prefixed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
    /// Attestations over (block_hash, block_number) by registered nodes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<BlockSignature>,
    /// Account proofs against the header's state root.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountProof>,
    /// Per-block transaction/receipt proofs for `eth_getLogs`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub log_proof: Vec<LogBlockProof>,
    /// Index of the transaction the `merkle_proof` below targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_index: Option<u64>,
    /// Transaction or receipt trie proof nodes, 0x-prefixed RLP.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub merkle_proof: Vec<String>,
    /// Transaction trie proof accompanying a receipt proof, so the receipt
    /// can be tied to its transaction hash.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tx_proof: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockSignature {
    pub r: String,
    pub s: String,
    pub v: u64,
    pub block_hash: String,
    pub block: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountProof {
    pub address: String,
    pub balance: String,
    pub nonce: String,
    pub code_hash: String,
    pub storage_hash: String,
    pub account_proof: Vec<String>,
    pub storage_proof: Vec<StorageProofEntry>,
    /// Contract code, present when the request needs it (eth_getCode,
    /// eth_call).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageProofEntry {
    pub key: String,
    pub value: String,
    pub proof: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogBlockProof {
    /// RLP-encoded block header, 0x-prefixed.
    pub block: String,
    pub receipts: Vec<ReceiptProofEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReceiptProofEntry {
    pub tx_index: u64,
    pub tx_hash: String,
    /// Proof against the transaction trie root.
    pub tx_proof: Vec<String>,
    /// Proof against the receipts trie root.
    pub proof: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_proofed_response() {
        let raw = r#"{
            "id": 1,
            "jsonrpc": "2.0",
            "result": "0x0",
            "in3": {
                "block": "0xf90212a0...",
                "accounts": [{
                    "address": "0x0000000000000000000000000000000000000000",
                    "balance": "0x0",
                    "nonce": "0x0",
                    "codeHash": "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470",
                    "storageHash": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
                    "accountProof": ["0xf90211a0..."],
                    "storageProof": []
                }]
            }
        }"#;
        let response: RpcResponse = serde_json::from_str(raw).unwrap();
        let proof = response.proof.unwrap();
        assert!(proof.block.is_some());
        assert_eq!(proof.accounts.len(), 1);
        assert!(proof.accounts[0].storage_proof.is_empty());
    }

    #[test]
    fn error_text_handles_object_and_string() {
        let with_string: RpcResponse =
            serde_json::from_str(r#"{"id":1,"jsonrpc":"2.0","error":"boom"}"#).unwrap();
        assert_eq!(with_string.error_text().unwrap(), "boom");
        let with_object: RpcResponse =
            serde_json::from_str(r#"{"id":1,"jsonrpc":"2.0","error":{"code":-32000,"message":"x"}}"#)
                .unwrap();
        assert!(with_object.error_text().unwrap().contains("-32000"));
    }
}
