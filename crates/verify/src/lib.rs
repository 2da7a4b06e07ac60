//! Response verification: every JSON-RPC answer from an untrusted node is
//! checked against the proof envelope it carries before the client accepts
//! it.
//!
//! [`verify_response`] dispatches on the request method. Verifiers are pure:
//! they read the request, the result and the envelope, and either return
//! `Ok(())` or a descriptive error. Blacklisting the offending node is the
//! send loop's job, never the verifier's.

pub mod account;
pub mod block;
pub mod call;
pub mod header;
pub mod logs;
pub mod node;
pub mod nodelist;
pub mod path;
pub mod proof;
pub mod receipt;
pub mod serialize;
pub mod transaction;

use ethers::types::{H160, H256};
use ethers::utils::keccak256;
use serde_json::Value;
use thiserror::Error;

use veritas_evm::EvmError;
use veritas_types::chainspec::ChainSpec;
use veritas_types::config::Verification;
use veritas_types::envelope::ProofEnvelope;
use veritas_types::utils::{self, UtilsError};

use crate::header::{BlockHeader, HeaderError};
use crate::proof::ProofError;
use crate::serialize::SerializeError;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{0}")]
    Rejected(String),
    #[error("Proof error: {0}")]
    Proof(#[from] ProofError),
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
    #[error("Serialization error: {0}")]
    Serialize(#[from] SerializeError),
    #[error("Value error: {0}")]
    Value(#[from] UtilsError),
    #[error("Execution error: {0}")]
    Evm(#[from] EvmError),
}

pub(crate) fn rejected(message: impl Into<String>) -> VerifyError {
    VerifyError::Rejected(message.into())
}

/// Everything a verifier may look at. All references — verification never
/// mutates client state.
#[derive(Clone, Copy)]
pub struct VerifyCtx<'a> {
    pub method: &'a str,
    pub params: &'a Value,
    pub result: &'a Value,
    pub proof: Option<&'a ProofEnvelope>,
    pub spec: &'a ChainSpec,
    pub chain_id: u64,
    /// Registered node addresses allowed to attest headers.
    pub node_addresses: &'a [H160],
    pub registry_contract: H160,
    pub signature_count: u8,
    pub verification: Verification,
}

impl<'a> VerifyCtx<'a> {
    pub(crate) fn envelope(&self) -> Result<&'a ProofEnvelope, VerifyError> {
        self.proof.ok_or_else(|| rejected("no proof in the response"))
    }

    /// Verifies the envelope's block header (hash, consensus, attestations)
    /// and returns it decoded.
    pub(crate) fn verify_envelope_header(
        &self,
        expected_hash: Option<H256>,
    ) -> Result<BlockHeader, VerifyError> {
        let envelope = self.envelope()?;
        let block = envelope
            .block
            .as_ref()
            .ok_or_else(|| rejected("no blockheader in the proof"))?;
        let raw = utils::hex_decode(block)?;
        Ok(header::verify_header(
            &raw,
            expected_hash,
            self.spec,
            &envelope.signatures,
            self.node_addresses,
            usize::from(self.signature_count),
        )?)
    }

    pub(crate) fn param(&self, index: usize) -> Option<&'a Value> {
        self.params.get(index)
    }

    pub(crate) fn param_str(&self, index: usize) -> Result<&'a str, VerifyError> {
        self.param(index)
            .and_then(Value::as_str)
            .ok_or_else(|| rejected(format!("parameter {index} is missing")))
    }
}

/// Verifies one response against its proof envelope. A `null` result without
/// an envelope is a valid "not found" answer and passes.
pub fn verify_response(ctx: &VerifyCtx) -> Result<(), VerifyError> {
    if ctx.verification == Verification::Never {
        return Ok(());
    }
    if ctx.result.is_null() {
        return Ok(());
    }
    match ctx.method {
        "eth_getTransactionByHash" => transaction::verify(ctx),
        "eth_getTransactionReceipt" => receipt::verify(ctx),
        "eth_getBlockByNumber" | "eth_getBlockByHash" => block::verify(ctx),
        "eth_getBalance" | "eth_getCode" | "eth_getStorageAt" | "eth_getTransactionCount" => {
            account::verify(ctx)
        }
        "eth_call" => call::verify(ctx),
        "eth_getLogs" => logs::verify(ctx),
        "eth_sendRawTransaction" => verify_sent_tx_hash(ctx),
        "in3_nodeList" => nodelist::verify(ctx),
        // Nothing provable: the answer is advisory.
        "eth_gasPrice" | "eth_blockNumber" => Ok(()),
        // Filter methods are answered locally and never reach a node.
        "eth_newFilter" | "eth_newBlockFilter" | "eth_newPendingTransactionFilter"
        | "eth_uninstallFilter" | "eth_getFilterChanges" => Ok(()),
        other => Err(rejected(format!("method {other} cannot be verified"))),
    }
}

/// `eth_sendRawTransaction`: the response must be the hash of the submitted
/// raw transaction.
fn verify_sent_tx_hash(ctx: &VerifyCtx) -> Result<(), VerifyError> {
    let raw = utils::hex_decode(ctx.param_str(0)?)?;
    let reported = ctx
        .result
        .as_str()
        .ok_or_else(|| rejected("result must be a transaction hash"))?;
    let reported = utils::parse_h256(reported)?;
    if H256(keccak256(raw)) != reported {
        return Err(rejected(
            "the transactionHash of the response does not match the raw transaction",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx<'a>(
        method: &'a str,
        params: &'a Value,
        result: &'a Value,
        spec: &'a ChainSpec,
    ) -> VerifyCtx<'a> {
        VerifyCtx {
            method,
            params,
            result,
            proof: None,
            spec,
            chain_id: 1,
            node_addresses: &[],
            registry_contract: H160::zero(),
            signature_count: 0,
            verification: Verification::Proof,
        }
    }

    #[test]
    fn never_mode_short_circuits() {
        let spec = ChainSpec::mainnet();
        let params = json!(["0xdead"]);
        let result = json!("0x1");
        let mut context = ctx("eth_getBalance", &params, &result, &spec);
        context.verification = Verification::Never;
        // Would fail without an envelope in Proof mode.
        verify_response(&context).unwrap();
        context.verification = Verification::Proof;
        assert!(verify_response(&context).is_err());
    }

    #[test]
    fn null_results_pass_without_proof() {
        let spec = ChainSpec::mainnet();
        let params = json!(["0x00"]);
        let result = Value::Null;
        verify_response(&ctx("eth_getTransactionByHash", &params, &result, &spec)).unwrap();
    }

    #[test]
    fn unknown_methods_are_rejected() {
        let spec = ChainSpec::mainnet();
        let params = json!([]);
        let result = json!("0x1");
        let err =
            verify_response(&ctx("eth_coinbase", &params, &result, &spec)).unwrap_err();
        assert!(err.to_string().contains("cannot be verified"));
    }

    #[test]
    fn raw_tx_hash_check() {
        let spec = ChainSpec::mainnet();
        let raw = "0xf86b808504a817c80082520894000000000000000000000000000000000000000080801ca0aa";
        let raw_bytes = utils::hex_decode(raw).unwrap();
        let hash = utils::hex_encode(keccak256(&raw_bytes));
        let params = json!([raw]);
        let good = json!(hash);
        verify_response(&ctx("eth_sendRawTransaction", &params, &good, &spec)).unwrap();
        let bad = json!(format!("0x{}", "11".repeat(32)));
        assert!(
            verify_response(&ctx("eth_sendRawTransaction", &params, &bad, &spec)).is_err()
        );
    }
}
