//! Solidity ABI codec: parse a function signature, encode a call, decode the
//! result.
//!
//! Values are `serde_json::Value`s, matching how they arrive at the JSON-RPC
//! boundary: quantities and byte strings as 0x-hex, booleans as booleans,
//! composites as arrays. [`CallBuilder`] offers the typed path: it validates
//! each argument against the parsed signature before anything is encoded.

pub mod decode;
pub mod encode;
pub mod sig;

use thiserror::Error;

use veritas_types::utils::UtilsError;

pub use decode::decode_result;
pub use encode::encode_call;
pub use sig::{ArrayLen, FunctionSig, Param, ParamKind};

#[derive(Debug, Error, PartialEq)]
pub enum AbiError {
    #[error("Invalid call signature: {0}")]
    InvalidSignature(String),
    #[error("Unknown Solidity type {0}")]
    UnknownType(String),
    #[error("Wrong number of arguments: expected {expected}, got {got}")]
    WrongArgumentCount { expected: usize, got: usize },
    #[error("Argument {index} does not fit {expected}: {detail}")]
    ArgumentMismatch { index: usize, expected: String, detail: String },
    #[error("Return data too short")]
    ReturnDataTooShort,
    #[error("Value error {0}")]
    Value(#[from] UtilsError),
}

/// Typed builder replacing variadic call construction: arguments accumulate
/// and are validated against the signature as a whole when encoding.
#[derive(Debug, Clone)]
pub struct CallBuilder {
    sig: FunctionSig,
    args: Vec<serde_json::Value>,
}

impl CallBuilder {
    pub fn new(signature: &str) -> Result<Self, AbiError> {
        Ok(Self { sig: FunctionSig::parse(signature)?, args: Vec::new() })
    }

    pub fn arg(mut self, value: serde_json::Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn signature(&self) -> &FunctionSig {
        &self.sig
    }

    /// Validates and encodes the accumulated arguments into call data.
    pub fn build(&self) -> Result<Vec<u8>, AbiError> {
        encode_call(&self.sig, &self.args)
    }

    /// Decodes return data according to the signature's output tuple.
    pub fn decode(&self, data: &[u8]) -> Result<serde_json::Value, AbiError> {
        decode_result(&self.sig, data)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builder_validates_argument_count() {
        let builder = CallBuilder::new("balanceOf(address):(uint256)").unwrap();
        assert_eq!(builder.build().unwrap_err(), AbiError::WrongArgumentCount {
            expected: 1,
            got: 0
        });
        let call = builder
            .arg(json!("0xdac17f958d2ee523a2206206994597c13d831ec7"))
            .build()
            .unwrap();
        // selector + one word
        assert_eq!(call.len(), 36);
        assert_eq!(&call[..4], &hex::decode("70a08231").unwrap()[..]);
    }
}
