//! ABI encoding: static heads followed by dynamic tails, offsets measured
//! from the start of the enclosing tuple.

use ethers::types::U256;
use serde_json::Value;

use veritas_types::utils::hex_decode;

use crate::sig::{ArrayLen, FunctionSig, Param, ParamKind};
use crate::AbiError;

/// Encodes a full call: selector plus the argument tuple.
pub fn encode_call(sig: &FunctionSig, args: &[Value]) -> Result<Vec<u8>, AbiError> {
    if args.len() != sig.inputs.len() {
        return Err(AbiError::WrongArgumentCount {
            expected: sig.inputs.len(),
            got: args.len(),
        });
    }
    let mut out = sig.selector.to_vec();
    out.extend_from_slice(&encode_components(&sig.inputs, args)?);
    Ok(out)
}

/// Encodes a sequence of values laid out as one tuple.
pub(crate) fn encode_components(params: &[Param], values: &[Value]) -> Result<Vec<u8>, AbiError> {
    if params.len() != values.len() {
        return Err(AbiError::WrongArgumentCount {
            expected: params.len(),
            got: values.len(),
        });
    }
    let head_total: usize = params.iter().map(Param::head_size).sum();
    let mut heads = Vec::with_capacity(head_total);
    let mut tails = Vec::new();
    for (index, (param, value)) in params.iter().zip(values).enumerate() {
        let encoded = encode_value(param, value, index)?;
        if param.is_dynamic() {
            heads.extend_from_slice(&word(U256::from(head_total + tails.len())));
            tails.extend_from_slice(&encoded);
        } else {
            heads.extend_from_slice(&encoded);
        }
    }
    heads.extend_from_slice(&tails);
    Ok(heads)
}

/// Encodes one value in place (for dynamic values: the tail content).
fn encode_value(param: &Param, value: &Value, index: usize) -> Result<Vec<u8>, AbiError> {
    match param.array {
        ArrayLen::Scalar => encode_scalar(&param.kind, value, index),
        ArrayLen::Fixed(len) => {
            let elements = expect_array(value, index, param)?;
            if elements.len() != len {
                return Err(mismatch(index, param, format!("expected {len} elements")));
            }
            let element_param = Param { kind: param.kind.clone(), array: ArrayLen::Scalar };
            let element_params = vec![element_param; len];
            encode_components(&element_params, elements)
        }
        ArrayLen::Dynamic => {
            let elements = expect_array(value, index, param)?;
            let element_param = Param { kind: param.kind.clone(), array: ArrayLen::Scalar };
            let element_params = vec![element_param; elements.len()];
            let mut out = word(U256::from(elements.len())).to_vec();
            out.extend_from_slice(&encode_components(&element_params, elements)?);
            Ok(out)
        }
    }
}

fn encode_scalar(kind: &ParamKind, value: &Value, index: usize) -> Result<Vec<u8>, AbiError> {
    match kind {
        ParamKind::Uint(_) | ParamKind::Int(_) => {
            let number = parse_number(value)
                .ok_or_else(|| mismatch_kind(index, kind, "not a number"))?;
            Ok(word(number).to_vec())
        }
        ParamKind::Address => {
            let bytes = parse_bytes(value)
                .ok_or_else(|| mismatch_kind(index, kind, "not hex data"))?;
            if bytes.len() != 20 {
                return Err(mismatch_kind(index, kind, "address must be 20 bytes"));
            }
            let mut out = vec![0u8; 32];
            out[12..].copy_from_slice(&bytes);
            Ok(out)
        }
        ParamKind::Bool => {
            let flag = value
                .as_bool()
                .or_else(|| parse_number(value).map(|n| !n.is_zero()))
                .ok_or_else(|| mismatch_kind(index, kind, "not a boolean"))?;
            Ok(word(U256::from(u8::from(flag))).to_vec())
        }
        ParamKind::Bytes(0) | ParamKind::String => {
            let bytes = match kind {
                ParamKind::String => value
                    .as_str()
                    .map(|s| s.as_bytes().to_vec())
                    .ok_or_else(|| mismatch_kind(index, kind, "not a string"))?,
                _ => parse_bytes(value)
                    .ok_or_else(|| mismatch_kind(index, kind, "not hex data"))?,
            };
            let mut out = word(U256::from(bytes.len())).to_vec();
            out.extend_from_slice(&bytes);
            out.resize(32 + bytes.len().div_ceil(32) * 32, 0);
            Ok(out)
        }
        ParamKind::Bytes(width) => {
            let bytes = parse_bytes(value)
                .ok_or_else(|| mismatch_kind(index, kind, "not hex data"))?;
            if bytes.len() > *width {
                return Err(mismatch_kind(index, kind, "value wider than the type"));
            }
            // Right-padded to a full word.
            let mut out = bytes;
            out.resize(32, 0);
            Ok(out)
        }
        ParamKind::Tuple(children) => {
            let elements = value
                .as_array()
                .ok_or_else(|| mismatch_kind(index, kind, "not a tuple"))?;
            encode_components(children, elements)
        }
    }
}

fn word(value: U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

/// Quantities arrive as 0x-hex strings or JSON numbers.
fn parse_number(value: &Value) -> Option<U256> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim_start_matches("0x");
            if text.starts_with("0x") {
                U256::from_str_radix(trimmed, 16).ok()
            } else {
                U256::from_dec_str(text).ok()
            }
        }
        Value::Number(number) => number.as_u64().map(U256::from),
        _ => None,
    }
}

fn parse_bytes(value: &Value) -> Option<Vec<u8>> {
    value.as_str().and_then(|text| hex_decode(text).ok())
}

fn expect_array<'a>(
    value: &'a Value,
    index: usize,
    param: &Param,
) -> Result<&'a Vec<Value>, AbiError> {
    value.as_array().ok_or_else(|| mismatch(index, param, "not an array".to_owned()))
}

fn mismatch(index: usize, param: &Param, detail: impl Into<String>) -> AbiError {
    AbiError::ArgumentMismatch {
        index,
        expected: format!("{param:?}"),
        detail: detail.into(),
    }
}

fn mismatch_kind(index: usize, kind: &ParamKind, detail: impl Into<String>) -> AbiError {
    AbiError::ArgumentMismatch {
        index,
        expected: format!("{kind:?}"),
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn encode(signature: &str, args: &[Value]) -> String {
        let sig = FunctionSig::parse(signature).unwrap();
        hex::encode(encode_call(&sig, args).unwrap())
    }

    #[test]
    fn encodes_erc20_balance_of() {
        let encoded = encode(
            "balanceOf(address)",
            &[json!("0xdac17f958d2ee523a2206206994597c13d831ec7")],
        );
        assert_eq!(
            encoded,
            "70a08231000000000000000000000000dac17f958d2ee523a2206206994597c13d831ec7"
        );
    }

    #[test]
    fn encodes_transfer_with_number() {
        let encoded = encode(
            "transfer(address,uint256)",
            &[json!("0x0000000000000000000000000000000000000001"), json!("0x2a")],
        );
        assert_eq!(
            encoded,
            "a9059cbb0000000000000000000000000000000000000000000000000000000000000001\
             000000000000000000000000000000000000000000000000000000000000002a"
        );
    }

    /// Reference vector from the Solidity ABI documentation:
    /// sam(bytes,bool,uint256[]) with ("dave", true, [1,2,3]).
    #[test]
    fn matches_the_solidity_reference_vector() {
        let encoded = encode(
            "sam(bytes,bool,uint256[])",
            &[json!("0x64617665"), json!(true), json!(["0x1", "0x2", "0x3"])],
        );
        assert_eq!(
            encoded,
            "a5643bf2\
             0000000000000000000000000000000000000000000000000000000000000060\
             0000000000000000000000000000000000000000000000000000000000000001\
             00000000000000000000000000000000000000000000000000000000000000a0\
             0000000000000000000000000000000000000000000000000000000000000004\
             6461766500000000000000000000000000000000000000000000000000000000\
             0000000000000000000000000000000000000000000000000000000000000003\
             0000000000000000000000000000000000000000000000000000000000000001\
             0000000000000000000000000000000000000000000000000000000000000002\
             0000000000000000000000000000000000000000000000000000000000000003"
        );
    }

    #[test]
    fn static_bytes_are_right_padded() {
        let encoded = encode("f(bytes3,bool)", &[json!("0x616263"), json!(false)]);
        assert_eq!(
            encoded,
            format!(
                "{}{}{}",
                hex::encode(&ethers::utils::keccak256("f(bytes3,bool)".as_bytes())[..4]),
                "6162630000000000000000000000000000000000000000000000000000000000",
                "0000000000000000000000000000000000000000000000000000000000000000"
            )
        );
    }

    #[test]
    fn wrong_fixed_array_length_fails() {
        let sig = FunctionSig::parse("f(uint256[2])").unwrap();
        let err = encode_call(&sig, &[json!(["0x1"])]).unwrap_err();
        assert!(matches!(err, AbiError::ArgumentMismatch { .. }));
    }
}
