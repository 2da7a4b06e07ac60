//! ABI decoding of return data, mirroring the encoder's layout rules.

use ethers::types::U256;
use serde_json::Value;

use veritas_types::utils::hex_encode;

use crate::sig::{ArrayLen, FunctionSig, Param, ParamKind};
use crate::AbiError;

/// Decodes return data against the signature's output tuple. A single output
/// is returned bare, multiple outputs as an array.
pub fn decode_result(sig: &FunctionSig, data: &[u8]) -> Result<Value, AbiError> {
    let mut values = decode_components(&sig.outputs, data)?;
    Ok(match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    })
}

pub(crate) fn decode_components(params: &[Param], data: &[u8]) -> Result<Vec<Value>, AbiError> {
    let mut values = Vec::with_capacity(params.len());
    let mut head_offset = 0usize;
    for param in params {
        if param.is_dynamic() {
            let tail = read_word(data, head_offset)?;
            let tail_offset = checked_usize(tail)?;
            values.push(decode_value(param, data, tail_offset)?);
            head_offset += 32;
        } else {
            values.push(decode_value(param, data, head_offset)?);
            head_offset += param.head_size();
        }
    }
    Ok(values)
}

fn decode_value(param: &Param, data: &[u8], offset: usize) -> Result<Value, AbiError> {
    match param.array {
        ArrayLen::Scalar => decode_scalar(&param.kind, data, offset),
        ArrayLen::Fixed(len) => {
            let element = Param { kind: param.kind.clone(), array: ArrayLen::Scalar };
            let elements = vec![element; len];
            let region = data.get(offset..).ok_or(AbiError::ReturnDataTooShort)?;
            Ok(Value::Array(decode_components(&elements, region)?))
        }
        ArrayLen::Dynamic => {
            let len = checked_usize(read_word(data, offset)?)?;
            let element = Param { kind: param.kind.clone(), array: ArrayLen::Scalar };
            let elements = vec![element; len];
            let region = data.get(offset + 32..).ok_or(AbiError::ReturnDataTooShort)?;
            Ok(Value::Array(decode_components(&elements, region)?))
        }
    }
}

fn decode_scalar(kind: &ParamKind, data: &[u8], offset: usize) -> Result<Value, AbiError> {
    match kind {
        ParamKind::Uint(_) | ParamKind::Int(_) => {
            let word = read_word(data, offset)?;
            Ok(Value::String(format!("{word:#x}")))
        }
        ParamKind::Address => {
            let slice = read_slice(data, offset, 32)?;
            Ok(Value::String(hex_encode(&slice[12..])))
        }
        ParamKind::Bool => {
            let word = read_word(data, offset)?;
            Ok(Value::Bool(!word.is_zero()))
        }
        ParamKind::Bytes(0) | ParamKind::String => {
            let len = checked_usize(read_word(data, offset)?)?;
            let bytes = read_slice(data, offset + 32, len)?;
            if matches!(kind, ParamKind::String) {
                Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
            } else {
                Ok(Value::String(hex_encode(bytes)))
            }
        }
        ParamKind::Bytes(width) => {
            let slice = read_slice(data, offset, 32)?;
            Ok(Value::String(hex_encode(&slice[..*width])))
        }
        ParamKind::Tuple(children) => {
            let region = data.get(offset..).ok_or(AbiError::ReturnDataTooShort)?;
            Ok(Value::Array(decode_components(children, region)?))
        }
    }
}

fn read_word(data: &[u8], offset: usize) -> Result<U256, AbiError> {
    Ok(U256::from_big_endian(read_slice(data, offset, 32)?))
}

fn read_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], AbiError> {
    let end = offset.checked_add(len).ok_or(AbiError::ReturnDataTooShort)?;
    data.get(offset..end).ok_or(AbiError::ReturnDataTooShort)
}

fn checked_usize(value: U256) -> Result<usize, AbiError> {
    if value > U256::from(u32::MAX) {
        return Err(AbiError::ReturnDataTooShort);
    }
    Ok(value.as_usize())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::encode::encode_call;

    fn roundtrip(signature: &str, args: &[Value]) -> Value {
        // Encode with the inputs, decode with a signature whose outputs are
        // the same tuple.
        let encode_sig = FunctionSig::parse(signature).unwrap();
        let encoded = encode_call(&encode_sig, args).unwrap()[4..].to_vec();
        let (_, types) = signature.split_once('(').unwrap();
        let decode_sig =
            FunctionSig::parse(&format!("out():({}", types)).unwrap();
        decode_result(&decode_sig, &encoded).unwrap()
    }

    #[test]
    fn decodes_single_uint() {
        let sig = FunctionSig::parse("balanceOf(address):(uint256)").unwrap();
        let mut data = vec![0u8; 32];
        data[31] = 0x2a;
        assert_eq!(decode_result(&sig, &data).unwrap(), json!("0x2a"));
    }

    #[test]
    fn decodes_what_the_encoder_produced() {
        let value = roundtrip(
            "f(address,uint256,bool)",
            &[
                json!("0xdac17f958d2ee523a2206206994597c13d831ec7"),
                json!("0x1234"),
                json!(true),
            ],
        );
        assert_eq!(
            value,
            json!(["0xdac17f958d2ee523a2206206994597c13d831ec7", "0x1234", true])
        );
    }

    #[test]
    fn decodes_dynamic_types() {
        let value = roundtrip(
            "f(string,uint256[],bytes)",
            &[json!("hello"), json!(["0x1", "0x2"]), json!("0xdeadbeef")],
        );
        assert_eq!(value, json!(["hello", ["0x1", "0x2"], "0xdeadbeef"]));
    }

    #[test]
    fn decodes_tuples() {
        let value = roundtrip(
            "f((address,uint256),bytes4)",
            &[
                json!(["0x0000000000000000000000000000000000000001", "0x5"]),
                json!("0x70a08231"),
            ],
        );
        assert_eq!(
            value,
            json!([["0x0000000000000000000000000000000000000001", "0x5"], "0x70a08231"])
        );
    }

    #[test]
    fn truncated_data_is_an_error() {
        let sig = FunctionSig::parse("f():(uint256)").unwrap();
        assert_eq!(
            decode_result(&sig, &[0u8; 16]).unwrap_err(),
            AbiError::ReturnDataTooShort
        );
    }
}
