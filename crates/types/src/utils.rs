use ethers::types::{H160, H256, U256};
use hex::FromHexError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum UtilsError {
    #[error("Hex utils error {0}")]
    HexUtils(#[from] FromHexError),
    #[error("Quantity {0} does not fit the target width")]
    QuantityTooLarge(String),
    #[error("Expected a 0x-prefixed hex string, got {0}")]
    MissingPrefix(String),
    #[error("Expected {expected} bytes, got {got}")]
    WrongLength { expected: usize, got: usize },
}

/// Converts bytes to 0x-prefixed hex string.
pub fn hex_encode<T: AsRef<[u8]>>(bytes: T) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Converts a 0x-prefixed hex string to bytes. Accepts an odd nibble count
/// by left-padding, since quantities on the wire drop leading zeros.
pub fn hex_decode<T: AsRef<str>>(string: T) -> Result<Vec<u8>, UtilsError> {
    let s = string.as_ref().trim_start_matches("0x");
    if s.len() % 2 == 0 {
        Ok(hex::decode(s)?)
    } else {
        Ok(hex::decode(format!("0{s}"))?)
    }
}

/// Parses a JSON-RPC quantity (`"0x1"`, `"0x"` is invalid but tolerated as 0).
pub fn parse_quantity_u64<T: AsRef<str>>(string: T) -> Result<u64, UtilsError> {
    let bytes = hex_decode(&string)?;
    if bytes.len() > 8 {
        return Err(UtilsError::QuantityTooLarge(string.as_ref().to_owned()));
    }
    let mut padded = [0u8; 8];
    padded[8 - bytes.len()..].copy_from_slice(&bytes);
    Ok(u64::from_be_bytes(padded))
}

/// Parses a JSON-RPC quantity into a 256 bit value.
pub fn parse_quantity_u256<T: AsRef<str>>(string: T) -> Result<U256, UtilsError> {
    let bytes = hex_decode(&string)?;
    if bytes.len() > 32 {
        return Err(UtilsError::QuantityTooLarge(string.as_ref().to_owned()));
    }
    Ok(U256::from_big_endian(&bytes))
}

/// Parses fixed 32-byte hex data, left padding short input.
pub fn parse_h256<T: AsRef<str>>(string: T) -> Result<H256, UtilsError> {
    let bytes = hex_decode(&string)?;
    if bytes.len() > 32 {
        return Err(UtilsError::WrongLength {
            expected: 32,
            got: bytes.len(),
        });
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(H256(padded))
}

/// Parses a 20-byte address.
pub fn parse_h160<T: AsRef<str>>(string: T) -> Result<H160, UtilsError> {
    let bytes = hex_decode(&string)?;
    if bytes.len() != 20 {
        return Err(UtilsError::WrongLength {
            expected: 20,
            got: bytes.len(),
        });
    }
    Ok(H160::from_slice(&bytes))
}

/// Strips leading zero bytes; the canonical form of an RLP integer.
pub fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// Minimal big-endian representation of a u64 (empty for zero).
pub fn u64_min_be(value: u64) -> Vec<u8> {
    trim_leading_zeros(&value.to_be_bytes()).to_vec()
}

/// Minimal big-endian representation of a U256 (empty for zero).
pub fn u256_min_be(value: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    trim_leading_zeros(&buf).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity_u64("0x0").unwrap(), 0);
        assert_eq!(parse_quantity_u64("0x1").unwrap(), 1);
        assert_eq!(parse_quantity_u64("0xde0b6b3a7640000").unwrap(), 10u64.pow(18));
        assert!(parse_quantity_u64("0x010203040506070809").is_err());
        assert_eq!(parse_quantity_u256("0xff").unwrap(), U256::from(255));
    }

    #[test]
    fn minimal_integer_encoding() {
        assert!(u64_min_be(0).is_empty());
        assert_eq!(u64_min_be(1), vec![1]);
        assert_eq!(u64_min_be(0x0100), vec![1, 0]);
        assert_eq!(u256_min_be(U256::from(0x1234)), vec![0x12, 0x34]);
    }

    #[test]
    fn odd_nibble_hex_is_padded() {
        assert_eq!(hex_decode("0x1").unwrap(), vec![0x01]);
        assert_eq!(hex_decode("0x123").unwrap(), vec![0x01, 0x23]);
    }
}
