//! Function-signature parsing.
//!
//! Accepted shape: `name(type,…)` optionally followed by `:(out,…)` (or a
//! single bare output type). Types are the Solidity elementary types plus
//! tuples and single-level arrays, e.g.
//! `swap(address,(uint256,bool)[],bytes):(uint256)`.
//!
//! The 4-byte selector is the keccak of the literal text before the `:`,
//! exactly as typed by the caller.

use ethers::utils::keccak256;

use crate::AbiError;

/// Array dimension of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLen {
    /// Not an array.
    Scalar,
    Fixed(usize),
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    /// Width in bytes (1..=32).
    Uint(usize),
    Int(usize),
    Address,
    Bool,
    /// Width in bytes; 0 means dynamic `bytes`.
    Bytes(usize),
    String,
    Tuple(Vec<Param>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub kind: ParamKind,
    pub array: ArrayLen,
}

impl Param {
    pub fn scalar(kind: ParamKind) -> Self {
        Self { kind, array: ArrayLen::Scalar }
    }

    /// A value whose encoding length is not known from the type alone.
    pub fn is_dynamic(&self) -> bool {
        match self.array {
            ArrayLen::Dynamic => true,
            ArrayLen::Fixed(_) | ArrayLen::Scalar => self.kind_is_dynamic(),
        }
    }

    fn kind_is_dynamic(&self) -> bool {
        match &self.kind {
            ParamKind::Bytes(0) | ParamKind::String => true,
            ParamKind::Tuple(children) => children.iter().any(Param::is_dynamic),
            _ => false,
        }
    }

    /// Size of this parameter's slot in the head section, in bytes.
    pub fn head_size(&self) -> usize {
        if self.is_dynamic() {
            return 32;
        }
        let single = match &self.kind {
            ParamKind::Tuple(children) => children.iter().map(Param::head_size).sum(),
            _ => 32,
        };
        match self.array {
            ArrayLen::Fixed(len) => single * len,
            _ => single,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSig {
    pub name: String,
    pub inputs: Vec<Param>,
    pub outputs: Vec<Param>,
    pub selector: [u8; 4],
}

impl FunctionSig {
    pub fn parse(signature: &str) -> Result<Self, AbiError> {
        let (call_part, out_part) = match signature.split_once(':') {
            Some((call, out)) => (call, Some(out)),
            None => (signature, None),
        };
        let open = call_part
            .find('(')
            .ok_or_else(|| AbiError::InvalidSignature(signature.to_owned()))?;
        if !call_part.ends_with(')') {
            return Err(AbiError::InvalidSignature(signature.to_owned()));
        }
        let name = call_part[..open].to_owned();
        if name.is_empty() {
            return Err(AbiError::InvalidSignature(signature.to_owned()));
        }
        let inputs = parse_param_list(&call_part[open + 1..call_part.len() - 1])?;

        let outputs = match out_part {
            None => Vec::new(),
            Some(out) => {
                let trimmed = out.trim();
                if let Some(inner) = trimmed.strip_prefix('(') {
                    let inner = inner
                        .strip_suffix(')')
                        .ok_or_else(|| AbiError::InvalidSignature(signature.to_owned()))?;
                    parse_param_list(inner)?
                } else if trimmed.is_empty() {
                    Vec::new()
                } else {
                    vec![parse_param(trimmed)?]
                }
            }
        };

        let mut selector = [0u8; 4];
        selector.copy_from_slice(&keccak256(call_part.as_bytes())[..4]);
        Ok(Self { name, inputs, outputs, selector })
    }
}

/// Splits a comma-separated parameter list, honoring tuple nesting.
fn parse_param_list(list: &str) -> Result<Vec<Param>, AbiError> {
    let mut params = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    if list.trim().is_empty() {
        return Ok(params);
    }
    for (index, character) in list.char_indices() {
        match character {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| AbiError::InvalidSignature(list.to_owned()))?;
            }
            ',' if depth == 0 => {
                params.push(parse_param(list[start..index].trim())?);
                start = index + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(AbiError::InvalidSignature(list.to_owned()));
    }
    params.push(parse_param(list[start..].trim())?);
    Ok(params)
}

fn parse_param(text: &str) -> Result<Param, AbiError> {
    // Peel one array suffix.
    let (base, array) = match text.rfind('[') {
        Some(open) if text.ends_with(']') => {
            let dimension = &text[open + 1..text.len() - 1];
            let array = if dimension.is_empty() {
                ArrayLen::Dynamic
            } else {
                ArrayLen::Fixed(
                    dimension
                        .parse::<usize>()
                        .map_err(|_| AbiError::UnknownType(text.to_owned()))?,
                )
            };
            (&text[..open], array)
        }
        _ => (text, ArrayLen::Scalar),
    };

    let kind = if let Some(inner) = base.strip_prefix('(') {
        let inner = inner
            .strip_suffix(')')
            .ok_or_else(|| AbiError::InvalidSignature(base.to_owned()))?;
        ParamKind::Tuple(parse_param_list(inner)?)
    } else if base == "address" {
        ParamKind::Address
    } else if base == "bool" {
        ParamKind::Bool
    } else if base == "string" {
        ParamKind::String
    } else if let Some(bits) = base.strip_prefix("uint") {
        ParamKind::Uint(parse_width(bits, base)?)
    } else if let Some(bits) = base.strip_prefix("int") {
        ParamKind::Int(parse_width(bits, base)?)
    } else if let Some(size) = base.strip_prefix("bytes") {
        if size.is_empty() {
            ParamKind::Bytes(0)
        } else {
            let size: usize =
                size.parse().map_err(|_| AbiError::UnknownType(base.to_owned()))?;
            if size == 0 || size > 32 {
                return Err(AbiError::UnknownType(base.to_owned()));
            }
            ParamKind::Bytes(size)
        }
    } else {
        return Err(AbiError::UnknownType(base.to_owned()));
    };
    Ok(Param { kind, array })
}

/// `uint` and `int` default to 256 bits; explicit widths must be whole bytes
/// within a word.
fn parse_width(bits: &str, full: &str) -> Result<usize, AbiError> {
    if bits.is_empty() {
        return Ok(32);
    }
    let bits: usize = bits.parse().map_err(|_| AbiError::UnknownType(full.to_owned()))?;
    if bits == 0 || bits > 256 || bits % 8 != 0 {
        return Err(AbiError::UnknownType(full.to_owned()));
    }
    Ok(bits / 8)
}
