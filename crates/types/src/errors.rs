//! Stable error codes surfaced at the public API boundary.

use thiserror::Error;

/// Coarse error classification carried alongside the descriptive message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    Unknown,
    NoMem,
    Invalid,
    NotFound,
    /// Cached blob was written by an incompatible version.
    BadVersion,
    /// Response data had an unexpected shape.
    BadData,
    /// Node returned a JSON-RPC error object.
    Rpc,
    /// Node returned neither result nor error.
    RpcNoResult,
    Unsupported,
}

/// Error returned by the public API: a code plus the aggregated trail of
/// failures the send loop observed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ClientError {
    pub code: ErrorCode,
    pub message: String,
}

impl ClientError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Invalid, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }
}
