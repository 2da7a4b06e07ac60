//! A deterministic EVM interpreter, sufficient to replay `eth_call` against
//! state witnessed by Merkle proofs.
//!
//! The interpreter is parameterised over a [`StateOracle`]: every access to
//! balances, code, storage or block data goes through that trait. The
//! trust-minimized client implements it on top of verified proofs; tests use
//! the in-memory [`oracle::MemoryOracle`].

pub mod gas;
pub mod interpreter;
pub mod journal;
pub mod memory;
pub mod oracle;
pub mod precompile;
pub mod stack;

use thiserror::Error;

pub use interpreter::{CallParams, Evm, ExecOutcome, TxEnv};
pub use journal::Journal;
pub use oracle::{BlockEnv, MemoryOracle, StateOracle};

/// Execution state of one call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Init,
    Running,
    /// Halted successfully; journal changes persist into the parent.
    Stopped,
    /// Halted with REVERT; journal changes are dropped.
    Reverted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvmError {
    #[error("no more elements on the stack")]
    EmptyStack,
    #[error("opcode 0x{0:02x} is not supported")]
    InvalidOpcode(u8),
    #[error("read past the end of a buffer")]
    BufferTooSmall,
    #[error("memory access out of addressable range")]
    IllegalMemoryAccess,
    #[error("jump destination is not a JUMPDEST")]
    InvalidJumpDest,
    #[error("push reaches past the end of the code")]
    InvalidPush,
    #[error("call opcode not allowed here, usually a state change in a static call")]
    UnsupportedCallOpcode,
    #[error("execution ran into a loop")]
    Timeout,
    #[error("the environment could not deliver data: {0}")]
    InvalidEnv(String),
    #[error("out of gas")]
    OutOfGas,
    #[error("not enough funds to transfer the requested value")]
    BalanceTooLow,
    #[error("stack limit reached")]
    StackLimit,
}

/// Mode flags of one call frame, orthogonal to the chain's EIP flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecFlags {
    /// State mutation is forbidden (STATICCALL or a read-only entry call).
    pub static_call: bool,
    /// Do not fold the frame's journal into the parent on STOP.
    pub no_finalize: bool,
}
