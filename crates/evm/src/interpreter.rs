//! The interpreter loop: one [`Evm`] per call frame.

use ethers::types::{H160, H256, U256};
use ethers::utils::keccak256;

use veritas_types::chainspec::EipFlags;

use crate::gas;
use crate::journal::{Journal, LogEntry};
use crate::memory::Memory;
use crate::oracle::StateOracle;
use crate::precompile;
use crate::stack::Stack;
use crate::{EvmError, ExecFlags, ExecStatus};

/// Upper bound on executed instructions; a loop that runs this long in an
/// `eth_call` replay is hostile.
const STEP_LIMIT: u64 = 10_000_000;
const CALL_DEPTH_LIMIT: usize = 1024;

/// Transaction-level environment, constant across frames.
#[derive(Debug, Clone, Default)]
pub struct TxEnv {
    pub origin: H160,
    pub gas_price: U256,
}

/// Parameters of one call frame.
#[derive(Debug, Clone)]
pub struct CallParams {
    /// Storage and balance context.
    pub address: H160,
    /// Where the executed code lives (differs for CALLCODE/DELEGATECALL).
    pub code_address: H160,
    pub caller: H160,
    pub value: U256,
    pub data: Vec<u8>,
    pub gas: u64,
}

/// Result of a completed frame.
#[derive(Debug)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    pub output: Vec<u8>,
    pub gas_left: u64,
    pub journal: Journal,
}

pub struct Evm<'a, O: StateOracle> {
    oracle: &'a O,
    flags: EipFlags,
    exec_flags: ExecFlags,
    tx: TxEnv,
    journal: Journal,

    stack: Stack,
    memory: Memory,
    code: Vec<u8>,
    jumpdests: Vec<bool>,
    pc: usize,

    address: H160,
    code_address: H160,
    caller: H160,
    call_value: U256,
    call_data: Vec<u8>,

    gas: u64,
    /// Output of the most recent sub-call (RETURNDATA* source).
    last_returned: Vec<u8>,
    /// Output of this frame.
    return_data: Vec<u8>,
    status: ExecStatus,
    steps: u64,
    depth: usize,
}

impl<'a, O: StateOracle> Evm<'a, O> {
    /// Runs a complete call: transfers the value, executes the code at
    /// `params.code_address` and returns the outcome with the journal of all
    /// surviving state changes.
    pub fn call(
        oracle: &'a O,
        flags: EipFlags,
        exec_flags: ExecFlags,
        tx: TxEnv,
        params: CallParams,
    ) -> Result<ExecOutcome, EvmError> {
        let journal = Journal::new();
        Self::call_inner(oracle, flags, exec_flags, tx, params, journal, 0, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn call_inner(
        oracle: &'a O,
        flags: EipFlags,
        exec_flags: ExecFlags,
        tx: TxEnv,
        params: CallParams,
        journal: Journal,
        depth: usize,
        transfer: bool,
    ) -> Result<ExecOutcome, EvmError> {
        let mut frame = Self::frame(oracle, flags, exec_flags, tx, params, journal, depth)?;
        log::trace!(
            "frame depth {depth}: {} bytes of code at {:?}, gas {}",
            frame.code.len(),
            frame.code_address,
            frame.gas
        );
        if transfer {
            frame.transfer_value(frame.caller, frame.address, frame.call_value)?;
        }
        frame.run()?;
        Ok(ExecOutcome {
            status: frame.status,
            output: frame.return_data,
            gas_left: frame.gas,
            journal: frame.journal,
        })
    }

    fn frame(
        oracle: &'a O,
        flags: EipFlags,
        exec_flags: ExecFlags,
        tx: TxEnv,
        params: CallParams,
        journal: Journal,
        depth: usize,
    ) -> Result<Self, EvmError> {
        let code = match journal.code(params.code_address) {
            Some(code) => code.clone(),
            None => oracle.code(params.code_address)?,
        };
        let jumpdests = find_jumpdests(&code);
        Ok(Self {
            oracle,
            flags,
            exec_flags,
            tx,
            journal,
            stack: Stack::new(),
            memory: Memory::new(),
            code,
            jumpdests,
            pc: 0,
            address: params.address,
            code_address: params.code_address,
            caller: params.caller,
            call_value: params.value,
            call_data: params.data,
            gas: params.gas,
            last_returned: Vec::new(),
            return_data: Vec::new(),
            status: ExecStatus::Init,
            steps: 0,
            depth,
        })
    }

    fn run(&mut self) -> Result<(), EvmError> {
        self.status = ExecStatus::Running;
        while self.status == ExecStatus::Running {
            if self.pc >= self.code.len() {
                // Running off the end of the code is an implicit STOP.
                self.status = ExecStatus::Stopped;
                break;
            }
            self.steps += 1;
            if self.steps > STEP_LIMIT {
                return Err(EvmError::Timeout);
            }
            self.step()?;
        }
        Ok(())
    }

    // -- gas and state helpers ------------------------------------------

    fn use_gas(&mut self, amount: u64) -> Result<(), EvmError> {
        if self.gas < amount {
            return Err(EvmError::OutOfGas);
        }
        self.gas -= amount;
        Ok(())
    }

    /// Expands memory to cover the access and charges the quadratic gas.
    fn touch_memory(&mut self, offset: usize, len: usize) -> Result<(), EvmError> {
        let old_words = self.memory.words();
        let new_words = self.memory.ensure(offset, len)?;
        self.use_gas(gas::memory_expansion(old_words, new_words))
    }

    fn balance_of(&self, address: H160) -> Result<U256, EvmError> {
        match self.journal.balance(address) {
            Some(balance) => Ok(balance),
            None => self.oracle.balance(address),
        }
    }

    fn storage_of(&self, address: H160, key: H256) -> Result<U256, EvmError> {
        match self.journal.storage(address, key) {
            Some(value) => Ok(value),
            None => self.oracle.storage(address, key),
        }
    }

    fn code_of(&self, address: H160) -> Result<Vec<u8>, EvmError> {
        match self.journal.code(address) {
            Some(code) => Ok(code.clone()),
            None => self.oracle.code(address),
        }
    }

    fn nonce_of(&self, address: H160) -> Result<U256, EvmError> {
        match self.journal.nonce(address) {
            Some(nonce) => Ok(nonce),
            None => self.oracle.nonce(address),
        }
    }

    fn transfer_value(&mut self, from: H160, to: H160, value: U256) -> Result<(), EvmError> {
        if value.is_zero() || from == to {
            return Ok(());
        }
        let from_balance = self.balance_of(from)?;
        if from_balance < value {
            return Err(EvmError::BalanceTooLow);
        }
        let to_balance = self.balance_of(to)?;
        self.journal.set_balance(from, from_balance - value);
        self.journal.set_balance(to, to_balance + value);
        Ok(())
    }

    fn require_mutable(&self) -> Result<(), EvmError> {
        if self.exec_flags.static_call {
            return Err(EvmError::UnsupportedCallOpcode);
        }
        Ok(())
    }

    fn require_flag(&self, flag: EipFlags, opcode: u8) -> Result<(), EvmError> {
        if !self.flags.contains(flag) {
            return Err(EvmError::InvalidOpcode(opcode));
        }
        Ok(())
    }

    // -- dispatch -------------------------------------------------------

    fn step(&mut self) -> Result<(), EvmError> {
        let opcode = self.code[self.pc];
        self.pc += 1;
        match opcode {
            0x00 => self.status = ExecStatus::Stopped,
            0x01..=0x0b => self.op_arithmetic(opcode)?,
            0x10..=0x1d => self.op_compare_bitwise(opcode)?,
            0x20 => self.op_keccak()?,
            0x30..=0x45 => self.op_environment(opcode)?,
            0x50..=0x5b => self.op_stack_memory_flow(opcode)?,
            0x60..=0x7f => self.op_push(opcode)?,
            0x80..=0x8f => {
                self.use_gas(gas::G_VERYLOW)?;
                self.stack.dup((opcode - 0x7f) as usize)?;
            }
            0x90..=0x9f => {
                self.use_gas(gas::G_VERYLOW)?;
                self.stack.swap((opcode - 0x8f) as usize)?;
            }
            0xa0..=0xa4 => self.op_log(opcode)?,
            0xf0 => self.op_create(false)?,
            0xf5 => {
                self.require_flag(EipFlags::EIP1014, 0xf5)?;
                self.op_create(true)?;
            }
            0xf1 | 0xf2 | 0xf4 | 0xfa => self.op_call(opcode)?,
            0xf3 => self.op_return(false)?,
            0xfd => {
                self.require_flag(EipFlags::EIP140, 0xfd)?;
                self.op_return(true)?;
            }
            0xff => self.op_selfdestruct()?,
            other => return Err(EvmError::InvalidOpcode(other)),
        }
        Ok(())
    }

    fn op_arithmetic(&mut self, opcode: u8) -> Result<(), EvmError> {
        match opcode {
            // ADD MUL SUB
            0x01 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(a.overflowing_add(b).0)?;
            }
            0x02 => {
                self.use_gas(gas::G_LOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(a.overflowing_mul(b).0)?;
            }
            0x03 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(a.overflowing_sub(b).0)?;
            }
            // DIV SDIV MOD SMOD
            0x04 => {
                self.use_gas(gas::G_LOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(a.checked_div(b).unwrap_or_default())?;
            }
            0x05 => {
                self.use_gas(gas::G_LOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(sdiv(a, b))?;
            }
            0x06 => {
                self.use_gas(gas::G_LOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(a.checked_rem(b).unwrap_or_default())?;
            }
            0x07 => {
                self.use_gas(gas::G_LOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(smod(a, b))?;
            }
            // ADDMOD MULMOD
            0x08 => {
                self.use_gas(gas::G_MID)?;
                let (a, b, n) = (self.stack.pop()?, self.stack.pop()?, self.stack.pop()?);
                self.stack.push(addmod(a, b, n))?;
            }
            0x09 => {
                self.use_gas(gas::G_MID)?;
                let (a, b, n) = (self.stack.pop()?, self.stack.pop()?, self.stack.pop()?);
                self.stack.push(mulmod(a, b, n))?;
            }
            // EXP
            0x0a => {
                let (base, exponent) = (self.stack.pop()?, self.stack.pop()?);
                let exponent_bytes = (exponent.bits() as u64).div_ceil(8);
                self.use_gas(gas::G_EXP + gas::exp_byte(self.flags) * exponent_bytes)?;
                self.stack.push(base.overflowing_pow(exponent).0)?;
            }
            // SIGNEXTEND
            0x0b => {
                self.use_gas(gas::G_LOW)?;
                let (byte_index, value) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(signextend(byte_index, value))?;
            }
            other => return Err(EvmError::InvalidOpcode(other)),
        }
        Ok(())
    }

    fn op_compare_bitwise(&mut self, opcode: u8) -> Result<(), EvmError> {
        match opcode {
            // LT GT SLT SGT EQ
            0x10 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push_bool(a < b)?;
            }
            0x11 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push_bool(a > b)?;
            }
            0x12 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push_bool(slt(a, b))?;
            }
            0x13 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push_bool(slt(b, a))?;
            }
            0x14 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push_bool(a == b)?;
            }
            // ISZERO
            0x15 => {
                self.use_gas(gas::G_VERYLOW)?;
                let a = self.stack.pop()?;
                self.stack.push_bool(a.is_zero())?;
            }
            // AND OR XOR NOT
            0x16 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(a & b)?;
            }
            0x17 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(a | b)?;
            }
            0x18 => {
                self.use_gas(gas::G_VERYLOW)?;
                let (a, b) = (self.stack.pop()?, self.stack.pop()?);
                self.stack.push(a ^ b)?;
            }
            0x19 => {
                self.use_gas(gas::G_VERYLOW)?;
                let a = self.stack.pop()?;
                self.stack.push(!a)?;
            }
            // BYTE
            0x1a => {
                self.use_gas(gas::G_VERYLOW)?;
                let (index, value) = (self.stack.pop()?, self.stack.pop()?);
                let result = if index < U256::from(32) {
                    U256::from(value.byte(31 - index.as_usize()))
                } else {
                    U256::zero()
                };
                self.stack.push(result)?;
            }
            // SHL SHR SAR
            0x1b | 0x1c | 0x1d => {
                self.require_flag(EipFlags::EIP145, opcode)?;
                self.use_gas(gas::G_VERYLOW)?;
                let (shift, value) = (self.stack.pop()?, self.stack.pop()?);
                let result = match opcode {
                    0x1b => {
                        if shift >= U256::from(256) {
                            U256::zero()
                        } else {
                            value << shift.as_usize()
                        }
                    }
                    0x1c => {
                        if shift >= U256::from(256) {
                            U256::zero()
                        } else {
                            value >> shift.as_usize()
                        }
                    }
                    _ => sar(shift, value),
                };
                self.stack.push(result)?;
            }
            other => return Err(EvmError::InvalidOpcode(other)),
        }
        Ok(())
    }

    fn op_keccak(&mut self) -> Result<(), EvmError> {
        let offset = self.stack.pop_usize()?;
        let len = self.stack.pop_usize()?;
        self.touch_memory(offset, len)?;
        self.use_gas(gas::G_KECCAK + gas::G_KECCAK_WORD * (len as u64).div_ceil(32))?;
        let hash = keccak256(self.memory.slice(offset, len)?);
        self.stack.push(U256::from_big_endian(&hash))?;
        Ok(())
    }

    fn op_environment(&mut self, opcode: u8) -> Result<(), EvmError> {
        match opcode {
            // ADDRESS
            0x30 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push_address(self.address)?;
            }
            // BALANCE
            0x31 => {
                self.use_gas(gas::balance(self.flags))?;
                let address = self.stack.pop_address()?;
                let balance = self.balance_of(address)?;
                self.stack.push(balance)?;
            }
            // ORIGIN CALLER CALLVALUE
            0x32 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push_address(self.tx.origin)?;
            }
            0x33 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push_address(self.caller)?;
            }
            0x34 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push(self.call_value)?;
            }
            // CALLDATALOAD CALLDATASIZE CALLDATACOPY
            0x35 => {
                self.use_gas(gas::G_VERYLOW)?;
                let offset = self.stack.pop()?;
                self.stack.push(calldata_word(&self.call_data, offset))?;
            }
            0x36 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push(U256::from(self.call_data.len()))?;
            }
            0x37 => {
                let data = self.call_data.clone();
                self.copy_to_memory(&data)?;
            }
            // CODESIZE CODECOPY
            0x38 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push(U256::from(self.code.len()))?;
            }
            0x39 => {
                let code = self.code.clone();
                self.copy_to_memory(&code)?;
            }
            // GASPRICE
            0x3a => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push(self.tx.gas_price)?;
            }
            // EXTCODESIZE EXTCODECOPY
            0x3b => {
                self.use_gas(gas::extcode(self.flags))?;
                let address = self.stack.pop_address()?;
                let code = self.code_of(address)?;
                self.stack.push(U256::from(code.len()))?;
            }
            0x3c => {
                self.use_gas(gas::extcode(self.flags))?;
                let address = self.stack.pop_address()?;
                let code = self.code_of(address)?;
                let dest = self.stack.pop_usize()?;
                let src = self.stack.pop_usize()?;
                let len = self.stack.pop_usize()?;
                self.touch_memory(dest, len)?;
                self.use_gas(gas::copy_cost(len))?;
                let tail = code.get(src.min(code.len())..).unwrap_or(&[]);
                let tail = tail.to_vec();
                self.memory.store_slice_padded(dest, len, &tail)?;
            }
            // RETURNDATASIZE RETURNDATACOPY
            0x3d => {
                self.require_flag(EipFlags::EIP211, 0x3d)?;
                self.use_gas(gas::G_BASE)?;
                self.stack.push(U256::from(self.last_returned.len()))?;
            }
            0x3e => {
                self.require_flag(EipFlags::EIP211, 0x3e)?;
                let dest = self.stack.pop_usize()?;
                let src = self.stack.pop_usize()?;
                let len = self.stack.pop_usize()?;
                self.use_gas(gas::G_VERYLOW)?;
                self.touch_memory(dest, len)?;
                self.use_gas(gas::copy_cost(len))?;
                let end = src.checked_add(len).ok_or(EvmError::BufferTooSmall)?;
                if end > self.last_returned.len() {
                    // Reading past the return buffer is a hard failure.
                    return Err(EvmError::BufferTooSmall);
                }
                let data = self.last_returned[src..end].to_vec();
                self.memory.store_slice_padded(dest, len, &data)?;
            }
            // EXTCODEHASH
            0x3f => {
                self.require_flag(EipFlags::EIP1052, 0x3f)?;
                self.use_gas(gas::extcode(self.flags))?;
                let address = self.stack.pop_address()?;
                let hash = match self.journal.code(address) {
                    Some(code) => H256(keccak256(code)),
                    None => self.oracle.code_hash(address)?,
                };
                self.stack.push_h256(hash)?;
            }
            // BLOCKHASH
            0x40 => {
                self.use_gas(20)?;
                let number = self.stack.pop()?;
                let env = self.oracle.block_env()?;
                let result = if number < U256::from(env.number)
                    && number + U256::from(256) >= U256::from(env.number)
                {
                    self.oracle.block_hash(number.as_u64())?
                } else {
                    H256::zero()
                };
                self.stack.push_h256(result)?;
            }
            // COINBASE TIMESTAMP NUMBER DIFFICULTY GASLIMIT
            0x41 => {
                self.use_gas(gas::G_BASE)?;
                let env = self.oracle.block_env()?;
                self.stack.push_address(env.coinbase)?;
            }
            0x42 => {
                self.use_gas(gas::G_BASE)?;
                let env = self.oracle.block_env()?;
                self.stack.push(U256::from(env.timestamp))?;
            }
            0x43 => {
                self.use_gas(gas::G_BASE)?;
                let env = self.oracle.block_env()?;
                self.stack.push(U256::from(env.number))?;
            }
            0x44 => {
                self.use_gas(gas::G_BASE)?;
                let env = self.oracle.block_env()?;
                self.stack.push(env.difficulty)?;
            }
            0x45 => {
                self.use_gas(gas::G_BASE)?;
                let env = self.oracle.block_env()?;
                self.stack.push(U256::from(env.gas_limit))?;
            }
            other => return Err(EvmError::InvalidOpcode(other)),
        }
        Ok(())
    }

    /// Shared CALLDATACOPY/CODECOPY body: pops dest, src, len.
    fn copy_to_memory(&mut self, source: &[u8]) -> Result<(), EvmError> {
        let dest = self.stack.pop_usize()?;
        let src = self.stack.pop_usize()?;
        let len = self.stack.pop_usize()?;
        self.use_gas(gas::G_VERYLOW)?;
        self.touch_memory(dest, len)?;
        self.use_gas(gas::copy_cost(len))?;
        let tail = source.get(src.min(source.len())..).unwrap_or(&[]);
        self.memory.store_slice_padded(dest, len, tail)?;
        Ok(())
    }

    fn op_stack_memory_flow(&mut self, opcode: u8) -> Result<(), EvmError> {
        match opcode {
            // POP
            0x50 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.pop()?;
            }
            // MLOAD MSTORE MSTORE8
            0x51 => {
                self.use_gas(gas::G_VERYLOW)?;
                let offset = self.stack.pop_usize()?;
                self.touch_memory(offset, 32)?;
                let word = self.memory.load_word(offset)?;
                self.stack.push(word)?;
            }
            0x52 => {
                self.use_gas(gas::G_VERYLOW)?;
                let offset = self.stack.pop_usize()?;
                let value = self.stack.pop()?;
                self.touch_memory(offset, 32)?;
                self.memory.store_word(offset, value)?;
            }
            0x53 => {
                self.use_gas(gas::G_VERYLOW)?;
                let offset = self.stack.pop_usize()?;
                let value = self.stack.pop()?;
                self.touch_memory(offset, 1)?;
                self.memory.store_byte(offset, value.byte(0))?;
            }
            // SLOAD
            0x54 => {
                self.use_gas(gas::sload(self.flags))?;
                let key = self.stack.pop_h256()?;
                let value = self.storage_of(self.address, key)?;
                self.stack.push(value)?;
            }
            // SSTORE
            0x55 => {
                self.require_mutable()?;
                let key = self.stack.pop_h256()?;
                let value = self.stack.pop()?;
                let current = self.storage_of(self.address, key)?;
                let cost = if self.flags.contains(EipFlags::EIP1283) && current == value {
                    gas::G_SSTORE_NOOP_NET
                } else if current.is_zero() && !value.is_zero() {
                    gas::G_SSTORE_SET
                } else {
                    gas::G_SSTORE_RESET
                };
                self.use_gas(cost)?;
                self.journal.set_storage(self.address, key, value);
            }
            // JUMP JUMPI
            0x56 => {
                self.use_gas(gas::G_MID)?;
                let dest = self.stack.pop_usize()?;
                self.jump_to(dest)?;
            }
            0x57 => {
                self.use_gas(gas::G_HIGH)?;
                let dest = self.stack.pop_usize()?;
                let condition = self.stack.pop()?;
                if !condition.is_zero() {
                    self.jump_to(dest)?;
                }
            }
            // PC MSIZE GAS
            0x58 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push(U256::from(self.pc - 1))?;
            }
            0x59 => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push(U256::from(self.memory.size()))?;
            }
            0x5a => {
                self.use_gas(gas::G_BASE)?;
                self.stack.push(U256::from(self.gas))?;
            }
            // JUMPDEST
            0x5b => {
                self.use_gas(gas::G_JUMPDEST)?;
            }
            other => return Err(EvmError::InvalidOpcode(other)),
        }
        Ok(())
    }

    fn jump_to(&mut self, dest: usize) -> Result<(), EvmError> {
        if !self.jumpdests.get(dest).copied().unwrap_or(false) {
            return Err(EvmError::InvalidJumpDest);
        }
        self.pc = dest;
        Ok(())
    }

    fn op_push(&mut self, opcode: u8) -> Result<(), EvmError> {
        self.use_gas(gas::G_VERYLOW)?;
        let len = (opcode - 0x5f) as usize;
        let end = self.pc + len;
        if end > self.code.len() {
            return Err(EvmError::InvalidPush);
        }
        let value = U256::from_big_endian(&self.code[self.pc..end]);
        self.pc = end;
        self.stack.push(value)
    }

    fn op_log(&mut self, opcode: u8) -> Result<(), EvmError> {
        self.require_mutable()?;
        let topic_count = (opcode - 0xa0) as usize;
        let offset = self.stack.pop_usize()?;
        let len = self.stack.pop_usize()?;
        self.touch_memory(offset, len)?;
        self.use_gas(
            gas::G_LOG
                + gas::G_LOG_TOPIC * topic_count as u64
                + gas::G_LOG_BYTE * len as u64,
        )?;
        let mut topics = Vec::with_capacity(topic_count);
        for _ in 0..topic_count {
            topics.push(self.stack.pop_h256()?);
        }
        let data = self.memory.slice(offset, len)?.to_vec();
        self.journal.log(LogEntry { address: self.address, topics, data });
        Ok(())
    }

    fn op_return(&mut self, revert: bool) -> Result<(), EvmError> {
        let offset = self.stack.pop_usize()?;
        let len = self.stack.pop_usize()?;
        self.touch_memory(offset, len)?;
        self.return_data = self.memory.slice(offset, len)?.to_vec();
        self.status = if revert { ExecStatus::Reverted } else { ExecStatus::Stopped };
        Ok(())
    }

    fn op_selfdestruct(&mut self) -> Result<(), EvmError> {
        self.require_mutable()?;
        self.use_gas(if self.flags.contains(EipFlags::EIP150) { 5_000 } else { 0 })?;
        let beneficiary = self.stack.pop_address()?;
        let balance = self.balance_of(self.address)?;
        self.journal.set_balance(self.address, U256::zero());
        if beneficiary != self.address {
            let existing = self.balance_of(beneficiary)?;
            self.journal.set_balance(beneficiary, existing + balance);
        }
        self.status = ExecStatus::Stopped;
        Ok(())
    }

    // -- calls and creation ---------------------------------------------

    fn op_call(&mut self, opcode: u8) -> Result<(), EvmError> {
        if opcode == 0xfa {
            self.require_flag(EipFlags::EIP214, 0xfa)?;
        }
        let gas_requested = self.stack.pop()?;
        let to = self.stack.pop_address()?;
        let value = match opcode {
            0xf1 | 0xf2 => self.stack.pop()?,
            _ => U256::zero(),
        };
        let in_offset = self.stack.pop_usize()?;
        let in_len = self.stack.pop_usize()?;
        let out_offset = self.stack.pop_usize()?;
        let out_len = self.stack.pop_usize()?;

        if opcode == 0xf1 && !value.is_zero() {
            self.require_mutable()?;
        }

        self.touch_memory(in_offset, in_len)?;
        self.touch_memory(out_offset, out_len)?;
        self.use_gas(gas::call(self.flags))?;
        if !value.is_zero() {
            self.use_gas(gas::G_CALL_VALUE)?;
        }

        // EIP-150: forward at most 63/64 of the remaining gas.
        let available = if self.flags.contains(EipFlags::EIP150) {
            self.gas - self.gas / 64
        } else {
            self.gas
        };
        let mut child_gas = if gas_requested > U256::from(available) {
            available
        } else {
            gas_requested.as_u64()
        };
        self.use_gas(child_gas)?;
        if !value.is_zero() {
            child_gas += gas::G_CALL_STIPEND;
        }

        let input = self.memory.slice(in_offset, in_len)?.to_vec();

        if self.depth + 1 >= CALL_DEPTH_LIMIT {
            self.gas += child_gas;
            self.stack.push_bool(false)?;
            self.last_returned = Vec::new();
            return Ok(());
        }

        // Precompiles execute without a frame.
        if precompile::is_precompile(to, self.flags) {
            // Value transfers to precompiles still move funds.
            if !value.is_zero() {
                self.transfer_value(self.address, to, value)?;
            }
            match precompile::execute(to, &input) {
                Ok((gas_used, output)) => {
                    if gas_used > child_gas {
                        self.gas += child_gas;
                        self.stack.push_bool(false)?;
                        self.last_returned = Vec::new();
                        return Ok(());
                    }
                    self.gas += child_gas - gas_used;
                    self.memory.store_slice_padded(
                        out_offset,
                        out_len.min(output.len()),
                        &output,
                    )?;
                    self.last_returned = output;
                    self.stack.push_bool(true)?;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        let (frame_address, frame_code, frame_caller, frame_value, static_child) = match opcode {
            // CALL
            0xf1 => (to, to, self.address, value, self.exec_flags.static_call),
            // CALLCODE runs foreign code in our own storage context.
            0xf2 => (self.address, to, self.address, value, self.exec_flags.static_call),
            // DELEGATECALL keeps caller and value of the current frame.
            0xf4 => (self.address, to, self.caller, self.call_value, self.exec_flags.static_call),
            // STATICCALL
            _ => (to, to, self.address, U256::zero(), true),
        };

        let mut child_journal = self.journal.clone();
        // Only a plain CALL transfers value to the target account.
        if opcode == 0xf1 && !value.is_zero() {
            let from_balance = self.balance_of(self.address)?;
            if from_balance < value {
                self.gas += child_gas;
                self.stack.push_bool(false)?;
                self.last_returned = Vec::new();
                return Ok(());
            }
            let to_balance = self.balance_of(to)?;
            child_journal.set_balance(self.address, from_balance - value);
            child_journal.set_balance(to, to_balance + value);
        }

        let params = CallParams {
            address: frame_address,
            code_address: frame_code,
            caller: frame_caller,
            value: frame_value,
            data: input,
            gas: child_gas,
        };
        let outcome = Evm::call_inner(
            self.oracle,
            self.flags,
            ExecFlags { static_call: static_child, no_finalize: false },
            self.tx.clone(),
            params,
            child_journal,
            self.depth + 1,
            false,
        )?;

        self.gas += outcome.gas_left;
        self.memory.store_slice_padded(
            out_offset,
            out_len.min(outcome.output.len()),
            &outcome.output,
        )?;
        self.last_returned = outcome.output;
        match outcome.status {
            ExecStatus::Stopped => {
                self.journal = outcome.journal;
                self.stack.push_bool(true)?;
            }
            _ => self.stack.push_bool(false)?,
        }
        Ok(())
    }

    fn op_create(&mut self, create2: bool) -> Result<(), EvmError> {
        self.require_mutable()?;
        self.use_gas(gas::G_CREATE)?;
        let value = self.stack.pop()?;
        let offset = self.stack.pop_usize()?;
        let len = self.stack.pop_usize()?;
        let salt = if create2 { Some(self.stack.pop_h256()?) } else { None };
        self.touch_memory(offset, len)?;
        let init_code = self.memory.slice(offset, len)?.to_vec();

        let nonce = self.nonce_of(self.address)?;
        let new_address = match salt {
            Some(salt) => create2_address(self.address, salt, &init_code),
            None => create_address(self.address, nonce),
        };
        self.journal.set_nonce(self.address, nonce + U256::one());

        if self.depth + 1 >= CALL_DEPTH_LIMIT {
            self.stack.push(U256::zero())?;
            return Ok(());
        }

        let mut child_journal = self.journal.clone();
        if !value.is_zero() {
            let from_balance = self.balance_of(self.address)?;
            if from_balance < value {
                self.stack.push(U256::zero())?;
                return Ok(());
            }
            child_journal.set_balance(self.address, from_balance - value);
            child_journal.set_balance(new_address, value);
        }
        child_journal.set_code(new_address, Vec::new());

        let child_gas = if self.flags.contains(EipFlags::EIP150) {
            self.gas - self.gas / 64
        } else {
            self.gas
        };
        self.use_gas(child_gas)?;

        let params = CallParams {
            address: new_address,
            code_address: new_address,
            caller: self.address,
            value,
            data: Vec::new(),
            gas: child_gas,
        };
        // The init code is not installed anywhere; run it as the frame code.
        let outcome = {
            let mut frame = Evm::frame(
                self.oracle,
                self.flags,
                ExecFlags::default(),
                self.tx.clone(),
                params,
                child_journal,
                self.depth + 1,
            )?;
            frame.code = init_code;
            frame.jumpdests = find_jumpdests(&frame.code);
            frame.run()?;
            ExecOutcome {
                status: frame.status,
                output: frame.return_data,
                gas_left: frame.gas,
                journal: frame.journal,
            }
        };

        self.gas += outcome.gas_left;
        match outcome.status {
            ExecStatus::Stopped => {
                if self.flags.contains(EipFlags::EIP170) && outcome.output.len() > 0x6000 {
                    self.stack.push(U256::zero())?;
                    return Ok(());
                }
                self.journal = outcome.journal;
                self.journal.set_code(new_address, outcome.output);
                self.stack.push_address(new_address)?;
            }
            _ => {
                self.last_returned = outcome.output;
                self.stack.push(U256::zero())?;
            }
        }
        Ok(())
    }
}

/// Marks every JUMPDEST that is not inside push data.
fn find_jumpdests(code: &[u8]) -> Vec<bool> {
    let mut valid = vec![false; code.len()];
    let mut index = 0;
    while index < code.len() {
        let opcode = code[index];
        if opcode == 0x5b {
            valid[index] = true;
        }
        if (0x60..=0x7f).contains(&opcode) {
            index += (opcode - 0x5f) as usize;
        }
        index += 1;
    }
    valid
}

fn calldata_word(data: &[u8], offset: U256) -> U256 {
    if offset > U256::from(u32::MAX) {
        return U256::zero();
    }
    let offset = offset.as_usize();
    let mut word = [0u8; 32];
    if offset < data.len() {
        let available = (data.len() - offset).min(32);
        word[..available].copy_from_slice(&data[offset..offset + available]);
    }
    U256::from_big_endian(&word)
}

// -- 256-bit signed helpers --------------------------------------------

fn is_negative(value: U256) -> bool {
    value.bit(255)
}

fn negate(value: U256) -> U256 {
    (!value).overflowing_add(U256::one()).0
}

fn sdiv(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let negative = is_negative(a) != is_negative(b);
    let abs_a = if is_negative(a) { negate(a) } else { a };
    let abs_b = if is_negative(b) { negate(b) } else { b };
    let quotient = abs_a / abs_b;
    if negative {
        negate(quotient)
    } else {
        quotient
    }
}

fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let abs_a = if is_negative(a) { negate(a) } else { a };
    let abs_b = if is_negative(b) { negate(b) } else { b };
    let remainder = abs_a % abs_b;
    // Result takes the sign of the dividend.
    if is_negative(a) {
        negate(remainder)
    } else {
        remainder
    }
}

fn slt(a: U256, b: U256) -> bool {
    match (is_negative(a), is_negative(b)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    }
}

fn addmod(a: U256, b: U256, n: U256) -> U256 {
    if n.is_zero() {
        return U256::zero();
    }
    let a = ethers::types::U512::from(a);
    let b = ethers::types::U512::from(b);
    let n = ethers::types::U512::from(n);
    let result = (a + b) % n;
    u512_low(result)
}

fn mulmod(a: U256, b: U256, n: U256) -> U256 {
    if n.is_zero() {
        return U256::zero();
    }
    let a = ethers::types::U512::from(a);
    let b = ethers::types::U512::from(b);
    let n = ethers::types::U512::from(n);
    let result = (a * b) % n;
    u512_low(result)
}

fn u512_low(value: ethers::types::U512) -> U256 {
    let mut bytes = [0u8; 64];
    value.to_big_endian(&mut bytes);
    U256::from_big_endian(&bytes[32..])
}

fn sar(shift: U256, value: U256) -> U256 {
    let negative = is_negative(value);
    if shift >= U256::from(256) {
        return if negative { U256::MAX } else { U256::zero() };
    }
    let shift = shift.as_usize();
    if shift == 0 || !negative {
        return value >> shift;
    }
    // Arithmetic shift: fill vacated high bits with ones.
    (value >> shift) | (U256::MAX << (256 - shift))
}

fn signextend(byte_index: U256, value: U256) -> U256 {
    if byte_index >= U256::from(31) {
        return value;
    }
    let index = byte_index.as_usize();
    let bit = index * 8 + 7;
    if value.bit(bit) {
        value | (U256::MAX << (bit + 1))
    } else {
        value & ((U256::one() << (bit + 1)) - 1)
    }
}

/// Contract address for CREATE: `keccak(rlp([sender, nonce]))[12..]`.
fn create_address(sender: H160, nonce: U256) -> H160 {
    let mut nonce_bytes = [0u8; 32];
    nonce.to_big_endian(&mut nonce_bytes);
    let first = nonce_bytes.iter().position(|b| *b != 0).unwrap_or(32);
    let mut stream = rlp::RlpStream::new_list(2);
    stream.append(&sender.as_bytes().to_vec());
    stream.append(&nonce_bytes[first..].to_vec());
    H160::from_slice(&keccak256(stream.out())[12..])
}

/// Contract address for CREATE2:
/// `keccak(0xff ‖ sender ‖ salt ‖ keccak(init_code))[12..]`.
fn create2_address(sender: H160, salt: H256, init_code: &[u8]) -> H160 {
    let mut buf = Vec::with_capacity(85);
    buf.push(0xff);
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(salt.as_bytes());
    buf.extend_from_slice(&keccak256(init_code));
    H160::from_slice(&keccak256(&buf)[12..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MemoryOracle;

    fn run_code(
        code: Vec<u8>,
        data: Vec<u8>,
        oracle: &MemoryOracle,
        flags: EipFlags,
        static_call: bool,
    ) -> Result<ExecOutcome, EvmError> {
        let contract = H160::from_low_u64_be(0xc0ffee);
        let mut oracle = oracle.clone();
        oracle.codes.insert(contract, code);
        let params = CallParams {
            address: contract,
            code_address: contract,
            caller: H160::from_low_u64_be(0xca11),
            value: U256::zero(),
            data,
            gas: 1_000_000,
        };
        Evm::call(
            &oracle,
            flags,
            ExecFlags { static_call, no_finalize: true },
            TxEnv::default(),
            params,
        )
    }

    #[test]
    fn adds_and_returns() {
        // PUSH1 2, PUSH1 3, ADD, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, RETURN
        let code = vec![
            0x60, 0x02, 0x60, 0x03, 0x01, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
        ];
        let outcome =
            run_code(code, Vec::new(), &MemoryOracle::new(), EipFlags::empty(), false).unwrap();
        assert_eq!(outcome.status, ExecStatus::Stopped);
        assert_eq!(U256::from_big_endian(&outcome.output), U256::from(5));
    }

    /// A minimal balanceOf-style lookup: hash the calldata address with the
    /// mapping slot and return the proven storage value.
    #[test]
    fn replays_a_mapping_lookup() {
        let holder = H160::from_low_u64_be(0xb0b);
        let mut slot_preimage = [0u8; 64];
        slot_preimage[12..32].copy_from_slice(holder.as_bytes());
        let slot = H256(keccak256(slot_preimage));

        let contract = H160::from_low_u64_be(0xc0ffee);
        let oracle = MemoryOracle::new().with_storage(contract, slot, U256::from(1234));

        let code = vec![
            0x60, 0x04, 0x35, // CALLDATALOAD(4)
            0x60, 0x00, 0x52, // MSTORE(0, address)
            0x60, 0x00, 0x60, 0x20, 0x52, // MSTORE(32, 0)
            0x60, 0x40, 0x60, 0x00, 0x20, // KECCAK256(0, 64)
            0x54, // SLOAD
            0x60, 0x00, 0x52, // MSTORE(0, value)
            0x60, 0x20, 0x60, 0x00, 0xf3, // RETURN(0, 32)
        ];
        let mut data = vec![0x70, 0xa0, 0x82, 0x31]; // balanceOf selector
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(holder.as_bytes());
        data.extend_from_slice(&word);

        let outcome = run_code(code, data, &oracle, EipFlags::empty(), false).unwrap();
        assert_eq!(outcome.status, ExecStatus::Stopped);
        assert_eq!(U256::from_big_endian(&outcome.output), U256::from(1234));
    }

    #[test]
    fn static_mode_rejects_state_changes() {
        // PUSH1 1, PUSH1 0, SSTORE
        let code = vec![0x60, 0x01, 0x60, 0x00, 0x55];
        let err = run_code(code.clone(), Vec::new(), &MemoryOracle::new(), EipFlags::empty(), true)
            .unwrap_err();
        assert_eq!(err, EvmError::UnsupportedCallOpcode);
        // The same code succeeds outside static mode.
        let outcome =
            run_code(code, Vec::new(), &MemoryOracle::new(), EipFlags::empty(), false).unwrap();
        assert_eq!(outcome.status, ExecStatus::Stopped);
        assert_eq!(
            outcome.journal.storage(H160::from_low_u64_be(0xc0ffee), H256::zero()),
            Some(U256::one())
        );
    }

    #[test]
    fn revert_requires_eip140() {
        // PUSH1 0, PUSH1 0, REVERT
        let code = vec![0x60, 0x00, 0x60, 0x00, 0xfd];
        let err = run_code(code.clone(), Vec::new(), &MemoryOracle::new(), EipFlags::empty(), false)
            .unwrap_err();
        assert_eq!(err, EvmError::InvalidOpcode(0xfd));
        let outcome =
            run_code(code, Vec::new(), &MemoryOracle::new(), EipFlags::EIP140, false).unwrap();
        assert_eq!(outcome.status, ExecStatus::Reverted);
    }

    #[test]
    fn shifts_are_gated_by_eip145() {
        // PUSH1 1, PUSH1 4, SHL -> 16
        let code = vec![
            0x60, 0x01, 0x60, 0x04, 0x1b, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
        ];
        let err = run_code(code.clone(), Vec::new(), &MemoryOracle::new(), EipFlags::empty(), false)
            .unwrap_err();
        assert_eq!(err, EvmError::InvalidOpcode(0x1b));
        let outcome =
            run_code(code, Vec::new(), &MemoryOracle::new(), EipFlags::EIP145, false).unwrap();
        assert_eq!(U256::from_big_endian(&outcome.output), U256::from(16));
    }

    #[test]
    fn cross_contract_call_merges_state() {
        let callee = H160::from_low_u64_be(0xca11ee);
        // Callee: SSTORE(0, 7); MSTORE(0, 99); RETURN(0, 32)
        let callee_code = vec![
            0x60, 0x07, 0x60, 0x00, 0x55, 0x60, 0x63, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60,
            0x00, 0xf3,
        ];
        // Caller: CALL(gas=0xffff, to=callee, value=0, in=(0,0), out=(0,32)),
        // then return the out buffer.
        let code = vec![
            0x60, 0x20, // out len
            0x60, 0x00, // out offset
            0x60, 0x00, // in len
            0x60, 0x00, // in offset
            0x60, 0x00, // value
            0x73, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0xca, 0x11, 0xee, // PUSH20 callee
            0x61, 0xff, 0xff, // gas
            0xf1, // CALL
            0x50, // POP success flag
            0x60, 0x20, 0x60, 0x00, 0xf3, // RETURN(0, 32)
        ];
        let oracle = MemoryOracle::new().with_code(callee, callee_code);
        let outcome = run_code(code, Vec::new(), &oracle, EipFlags::empty(), false).unwrap();
        assert_eq!(outcome.status, ExecStatus::Stopped);
        assert_eq!(U256::from_big_endian(&outcome.output), U256::from(99));
        assert_eq!(outcome.journal.storage(callee, H256::zero()), Some(U256::from(7)));
    }

    #[test]
    fn reverted_subcall_keeps_parent_state() {
        let callee = H160::from_low_u64_be(0xca11ee);
        // Callee: SSTORE(0, 7); REVERT(0, 0)
        let callee_code =
            vec![0x60, 0x07, 0x60, 0x00, 0x55, 0x60, 0x00, 0x60, 0x00, 0xfd];
        let code = vec![
            0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x60, 0x00, 0x60, 0x00, // out/in/value
            0x73, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0xca, 0x11, 0xee, // PUSH20 callee
            0x61, 0xff, 0xff, // gas
            0xf1, // CALL
            0x60, 0x00, 0x52, // MSTORE(0, success)
            0x60, 0x20, 0x60, 0x00, 0xf3, // RETURN(0, 32)
        ];
        let oracle = MemoryOracle::new().with_code(callee, callee_code);
        let outcome = run_code(code, Vec::new(), &oracle, EipFlags::EIP140, false).unwrap();
        // The call failed (flag 0) and its storage write is gone.
        assert_eq!(U256::from_big_endian(&outcome.output), U256::zero());
        assert_eq!(outcome.journal.storage(callee, H256::zero()), None);
    }

    #[test]
    fn out_of_gas_is_reported() {
        let code = vec![0x60, 0x02, 0x60, 0x03, 0x01];
        let contract = H160::from_low_u64_be(0xc0ffee);
        let oracle = MemoryOracle::new().with_code(contract, code);
        let params = CallParams {
            address: contract,
            code_address: contract,
            caller: H160::zero(),
            value: U256::zero(),
            data: Vec::new(),
            gas: 5,
        };
        let err = Evm::call(
            &oracle,
            EipFlags::empty(),
            ExecFlags::default(),
            TxEnv::default(),
            params,
        )
        .unwrap_err();
        assert_eq!(err, EvmError::OutOfGas);
    }

    #[test]
    fn invalid_jump_is_rejected() {
        // PUSH1 1, JUMP -> lands on the push data byte, not a JUMPDEST
        let code = vec![0x60, 0x01, 0x56, 0x5b];
        let err = run_code(code, Vec::new(), &MemoryOracle::new(), EipFlags::empty(), false)
            .unwrap_err();
        assert_eq!(err, EvmError::InvalidJumpDest);
    }

    #[test]
    fn signed_arithmetic_helpers() {
        let minus_one = negate(U256::one());
        let minus_two = negate(U256::from(2));
        assert_eq!(sdiv(minus_two, U256::from(2)), minus_one);
        assert_eq!(sdiv(minus_two, minus_one), U256::from(2));
        assert_eq!(smod(negate(U256::from(5)), U256::from(3)), negate(U256::from(2)));
        assert!(slt(minus_one, U256::zero()));
        assert!(!slt(U256::zero(), minus_one));
        assert_eq!(sar(U256::from(1), minus_two), minus_one);
        assert_eq!(
            signextend(U256::zero(), U256::from(0xff)),
            negate(U256::one())
        );
        assert_eq!(signextend(U256::zero(), U256::from(0x7f)), U256::from(0x7f));
    }

    #[test]
    fn addmod_mulmod_do_not_overflow() {
        assert_eq!(addmod(U256::MAX, U256::MAX, U256::from(12)), U256::from(
            (((U256::MAX % 12).as_u64() * 2) % 12)
        ));
        assert_eq!(mulmod(U256::MAX, U256::MAX, U256::from(12)), {
            let r = (U256::MAX % 12).as_u64();
            U256::from(r * r % 12)
        });
        assert_eq!(addmod(U256::one(), U256::one(), U256::zero()), U256::zero());
    }
}
