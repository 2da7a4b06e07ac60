//! Gas schedule. Costs that changed with EIP-150/160 are selected from the
//! active flag set.

use veritas_types::chainspec::EipFlags;

pub const G_ZERO: u64 = 0;
pub const G_BASE: u64 = 2;
pub const G_VERYLOW: u64 = 3;
pub const G_LOW: u64 = 5;
pub const G_MID: u64 = 8;
pub const G_HIGH: u64 = 10;
pub const G_JUMPDEST: u64 = 1;
pub const G_KECCAK: u64 = 30;
pub const G_KECCAK_WORD: u64 = 6;
pub const G_COPY_WORD: u64 = 3;
pub const G_LOG: u64 = 375;
pub const G_LOG_TOPIC: u64 = 375;
pub const G_LOG_BYTE: u64 = 8;
pub const G_SSTORE_SET: u64 = 20_000;
pub const G_SSTORE_RESET: u64 = 5_000;
pub const G_SSTORE_NOOP_NET: u64 = 200;
pub const G_CREATE: u64 = 32_000;
pub const G_CALL_VALUE: u64 = 9_000;
/// Stipend passed to the callee of a value-bearing call.
pub const G_CALL_STIPEND: u64 = 2_300;
pub const G_NEW_ACCOUNT: u64 = 25_000;
pub const G_EXP: u64 = 10;

pub fn sload(flags: EipFlags) -> u64 {
    if flags.contains(EipFlags::EIP150) {
        200
    } else {
        50
    }
}

pub fn balance(flags: EipFlags) -> u64 {
    if flags.contains(EipFlags::EIP150) {
        400
    } else {
        20
    }
}

pub fn extcode(flags: EipFlags) -> u64 {
    if flags.contains(EipFlags::EIP150) {
        700
    } else {
        20
    }
}

pub fn call(flags: EipFlags) -> u64 {
    if flags.contains(EipFlags::EIP150) {
        700
    } else {
        40
    }
}

pub fn exp_byte(flags: EipFlags) -> u64 {
    if flags.contains(EipFlags::EIP160) {
        50
    } else {
        10
    }
}

/// Total gas held by memory of `words` 32-byte words: `3·w + w²/512`.
pub fn memory_total(words: u64) -> u64 {
    3 * words + words * words / 512
}

/// Gas to expand memory from `old_words` to `new_words`.
pub fn memory_expansion(old_words: u64, new_words: u64) -> u64 {
    if new_words <= old_words {
        0
    } else {
        memory_total(new_words) - memory_total(old_words)
    }
}

/// Word-granular cost of copying `len` bytes.
pub fn copy_cost(len: usize) -> u64 {
    G_COPY_WORD * (len as u64).div_ceil(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_gas_is_quadratic() {
        assert_eq!(memory_total(0), 0);
        assert_eq!(memory_total(1), 3);
        assert_eq!(memory_total(512), 3 * 512 + 512);
        assert_eq!(memory_expansion(1, 1), 0);
        assert_eq!(memory_expansion(0, 2), 6);
        assert_eq!(memory_expansion(2, 1), 0);
    }

    #[test]
    fn eip150_raises_io_costs() {
        assert_eq!(sload(EipFlags::empty()), 50);
        assert_eq!(sload(EipFlags::EIP150), 200);
        assert_eq!(call(EipFlags::EIP150), 700);
        assert_eq!(exp_byte(EipFlags::EIP160), 50);
    }
}
