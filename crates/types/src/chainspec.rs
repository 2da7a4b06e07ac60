//! Chain specification: which protocol rules are active at which block.
//!
//! EIPs only ever activate. The flag set returned for block `b` is therefore
//! a superset of the set returned for any block `a <= b`, which the tests
//! assert for the built-in specs.

use ethers::types::H160;
use serde_json::Value;
use thiserror::Error;

use crate::utils::{self, UtilsError};

#[derive(Debug, Error, PartialEq)]
pub enum ChainSpecError {
    #[error("Chainspec JSON is missing the {0} section")]
    MissingSection(&'static str),
    #[error("Chainspec engine {0} is not supported")]
    UnknownEngine(String),
    #[error("Chainspec transitions must start at block 0")]
    NoGenesisTransition,
    #[error("Chainspec value error {0}")]
    Value(#[from] UtilsError),
}

/// Bitmask of activated EIPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct EipFlags(u32);

impl EipFlags {
    /// REVERT instruction.
    pub const EIP140: EipFlags = EipFlags(1);
    /// Bitwise shifting instructions.
    pub const EIP145: EipFlags = EipFlags(1 << 1);
    /// Gas cost changes for IO-heavy operations.
    pub const EIP150: EipFlags = EipFlags(1 << 2);
    /// Simple replay attack protection.
    pub const EIP155: EipFlags = EipFlags(1 << 3);
    /// EXP cost increase.
    pub const EIP160: EipFlags = EipFlags(1 << 4);
    /// Contract code size limit.
    pub const EIP170: EipFlags = EipFlags(1 << 5);
    /// alt_bn128 addition/multiplication precompiles.
    pub const EIP196: EipFlags = EipFlags(1 << 6);
    /// alt_bn128 pairing precompile.
    pub const EIP197: EipFlags = EipFlags(1 << 7);
    /// Big integer modular exponentiation precompile.
    pub const EIP198: EipFlags = EipFlags(1 << 8);
    /// RETURNDATASIZE and RETURNDATACOPY.
    pub const EIP211: EipFlags = EipFlags(1 << 9);
    /// STATICCALL.
    pub const EIP214: EipFlags = EipFlags(1 << 10);
    /// Transaction status code in receipts.
    pub const EIP658: EipFlags = EipFlags(1 << 11);
    /// Skinny CREATE2.
    pub const EIP1014: EipFlags = EipFlags(1 << 12);
    /// EXTCODEHASH.
    pub const EIP1052: EipFlags = EipFlags(1 << 13);
    /// Net gas metering for SSTORE.
    pub const EIP1283: EipFlags = EipFlags(1 << 14);

    pub const fn empty() -> Self {
        EipFlags(0)
    }

    pub const fn union(self, other: Self) -> Self {
        EipFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_superset_of(self, other: Self) -> bool {
        self.contains(other)
    }
}

/// Consensus engine active for a block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusKind {
    ProofOfWork,
    AuraAuthority,
    CliqueAuthority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EipTransition {
    pub block: u64,
    pub flags: EipFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusTransition {
    pub block: u64,
    pub kind: ConsensusKind,
    /// Static validator set; empty when sourced from a contract.
    pub validators: Vec<H160>,
    /// Validator contract, when the set is dynamic.
    pub contract: Option<H160>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    pub network_id: u64,
    pub account_start_nonce: u64,
    /// Sorted by block, first entry at block 0.
    pub eip_transitions: Vec<EipTransition>,
    /// Sorted by block, first entry at block 0.
    pub consensus_transitions: Vec<ConsensusTransition>,
}

impl ChainSpec {
    /// Flags of the latest transition at or below `block`.
    pub fn eip_at(&self, block: u64) -> EipFlags {
        lookup(&self.eip_transitions, block, |t| t.block)
            .map(|t| t.flags)
            .unwrap_or_default()
    }

    /// Consensus rules of the latest transition at or below `block`.
    pub fn consensus_at(&self, block: u64) -> Option<&ConsensusTransition> {
        lookup(&self.consensus_transitions, block, |t| t.block)
    }

    /// Ethereum mainnet up to the Petersburg rule set.
    pub fn mainnet() -> Self {
        let tangerine = EipFlags::EIP150;
        let spurious = tangerine
            .union(EipFlags::EIP155)
            .union(EipFlags::EIP160)
            .union(EipFlags::EIP170);
        let byzantium = spurious
            .union(EipFlags::EIP140)
            .union(EipFlags::EIP196)
            .union(EipFlags::EIP197)
            .union(EipFlags::EIP198)
            .union(EipFlags::EIP211)
            .union(EipFlags::EIP214)
            .union(EipFlags::EIP658);
        let petersburg = byzantium
            .union(EipFlags::EIP145)
            .union(EipFlags::EIP1014)
            .union(EipFlags::EIP1052);
        Self {
            network_id: 1,
            account_start_nonce: 0,
            eip_transitions: vec![
                EipTransition { block: 0, flags: EipFlags::empty() },
                EipTransition { block: 2_463_000, flags: tangerine },
                EipTransition { block: 2_675_000, flags: spurious },
                EipTransition { block: 4_370_000, flags: byzantium },
                EipTransition { block: 7_280_000, flags: petersburg },
            ],
            consensus_transitions: vec![ConsensusTransition {
                block: 0,
                kind: ConsensusKind::ProofOfWork,
                validators: Vec::new(),
                contract: None,
            }],
        }
    }

    /// Parses the parity-style chainspec JSON format: the `params` section
    /// carries `eip…Transition` keys, the `engine` section the consensus
    /// kind and validators.
    pub fn from_json(json: &Value) -> Result<Self, ChainSpecError> {
        let params = json
            .get("params")
            .and_then(Value::as_object)
            .ok_or(ChainSpecError::MissingSection("params"))?;

        let network_id = params
            .get("networkID")
            .and_then(Value::as_str)
            .map(utils::parse_quantity_u64)
            .transpose()?
            .unwrap_or(0);
        let account_start_nonce = params
            .get("accountStartNonce")
            .and_then(Value::as_str)
            .map(utils::parse_quantity_u64)
            .transpose()?
            .unwrap_or(0);

        // Collect per-EIP activation blocks and fold them into cumulative
        // transitions.
        let mut activations: Vec<(u64, EipFlags)> = Vec::new();
        for (key, flag) in [
            ("eip140Transition", EipFlags::EIP140),
            ("eip145Transition", EipFlags::EIP145),
            ("eip150Transition", EipFlags::EIP150),
            ("eip155Transition", EipFlags::EIP155),
            ("eip160Transition", EipFlags::EIP160),
            ("maxCodeSizeTransition", EipFlags::EIP170),
            ("eip196Transition", EipFlags::EIP196),
            ("eip197Transition", EipFlags::EIP197),
            ("eip198Transition", EipFlags::EIP198),
            ("eip211Transition", EipFlags::EIP211),
            ("eip214Transition", EipFlags::EIP214),
            ("eip658Transition", EipFlags::EIP658),
            ("eip1014Transition", EipFlags::EIP1014),
            ("eip1052Transition", EipFlags::EIP1052),
            ("eip1283Transition", EipFlags::EIP1283),
        ] {
            if let Some(block) = params.get(key).and_then(Value::as_str) {
                activations.push((utils::parse_quantity_u64(block)?, flag));
            }
        }
        activations.sort_by_key(|(block, _)| *block);

        let mut eip_transitions = vec![EipTransition { block: 0, flags: EipFlags::empty() }];
        let mut current = EipFlags::empty();
        for (block, flag) in activations {
            current = current.union(flag);
            match eip_transitions.last_mut() {
                Some(last) if last.block == block => last.flags = current,
                _ => eip_transitions.push(EipTransition { block, flags: current }),
            }
        }

        let engine = json
            .get("engine")
            .and_then(Value::as_object)
            .ok_or(ChainSpecError::MissingSection("engine"))?;
        let consensus = if engine.contains_key("Ethash") || engine.contains_key("ethash") {
            ConsensusTransition {
                block: 0,
                kind: ConsensusKind::ProofOfWork,
                validators: Vec::new(),
                contract: None,
            }
        } else if let Some(aura) = engine.get("authorityRound").or_else(|| engine.get("Aura")) {
            parse_authority(aura, ConsensusKind::AuraAuthority)?
        } else if let Some(clique) = engine.get("clique").or_else(|| engine.get("Clique")) {
            parse_authority(clique, ConsensusKind::CliqueAuthority)?
        } else {
            let name = engine.keys().next().cloned().unwrap_or_default();
            return Err(ChainSpecError::UnknownEngine(name));
        };

        Ok(Self {
            network_id,
            account_start_nonce,
            eip_transitions,
            consensus_transitions: vec![consensus],
        })
    }
}

fn parse_authority(
    engine: &Value,
    kind: ConsensusKind,
) -> Result<ConsensusTransition, ChainSpecError> {
    let validators_value = engine
        .get("params")
        .and_then(|p| p.get("validators"))
        .cloned()
        .unwrap_or(Value::Null);
    let mut validators = Vec::new();
    let mut contract = None;
    if let Some(list) = validators_value.get("list").and_then(Value::as_array) {
        for entry in list {
            if let Some(address) = entry.as_str() {
                validators.push(utils::parse_h160(address)?);
            }
        }
    } else if let Some(address) = validators_value
        .get("contract")
        .or_else(|| validators_value.get("safeContract"))
        .and_then(Value::as_str)
    {
        contract = Some(utils::parse_h160(address)?);
    }
    Ok(ConsensusTransition { block: 0, kind, validators, contract })
}

fn lookup<T>(transitions: &[T], block: u64, key: impl Fn(&T) -> u64) -> Option<&T> {
    transitions.iter().rev().find(|t| key(t) <= block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mainnet_lookup_picks_latest_transition() {
        let spec = ChainSpec::mainnet();
        assert_eq!(spec.eip_at(0), EipFlags::empty());
        assert!(spec.eip_at(2_463_000).contains(EipFlags::EIP150));
        assert!(!spec.eip_at(2_462_999).contains(EipFlags::EIP150));
        assert!(spec.eip_at(4_370_000).contains(EipFlags::EIP140));
        assert!(spec.eip_at(8_000_000).contains(EipFlags::EIP1014));
    }

    #[test]
    fn eip_flags_are_monotone() {
        let spec = ChainSpec::mainnet();
        let checkpoints =
            [0u64, 1, 2_463_000, 2_675_000, 4_000_000, 4_370_000, 7_280_000, 10_000_000];
        for window in checkpoints.windows(2) {
            let earlier = spec.eip_at(window[0]);
            let later = spec.eip_at(window[1]);
            assert!(later.is_superset_of(earlier), "flags deactivated between blocks");
        }
    }

    #[test]
    fn json_loader_reads_transitions_and_validators() {
        let raw = json!({
            "params": {
                "networkID": "0x2a",
                "accountStartNonce": "0x0",
                "eip150Transition": "0x0",
                "eip155Transition": "0x0",
                "eip140Transition": "0x64",
            },
            "engine": {
                "authorityRound": {
                    "params": {
                        "validators": {
                            "list": ["0x00427feae2419c15b89d1c21af10d1b6650a4d3d"]
                        }
                    }
                }
            }
        });
        let spec = ChainSpec::from_json(&raw).unwrap();
        assert_eq!(spec.network_id, 42);
        assert!(spec.eip_at(0).contains(EipFlags::EIP150));
        assert!(!spec.eip_at(0).contains(EipFlags::EIP140));
        assert!(spec.eip_at(100).contains(EipFlags::EIP140));
        let consensus = spec.consensus_at(0).unwrap();
        assert_eq!(consensus.kind, ConsensusKind::AuraAuthority);
        assert_eq!(consensus.validators.len(), 1);
    }

    #[test]
    fn json_loader_rejects_unknown_engines() {
        let raw = json!({"params": {}, "engine": {"tendermint": {}}});
        assert_eq!(
            ChainSpec::from_json(&raw),
            Err(ChainSpecError::UnknownEngine("tendermint".to_owned()))
        );
    }
}
