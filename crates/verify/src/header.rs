//! Block-header decoding and validation.
//!
//! The header is the anchor of every other proof: state, transaction and
//! receipt tries are verified against the roots committed in it. A light
//! client cannot trace the chain back to genesis, so a header is accepted on
//! either of two grounds: the consensus rules of the active chain-spec entry
//! (authority signature for PoA engines), or a threshold of signed
//! attestations from registered nodes over `(block_hash, block_number)`.

use ethers::types::{RecoveryMessage, Signature, H160, H256, U256};
use ethers::utils::keccak256;
use rlp::{Rlp, RlpStream};
use thiserror::Error;

use veritas_types::chainspec::{ChainSpec, ConsensusKind, ConsensusTransition};
use veritas_types::envelope::BlockSignature;
use veritas_types::utils::{self, UtilsError};

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("RLP decode error {0}")]
    Decode(String),
    #[error("Header must have 15 or 16 fields, got {0}")]
    FieldCount(usize),
    #[error("Header hashes to {computed} but {expected} was expected")]
    HashMismatch { computed: String, expected: String },
    #[error("No consensus rules configured for block {0}")]
    NoConsensusRules(u64),
    #[error("Authority header carries no seal signature")]
    MissingSeal,
    #[error("Could not recover the sealing authority: {0}")]
    SealRecovery(String),
    #[error("Sealer {0} is not in the validator set")]
    UnknownSealer(String),
    #[error("Authority engine has no validator set to check against")]
    NoValidatorSet,
    #[error("Header has {got} valid attestations, {required} required")]
    NotEnoughAttestations { got: usize, required: usize },
    #[error("Value error {0}")]
    Value(#[from] UtilsError),
}

impl From<rlp::DecoderError> for HeaderError {
    fn from(err: rlp::DecoderError) -> Self {
        HeaderError::Decode(err.to_string())
    }
}

/// Field positions in the header RLP.
const PARENT_HASH: usize = 0;
const STATE_ROOT: usize = 3;
const TX_ROOT: usize = 4;
const RECEIPTS_ROOT: usize = 5;
const DIFFICULTY: usize = 7;
const NUMBER: usize = 8;
const GAS_LIMIT: usize = 9;
const GAS_USED: usize = 10;
const TIMESTAMP: usize = 11;
const EXTRA_DATA: usize = 12;
/// Seal fields (PoW mix-hash and nonce, or PoA step and signature) start
/// after the extra data.
const SEAL_START: usize = 13;

/// A decoded block header plus its raw RLP, kept for re-hashing and seal
/// digests.
#[derive(Debug, Clone)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub state_root: H256,
    pub tx_root: H256,
    pub receipts_root: H256,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    /// Raw RLP items of the seal fields.
    pub seal: Vec<Vec<u8>>,
    raw: Vec<u8>,
}

impl BlockHeader {
    pub fn decode(raw: &[u8]) -> Result<Self, HeaderError> {
        let rlp = Rlp::new(raw);
        let field_count = rlp.item_count()?;
        if !(15..=16).contains(&field_count) {
            return Err(HeaderError::FieldCount(field_count));
        }
        let h256_at = |index: usize| -> Result<H256, HeaderError> {
            let data = rlp.at(index)?.data()?;
            if data.len() != 32 {
                return Err(HeaderError::Decode(format!(
                    "field {index} must be 32 bytes, got {}",
                    data.len()
                )));
            }
            Ok(H256::from_slice(data))
        };
        let u64_at = |index: usize| -> Result<u64, HeaderError> {
            let data = rlp.at(index)?.data()?;
            if data.len() > 8 {
                return Err(HeaderError::Decode(format!("field {index} overflows u64")));
            }
            let mut padded = [0u8; 8];
            padded[8 - data.len()..].copy_from_slice(data);
            Ok(u64::from_be_bytes(padded))
        };
        let mut seal = Vec::new();
        for index in SEAL_START..field_count {
            seal.push(rlp.at(index)?.as_raw().to_vec());
        }
        Ok(Self {
            parent_hash: h256_at(PARENT_HASH)?,
            state_root: h256_at(STATE_ROOT)?,
            tx_root: h256_at(TX_ROOT)?,
            receipts_root: h256_at(RECEIPTS_ROOT)?,
            difficulty: U256::from_big_endian(rlp.at(DIFFICULTY)?.data()?),
            number: u64_at(NUMBER)?,
            gas_limit: u64_at(GAS_LIMIT)?,
            gas_used: u64_at(GAS_USED)?,
            timestamp: u64_at(TIMESTAMP)?,
            extra_data: rlp.at(EXTRA_DATA)?.data()?.to_vec(),
            seal,
            raw: raw.to_vec(),
        })
    }

    pub fn hash(&self) -> H256 {
        H256(keccak256(&self.raw))
    }

    /// RLP of the header with the seal fields removed — the digest basis for
    /// Aura authority signatures.
    fn bare_rlp(&self) -> Result<Vec<u8>, HeaderError> {
        let rlp = Rlp::new(&self.raw);
        let mut stream = RlpStream::new_list(SEAL_START);
        for index in 0..SEAL_START {
            stream.append_raw(rlp.at(index)?.as_raw(), 1);
        }
        Ok(stream.out().to_vec())
    }

    /// RLP of the header with the trailing 65 signature bytes stripped from
    /// the extra data — the digest basis for clique seals.
    fn clique_rlp(&self) -> Result<Vec<u8>, HeaderError> {
        if self.extra_data.len() < 65 {
            return Err(HeaderError::MissingSeal);
        }
        let rlp = Rlp::new(&self.raw);
        let field_count = rlp.item_count()?;
        let mut stream = RlpStream::new_list(field_count);
        for index in 0..field_count {
            if index == EXTRA_DATA {
                let stripped = self.extra_data[..self.extra_data.len() - 65].to_vec();
                stream.append(&stripped);
            } else {
                stream.append_raw(rlp.at(index)?.as_raw(), 1);
            }
        }
        Ok(stream.out().to_vec())
    }
}

/// Validates a header against the consensus rules active at its height and
/// the attestation threshold, returning the decoded header for further use.
pub fn verify_header(
    header_rlp: &[u8],
    expected_hash: Option<H256>,
    spec: &ChainSpec,
    attestations: &[BlockSignature],
    node_addresses: &[H160],
    required_signatures: usize,
) -> Result<BlockHeader, HeaderError> {
    let header = BlockHeader::decode(header_rlp)?;
    let hash = header.hash();
    if let Some(expected) = expected_hash {
        if hash != expected {
            return Err(HeaderError::HashMismatch {
                computed: utils::hex_encode(hash),
                expected: utils::hex_encode(expected),
            });
        }
    }

    let consensus = spec
        .consensus_at(header.number)
        .ok_or(HeaderError::NoConsensusRules(header.number))?;
    match consensus.kind {
        // Work is not re-checked locally; trust comes from attestations.
        ConsensusKind::ProofOfWork => {}
        ConsensusKind::AuraAuthority | ConsensusKind::CliqueAuthority => {
            verify_authority(&header, consensus)?;
        }
    }

    if required_signatures > 0 {
        verify_attestations(
            hash,
            header.number,
            attestations,
            node_addresses,
            required_signatures,
        )?;
    }
    Ok(header)
}

fn verify_authority(
    header: &BlockHeader,
    consensus: &ConsensusTransition,
) -> Result<(), HeaderError> {
    if consensus.validators.is_empty() {
        return Err(HeaderError::NoValidatorSet);
    }
    let (digest, signature_bytes) = match consensus.kind {
        ConsensusKind::AuraAuthority => {
            // Seal is [step, signature]; the signature covers the bare header.
            let signature_item = header.seal.get(1).ok_or(HeaderError::MissingSeal)?;
            let signature = Rlp::new(signature_item).data()?.to_vec();
            (keccak256(header.bare_rlp()?), signature)
        }
        ConsensusKind::CliqueAuthority => {
            // Signature is the last 65 bytes of the extra data.
            let extra = &header.extra_data;
            if extra.len() < 65 {
                return Err(HeaderError::MissingSeal);
            }
            (keccak256(header.clique_rlp()?), extra[extra.len() - 65..].to_vec())
        }
        ConsensusKind::ProofOfWork => unreachable!("checked by caller"),
    };
    let sealer = recover(H256(digest), &signature_bytes)?;
    if !consensus.validators.contains(&sealer) {
        return Err(HeaderError::UnknownSealer(utils::hex_encode(sealer)));
    }
    Ok(())
}

/// Checks that at least `required` distinct registered nodes signed
/// `keccak(block_hash ‖ block_number_be32)`. Unknown signers and duplicate
/// signers do not count; invalid signatures fail outright.
pub fn verify_attestations(
    block_hash: H256,
    block_number: u64,
    attestations: &[BlockSignature],
    node_addresses: &[H160],
    required: usize,
) -> Result<(), HeaderError> {
    let digest = attestation_digest(block_hash, block_number);
    let mut signers: Vec<H160> = Vec::new();
    for attestation in attestations {
        if attestation.block != block_number
            || utils::parse_h256(&attestation.block_hash)? != block_hash
        {
            continue;
        }
        let signature = Signature {
            r: utils::parse_quantity_u256(&attestation.r)?,
            s: utils::parse_quantity_u256(&attestation.s)?,
            v: attestation.v,
        };
        let signer = match signature.recover(RecoveryMessage::Hash(digest)) {
            Ok(signer) => signer,
            Err(err) => {
                log::debug!("attestation signature rejected: {err}");
                continue;
            }
        };
        if node_addresses.contains(&signer) && !signers.contains(&signer) {
            signers.push(signer);
        }
    }
    if signers.len() < required {
        return Err(HeaderError::NotEnoughAttestations {
            got: signers.len(),
            required,
        });
    }
    Ok(())
}

/// The digest registered nodes sign to attest a block.
pub fn attestation_digest(block_hash: H256, block_number: u64) -> H256 {
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(block_hash.as_bytes());
    message[56..].copy_from_slice(&block_number.to_be_bytes());
    H256(keccak256(message))
}

fn recover(digest: H256, signature: &[u8]) -> Result<H160, HeaderError> {
    if signature.len() != 65 {
        return Err(HeaderError::SealRecovery(format!(
            "signature must be 65 bytes, got {}",
            signature.len()
        )));
    }
    let signature = Signature {
        r: U256::from_big_endian(&signature[..32]),
        s: U256::from_big_endian(&signature[32..64]),
        v: u64::from(signature[64]),
    };
    signature
        .recover(RecoveryMessage::Hash(digest))
        .map_err(|err| HeaderError::SealRecovery(err.to_string()))
}
