//! Optional signing capability for locally built transactions.

use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::{Signature, H160, H256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing failed: {0}")]
    Failed(String),
}

/// Signs 32-byte digests. The client uses this to turn `eth_sendTransaction`
/// into a locally signed `eth_sendRawTransaction`.
pub trait Signer: Send + Sync {
    fn address(&self) -> H160;
    fn sign(&self, digest: H256) -> Result<Signature, SignerError>;
}

/// Signer backed by an in-memory private key.
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }
}

impl Signer for WalletSigner {
    fn address(&self) -> H160 {
        self.wallet.address()
    }

    fn sign(&self, digest: H256) -> Result<Signature, SignerError> {
        self.wallet
            .sign_hash(digest)
            .map_err(|err| SignerError::Failed(err.to_string()))
    }
}
