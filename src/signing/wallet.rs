use crate::error::{BatchError, Result};
use ethers::signers::{LocalWallet, Signer as EthersSigner};
use ethers::types::{Address, Signature, H256};
use tracing::debug;
use zeroize::Zeroize;

/// Signing identity for one wallet in a batch
///
/// # Security
/// The private key string is zeroized right after parsing and never stored.
/// Only the parsed signer and its address are kept.
#[derive(Clone)]
pub struct Wallet {
    inner: LocalWallet,
    chain_id: u64,
}

impl Wallet {
    /// Create a wallet from a private key hex string (with or without 0x)
    pub fn from_private_key(private_key: &str, chain_id: u64) -> Result<Self> {
        let mut secure_key = private_key.trim().trim_start_matches("0x").to_string();

        let parsed = secure_key
            .parse::<LocalWallet>()
            .map_err(|e| BatchError::Wallet(format!("Invalid private key: {}", e)));

        secure_key.zeroize();

        let wallet = parsed?.with_chain_id(chain_id);
        debug!(address = ?wallet.address(), chain_id, "signer wallet loaded");

        Ok(Self {
            inner: wallet,
            chain_id,
        })
    }

    /// Get the wallet address
    pub fn address(&self) -> Address {
        self.inner.address()
    }

    /// Get the chain ID
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sign a 32-byte digest, e.g. a transaction sighash
    pub fn sign_hash(&self, hash: H256) -> Result<Signature> {
        self.inner
            .sign_hash(hash)
            .map_err(|e| BatchError::Wallet(format!("Failed to sign hash: {}", e)))
    }

    /// Get the underlying ethers wallet for transaction signing
    pub fn inner(&self) -> &LocalWallet {
        &self.inner
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known development keys (DO NOT use in production!)
    const KEY_0: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::from_private_key(KEY_0, 137).unwrap();

        assert_eq!(wallet.chain_id(), 137);
        assert_eq!(
            format!("{:?}", wallet.address()),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn test_wallet_accepts_unprefixed_key() {
        let prefixed = Wallet::from_private_key(KEY_0, 1).unwrap();
        let bare = Wallet::from_private_key(KEY_0.trim_start_matches("0x"), 1).unwrap();
        assert_eq!(prefixed.address(), bare.address());
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let err = Wallet::from_private_key("0xnot-a-key", 1).unwrap_err();
        assert!(err.to_string().contains("Invalid private key"));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let wallet = Wallet::from_private_key(KEY_0, 1).unwrap();
        let rendered = format!("{:?}", wallet);
        assert!(!rendered.contains("ac0974bec"));
    }
}
