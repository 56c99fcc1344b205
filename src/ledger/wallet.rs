//! Signing key management.
//!
//! # Security
//! - Private keys are loaded ONLY from environment variables
//! - Keys are never logged or serialized

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;

use crate::ledger::types::{LedgerError, LedgerResult};

/// Relayer account used to sign one chain's transactions.
#[derive(Debug, Clone)]
pub struct Wallet {
    signer: PrivateKeySigner,
    /// Chain ID for EIP-155 replay protection.
    chain_id: u64,
}

impl Wallet {
    /// Create a wallet from a hex-encoded private key string.
    pub fn from_private_key(private_key_hex: &str, chain_id: u64) -> LedgerResult<Self> {
        let key_hex = private_key_hex
            .trim()
            .strip_prefix("0x")
            .unwrap_or(private_key_hex.trim());

        let signer: PrivateKeySigner = key_hex
            .parse()
            .map_err(|e| LedgerError::Wallet(format!("Invalid private key format: {}", e)))?;

        tracing::info!(address = %signer.address(), chain_id, "Wallet initialized");

        Ok(Self { signer, chain_id })
    }

    /// Load the key from the named environment variable.
    pub fn from_env(var: &str, chain_id: u64) -> LedgerResult<Self> {
        let private_key = std::env::var(var).map_err(|_| {
            LedgerError::Wallet(format!("Environment variable {} not set", var))
        })?;
        Self::from_private_key(&private_key, chain_id)
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Network wallet handed to the signing provider.
    pub fn ethereum_wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer.clone())
    }
}
