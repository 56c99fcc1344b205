//! Chain-specific types and error definitions.

use alloy::primitives::hex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::resilience::Transient;

/// Identifier of a submitted transaction (hex hash on EVM chains).
pub type TxId = String;

/// Errors that can occur during ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// RPC connection or request failed before anything was broadcast.
    #[error("RPC error: {0}")]
    Transport(String),

    /// RPC request timed out.
    #[error("RPC timeout after {0} seconds")]
    Timeout(u64),

    /// The owner cannot cover the requested amount.
    #[error("Insufficient balance for {account}: required {required}, available {available}")]
    InsufficientBalance {
        account: String,
        required: u128,
        available: u128,
    },

    /// The gateway has no asset bound to this symbol.
    #[error("Asset '{0}' is not registered with the gateway")]
    AssetNotRegistered(String),

    /// No gateway contract is bound for this chain.
    #[error("No gateway registered for chain '{0}'")]
    GatewayUnregistered(String),

    /// Transaction was reverted on-chain.
    #[error("Transaction reverted: {0}")]
    Reverted(String),

    /// The gateway rejected an authority-signed payload.
    #[error("Execution reverted: {0}")]
    ExecutionReverted(String),

    /// Broadcast succeeded but inclusion could not be determined.
    #[error("Outcome of transaction {tx_id} is unknown")]
    OutcomeUnknown { tx_id: TxId },

    /// Invalid private key or signing failure.
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// Malformed address or transaction identifier.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Gas price exceeded maximum allowed.
    #[error("Gas price {current_gwei} gwei exceeds maximum {max_gwei} gwei")]
    GasPriceTooHigh { current_gwei: u64, max_gwei: u64 },

    /// Chain configuration mismatch.
    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },
}

impl Transient for LedgerError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Transport(_) | LedgerError::Timeout(_) | LedgerError::GasPriceTooHigh { .. }
        )
    }
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Transaction confirmation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    /// The node does not know the transaction.
    NotFound,
    /// Transaction is pending in mempool.
    Pending,
    /// Transaction has been mined but not enough confirmations.
    Confirming { current: u32, required: u32 },
    /// Transaction is confirmed with required block depth.
    Confirmed { block_number: u64 },
    /// Transaction failed or was dropped.
    Failed(String),
}

/// Authority-signed execution data, consumed once by a destination gateway.
///
/// Stored without the `0x` prefix; the prefix is added when handed to the
/// ledger. The content is never interpreted by the orchestrator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutePayload(String);

impl ExecutePayload {
    /// Wrap a hex string, with or without `0x` prefix.
    pub fn from_hex(raw: &str) -> Self {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        Self(body.to_string())
    }

    /// Encode raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Hex string with the `0x` byte-string prefix.
    pub fn prefixed(&self) -> String {
        format!("0x{}", self.0)
    }

    /// Decode to raw bytes.
    pub fn to_bytes(&self) -> LedgerResult<Vec<u8>> {
        hex::decode(&self.0)
            .map_err(|e| LedgerError::ExecutionReverted(format!("malformed execute payload: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ExecutePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.0.chars().take(16).collect();
        write!(f, "ExecutePayload(0x{}.., {} hex chars)", preview, self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_prefix_normalization() {
        let a = ExecutePayload::from_hex("0xdeadbeef");
        let b = ExecutePayload::from_hex("deadbeef");
        assert_eq!(a, b);
        assert_eq!(a.prefixed(), "0xdeadbeef");
        assert_eq!(a.to_bytes().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_malformed_payload_reverts() {
        let payload = ExecutePayload::from_hex("0xzz");
        assert!(matches!(payload.to_bytes(), Err(LedgerError::ExecutionReverted(_))));
    }

    #[test]
    fn test_transient_classification() {
        assert!(LedgerError::Transport("down".into()).is_transient());
        assert!(LedgerError::Timeout(10).is_transient());
        assert!(!LedgerError::Reverted("nope".into()).is_transient());
        assert!(!LedgerError::OutcomeUnknown { tx_id: "0x1".into() }.is_transient());
        assert!(!LedgerError::AssetNotRegistered("USDC".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = LedgerError::Timeout(10);
        assert_eq!(err.to_string(), "RPC timeout after 10 seconds");

        let err = LedgerError::InsufficientBalance {
            account: "0xabc".into(),
            required: 10,
            available: 0,
        };
        assert!(err.to_string().contains("required 10"));
    }
}
