//! Bridge authority types and errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::ExecutePayload;
use crate::resilience::Transient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    /// The authority could not be reached or the command did not complete.
    #[error("authority transport error: {0}")]
    Transport(String),

    /// The source event was confirmed by an earlier request.
    #[error("source event {tx_id} on {chain} is already confirmed")]
    AlreadyConfirmed { chain: String, tx_id: String },

    /// A different gateway is registered and the policy forbids replacing it.
    #[error("chain {chain} already has gateway {existing}; refusing to register {requested}")]
    GatewayConflict {
        chain: String,
        existing: String,
        requested: String,
    },

    #[error("chain {0} is not known to the authority")]
    UnknownChain(String),

    /// The authority processed the request and refused it.
    #[error("authority rejected the request: {0}")]
    Rejected(String),

    /// Output from the authority could not be understood.
    #[error("unparseable authority response: {0}")]
    Parse(String),
}

impl Transient for AuthorityError {
    fn is_transient(&self) -> bool {
        matches!(self, AuthorityError::Transport(_))
    }
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// What to do when a chain already has a different gateway registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationPolicy {
    /// Keep the existing gateway and report a conflict.
    Reject,
    /// Replace the existing gateway.
    Overwrite,
}

/// Handle to an accepted confirmation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationHandle {
    pub chain: String,
    pub tx_id: String,
}

/// Progress of a source event through authority consensus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfirmation {
    Pending,
    /// Confirmed; carries the outbound command id when the authority reports it.
    Confirmed { command_id: Option<String> },
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Signed,
    Failed,
}

/// A command batch for one destination chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBatch {
    pub batch_id: String,
    pub status: BatchStatus,
    pub command_ids: Vec<String>,
    /// Present once the batch is signed.
    pub execute_payload: Option<ExecutePayload>,
}

impl SignedBatch {
    pub fn pending() -> Self {
        Self {
            batch_id: String::new(),
            status: BatchStatus::Pending,
            command_ids: Vec::new(),
            execute_payload: None,
        }
    }

    pub fn contains(&self, command_id: &str) -> bool {
        self.command_ids
            .iter()
            .any(|id| id.trim_start_matches("0x").eq_ignore_ascii_case(command_id.trim_start_matches("0x")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: RegistrationPolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"overwrite\"").unwrap();
        assert_eq!(w.policy, RegistrationPolicy::Overwrite);
        assert!(toml::from_str::<Wrapper>("policy = \"maybe\"").is_err());
    }

    #[test]
    fn test_batch_contains_ignores_prefix_and_case() {
        let batch = SignedBatch {
            batch_id: "b".into(),
            status: BatchStatus::Signed,
            command_ids: vec!["0xABCD".into()],
            execute_payload: None,
        };
        assert!(batch.contains("abcd"));
        assert!(!batch.contains("0xabce"));
    }

    #[test]
    fn test_only_transport_is_transient() {
        assert!(AuthorityError::Transport("x".into()).is_transient());
        assert!(!AuthorityError::Rejected("x".into()).is_transient());
        assert!(!AuthorityError::AlreadyConfirmed {
            chain: "Ethereum".into(),
            tx_id: "0x1".into()
        }
        .is_transient());
    }
}
