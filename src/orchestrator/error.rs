//! Transfer error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::authority::AuthorityError;
use crate::ledger::LedgerError;
use crate::orchestrator::state::Phase;
use crate::reconcile::ReconcileError;

/// Coarse class reported with every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network or RPC trouble; resuming is safe.
    Transport,
    /// Caller or input fault; needs manual intervention.
    Validation,
    /// A polling budget ran out; resuming is safe.
    ProtocolTimeout,
    /// The destination rejected the signed payload.
    ExecutionReverted,
    /// The credited amount differs from the expected one.
    ReconciliationMismatch,
    /// Cancelled by the caller or by shutdown; resuming is safe.
    Aborted,
}

impl ErrorClass {
    /// Whether resuming from the last reached phase is safe.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            ErrorClass::Transport | ErrorClass::ProtocolTimeout | ErrorClass::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transport => "transport",
            ErrorClass::Validation => "validation",
            ErrorClass::ProtocolTimeout => "protocol_timeout",
            ErrorClass::ExecutionReverted => "execution_reverted",
            ErrorClass::ReconciliationMismatch => "reconciliation_mismatch",
            ErrorClass::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("invalid transfer request: {0}")]
    InvalidRequest(String),

    #[error("chain {0} is not configured")]
    UnknownChain(String),

    #[error("{chain}: {source}")]
    Ledger {
        chain: String,
        #[source]
        source: LedgerError,
    },

    #[error("bridge authority: {0}")]
    Authority(#[from] AuthorityError),

    #[error("source event not confirmed after {attempts} polls")]
    ConfirmationTimeout { attempts: u32 },

    #[error("authority refused the source event: {0}")]
    ConfirmationFailed(String),

    #[error("command batch not signed after {attempts} polls")]
    SigningTimeout { attempts: u32 },

    #[error("command batch signing failed: {0}")]
    SigningFailed(String),

    /// A submission was broadcast but its inclusion is not known yet.
    #[error("outcome of {tx_id} on {chain} is unresolved")]
    UnresolvedSubmission { chain: String, tx_id: String },

    /// The process stopped while a submission was being broadcast.
    #[error("submission on {chain} was interrupted before its transaction id was recorded")]
    InterruptedSubmission { chain: String },

    #[error(transparent)]
    Reconciliation(#[from] ReconcileError),

    #[error("transfer aborted")]
    Aborted,

    #[error("phase cannot move from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("transfer {0} not found")]
    NotFound(Uuid),

    #[error("transfer {id} is not resumable ({reason})")]
    NotResumable { id: Uuid, reason: String },

    #[error("transfer worker failed: {0}")]
    Worker(String),
}

impl TransferError {
    pub fn ledger(chain: &str, source: LedgerError) -> Self {
        TransferError::Ledger {
            chain: chain.to_string(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::InvalidRequest(_)
            | TransferError::UnknownChain(_)
            | TransferError::ConfirmationFailed(_)
            | TransferError::InterruptedSubmission { .. }
            | TransferError::InvalidTransition { .. }
            | TransferError::NotFound(_)
            | TransferError::NotResumable { .. } => ErrorClass::Validation,
            TransferError::Ledger { source, .. } => ledger_class(source),
            TransferError::Authority(e) => match e {
                AuthorityError::Transport(_) | AuthorityError::Parse(_) => ErrorClass::Transport,
                _ => ErrorClass::Validation,
            },
            TransferError::ConfirmationTimeout { .. } | TransferError::SigningTimeout { .. } => {
                ErrorClass::ProtocolTimeout
            }
            TransferError::SigningFailed(_)
            | TransferError::UnresolvedSubmission { .. }
            | TransferError::Worker(_) => ErrorClass::Transport,
            TransferError::Reconciliation(ReconcileError::Mismatch { .. }) => {
                ErrorClass::ReconciliationMismatch
            }
            TransferError::Reconciliation(ReconcileError::Ledger(e)) => ledger_class(e),
            TransferError::Reconciliation(ReconcileError::CreditInFlight { .. }) => ErrorClass::Transport,
            TransferError::Aborted => ErrorClass::Aborted,
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.class().is_resumable()
    }
}

fn ledger_class(error: &LedgerError) -> ErrorClass {
    match error {
        LedgerError::Transport(_)
        | LedgerError::Timeout(_)
        | LedgerError::GasPriceTooHigh { .. }
        | LedgerError::OutcomeUnknown { .. } => ErrorClass::Transport,
        LedgerError::ExecutionReverted(_) => ErrorClass::ExecutionReverted,
        LedgerError::InsufficientBalance { .. }
        | LedgerError::AssetNotRegistered(_)
        | LedgerError::GatewayUnregistered(_)
        | LedgerError::Reverted(_)
        | LedgerError::Wallet(_)
        | LedgerError::InvalidInput(_)
        | LedgerError::ChainMismatch { .. } => ErrorClass::Validation,
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
