//! Transfer request and per-attempt state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::ledger::{ExecutePayload, TxId};
use crate::orchestrator::error::{ErrorClass, TransferError, TransferResult};

pub type TransferId = Uuid;

/// What the caller asked to move. Never changes once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_chain: String,
    pub dest_chain: String,
    pub symbol: String,
    /// Smallest-unit amount.
    pub amount: u128,
    pub sender: String,
    pub recipient: String,
}

impl TransferRequest {
    pub fn validate(&self) -> TransferResult<()> {
        if self.amount == 0 {
            return Err(TransferError::InvalidRequest("amount must be greater than zero".into()));
        }
        if self.source_chain == self.dest_chain {
            return Err(TransferError::InvalidRequest(format!(
                "source and destination are both {}",
                self.source_chain
            )));
        }
        for (field, value) in [
            ("symbol", &self.symbol),
            ("sender", &self.sender),
            ("recipient", &self.recipient),
        ] {
            if value.trim().is_empty() {
                return Err(TransferError::InvalidRequest(format!("{} is empty", field)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Created,
    SourceSent,
    SourceConfirmed,
    CommandsSigned,
    Executed,
    Reconciled,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Reconciled | Phase::Failed)
    }

    /// The phase a successful step leads to.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Created => Some(Phase::SourceSent),
            Phase::SourceSent => Some(Phase::SourceConfirmed),
            Phase::SourceConfirmed => Some(Phase::CommandsSigned),
            Phase::CommandsSigned => Some(Phase::Executed),
            Phase::Executed => Some(Phase::Reconciled),
            Phase::Reconciled | Phase::Failed => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Created => "CREATED",
            Phase::SourceSent => "SOURCE_SENT",
            Phase::SourceConfirmed => "SOURCE_CONFIRMED",
            Phase::CommandsSigned => "COMMANDS_SIGNED",
            Phase::Executed => "EXECUTED",
            Phase::Reconciled => "RECONCILED",
            Phase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why an attempt stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub class: ErrorClass,
    pub message: String,
    /// Phase the attempt was working from when it failed.
    pub phase: Phase,
    pub attempt: u32,
}

/// Mutable record of one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub id: TransferId,
    pub request: TransferRequest,
    pub phase: Phase,
    /// Last non-failed phase reached; resumption re-enters here.
    pub last_phase: Phase,
    /// 1 for the first attempt, incremented on every resume.
    pub attempt: u32,
    /// Flat protocol fee withheld from the credit.
    pub fee: u128,
    pub approval_tx_id: Option<TxId>,
    pub source_tx_id: Option<TxId>,
    /// Set while a source submission's inclusion is unknown.
    pub source_tx_unresolved: bool,
    /// Set while a source submission is being broadcast.
    pub submitting: bool,
    pub command_id: Option<String>,
    pub batch_id: Option<String>,
    pub execute_payload: Option<ExecutePayload>,
    pub dest_tx_id: Option<TxId>,
    /// Recipient balance captured before execution.
    pub dest_balance_before: Option<u128>,
    /// Command ids of sibling credits already in `dest_balance_before`.
    #[serde(default)]
    pub baseline_credits: BTreeSet<String>,
    /// Work done per phase in this attempt (submissions, polls, reads).
    pub phase_attempts: BTreeMap<Phase, u32>,
    pub last_error: Option<FailureRecord>,
    /// Failures of earlier attempts, oldest first.
    pub history: Vec<FailureRecord>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TransferState {
    pub fn new(request: TransferRequest, fee: u128) -> Self {
        let now = unix_now();
        Self {
            id: Uuid::new_v4(),
            request,
            phase: Phase::Created,
            last_phase: Phase::Created,
            attempt: 1,
            fee,
            approval_tx_id: None,
            source_tx_id: None,
            source_tx_unresolved: false,
            submitting: false,
            command_id: None,
            batch_id: None,
            execute_payload: None,
            dest_tx_id: None,
            dest_balance_before: None,
            baseline_credits: BTreeSet::new(),
            phase_attempts: BTreeMap::new(),
            last_error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Start the next attempt from a failed one.
    ///
    /// Everything learned so far carries over; the new attempt re-enters at
    /// the last phase the previous one reached.
    pub fn resume_from(previous: &TransferState) -> TransferResult<Self> {
        let Some(failure) = previous.last_error.clone().filter(|_| previous.phase == Phase::Failed)
        else {
            return Err(TransferError::NotResumable {
                id: previous.id,
                reason: format!("phase is {}", previous.phase),
            });
        };
        if !failure.class.is_resumable() {
            return Err(TransferError::NotResumable {
                id: previous.id,
                reason: format!("{} failures need manual intervention", failure.class),
            });
        }

        let mut next = previous.clone();
        next.phase = previous.last_phase;
        next.attempt = previous.attempt + 1;
        next.phase_attempts.clear();
        next.last_error = None;
        next.history.push(failure);
        next.updated_at = unix_now();
        Ok(next)
    }

    /// Move one step forward.
    pub fn advance(&mut self, to: Phase) -> TransferResult<()> {
        if self.phase.next() != Some(to) {
            return Err(TransferError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.last_phase = to;
        self.updated_at = unix_now();
        Ok(())
    }

    /// Record the error and enter FAILED. Terminal states are left alone.
    pub fn fail(&mut self, error: &TransferError) {
        if self.phase.is_terminal() {
            return;
        }
        self.last_error = Some(FailureRecord {
            class: error.class(),
            message: error.to_string(),
            phase: self.phase,
            attempt: self.attempt,
        });
        self.phase = Phase::Failed;
        self.updated_at = unix_now();
    }

    /// Count work done in the current phase.
    pub fn record_attempts(&mut self, phase: Phase, attempts: u32) {
        *self.phase_attempts.entry(phase).or_default() += attempts;
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Net amount the recipient should receive.
    pub fn expected_delta(&self) -> u128 {
        self.request.amount.saturating_sub(self.fee)
    }
}

/// Final result handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub id: TransferId,
    pub phase: Phase,
    /// Last non-failed phase reached.
    pub last_phase: Phase,
    pub attempt: u32,
    pub error: Option<FailureRecord>,
    pub source_tx_id: Option<TxId>,
    pub dest_tx_id: Option<TxId>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.phase == Phase::Reconciled
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|e| e.class)
    }
}

impl From<&TransferState> for TransferOutcome {
    fn from(state: &TransferState) -> Self {
        Self {
            id: state.id,
            phase: state.phase,
            last_phase: state.last_phase,
            attempt: state.attempt,
            error: state.last_error.clone(),
            source_tx_id: state.source_tx_id.clone(),
            dest_tx_id: state.dest_tx_id.clone(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn request() -> TransferRequest {
        TransferRequest {
            source_chain: "Ethereum".into(),
            dest_chain: "Polygon".into(),
            symbol: "USDC".into(),
            amount: 1_000_000_000,
            sender: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".into(),
            recipient: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".into(),
        }
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let mut zero = request();
        zero.amount = 0;
        assert!(matches!(zero.validate(), Err(TransferError::InvalidRequest(_))));

        let mut same = request();
        same.dest_chain = same.source_chain.clone();
        assert!(matches!(same.validate(), Err(TransferError::InvalidRequest(_))));
    }

    #[test]
    fn test_phases_only_move_forward() {
        let mut state = TransferState::new(request(), 0);
        state.advance(Phase::SourceSent).unwrap();
        assert!(state.advance(Phase::Created).is_err());
        assert!(state.advance(Phase::Executed).is_err());
        state.advance(Phase::SourceConfirmed).unwrap();
        assert_eq!(state.last_phase, Phase::SourceConfirmed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut state = TransferState::new(request(), 0);
        state.advance(Phase::SourceSent).unwrap();
        state.fail(&TransferError::ConfirmationTimeout { attempts: 5 });
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.last_phase, Phase::SourceSent);

        let first = state.last_error.clone();
        state.fail(&TransferError::Aborted);
        assert_eq!(state.last_error, first);
        assert!(state.advance(Phase::SourceConfirmed).is_err());
    }

    #[test]
    fn test_resume_reenters_last_phase() {
        let mut state = TransferState::new(request(), 0);
        state.advance(Phase::SourceSent).unwrap();
        state.source_tx_id = Some("0x01".into());
        state.record_attempts(Phase::SourceSent, 10);
        state.fail(&TransferError::ConfirmationTimeout { attempts: 10 });

        let next = TransferState::resume_from(&state).unwrap();
        assert_eq!(next.id, state.id);
        assert_eq!(next.phase, Phase::SourceSent);
        assert_eq!(next.attempt, 2);
        assert_eq!(next.source_tx_id.as_deref(), Some("0x01"));
        assert!(next.phase_attempts.is_empty());
        assert_eq!(next.history.len(), 1);
        assert_eq!(next.history[0].class, ErrorClass::ProtocolTimeout);
    }

    #[test]
    fn test_manual_failures_are_not_resumable() {
        let mut state = TransferState::new(request(), 0);
        state.fail(&TransferError::InvalidRequest("bad".into()));
        assert!(matches!(
            TransferState::resume_from(&state),
            Err(TransferError::NotResumable { .. })
        ));

        let running = TransferState::new(request(), 0);
        assert!(TransferState::resume_from(&running).is_err());
    }

    #[test]
    fn test_expected_delta_subtracts_fee() {
        let state = TransferState::new(request(), 250);
        assert_eq!(state.expected_delta(), 1_000_000_000 - 250);
    }

    #[test]
    fn test_state_serializes_phase_names() {
        let state = TransferState::new(request(), 0);
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"phase\":\"CREATED\""));
        let back: TransferState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
