//! Transfer orchestration subsystem.
//!
//! # Data Flow
//! ```text
//! TransferRequest
//!     → engine.rs (validate, admit, drive phase by phase)
//!         CREATED          → source LedgerClient: ensure_allowance, submit_transfer
//!         SOURCE_SENT      → BridgeAuthorityClient: confirm_source_event, poll_confirmation
//!         SOURCE_CONFIRMED → BridgeAuthorityClient: request_command_signing, poll_signed_batch
//!         COMMANDS_SIGNED  → destination LedgerClient: submit_execution
//!         EXECUTED         → BalanceReconciler: verify
//!     → registry.rs (state after every step, idempotency index, JSON file)
//!     → TransferOutcome (final phase + error class)
//! ```
//!
//! # Design Decisions
//! - One worker per transfer; no lock is held across a network call except
//!   the per-chain submission slot
//! - Abort is honored between phases only
//! - Resumption re-enters at the last phase reached and never resubmits a
//!   source transfer whose transaction id is known

pub mod engine;
pub mod error;
pub mod registry;
pub mod state;

pub use engine::{Orchestrator, OrchestratorBuilder, Policies};
pub use error::{ErrorClass, TransferError, TransferResult};
pub use registry::TransferRegistry;
pub use state::{FailureRecord, Phase, TransferId, TransferOutcome, TransferRequest, TransferState};
