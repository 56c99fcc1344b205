//! Cross-chain asset transfer orchestrator.
//!
//! Moves a fungible token from an account on a source ledger to an account
//! on a destination ledger through an external validating authority, and
//! verifies the credit on arrival.

// Clients
pub mod authority;
pub mod ledger;

// Core
pub mod orchestrator;
pub mod reconcile;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use authority::{AxelardClient, BridgeAuthorityClient, InMemoryAuthority};
pub use config::OrchestratorConfig;
pub use ledger::{EvmLedger, InMemoryLedger, LedgerClient};
pub use lifecycle::Shutdown;
pub use orchestrator::{
    ErrorClass, Orchestrator, OrchestratorBuilder, Phase, TransferError, TransferOutcome,
    TransferRequest, TransferState,
};
pub use reconcile::BalanceReconciler;
