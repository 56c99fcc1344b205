//! Bridge authority subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrator
//!     → client.rs (BridgeAuthorityClient: register, confirm, sign, poll)
//!         → axelard.rs (shells out to the authority CLI)
//!         → memory.rs (in-process authority over in-memory ledgers)
//! ```
//!
//! Requests return once accepted; outcomes are observed only through the
//! read-only polls, which the orchestrator drives with its own policy.

pub mod axelard;
pub mod client;
pub mod memory;
pub mod types;

pub use axelard::AxelardClient;
pub use client::BridgeAuthorityClient;
pub use memory::{AuthorityOp, InMemoryAuthority, IN_MEMORY_SIGNER};
pub use types::{
    AuthorityError, AuthorityResult, BatchStatus, ConfirmationHandle, RegistrationPolicy,
    SignedBatch, SourceConfirmation,
};
