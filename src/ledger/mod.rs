//! Ledger integration subsystem.
//!
//! # Data Flow
//! ```text
//! Environment Variables (private key), chain config
//!     → wallet.rs (key loading)
//!     → rpc.rs (RPC connection with timeouts and failover)
//!     → transaction.rs (build, sign, broadcast, wait for inclusion)
//!     → evm.rs (gateway and token calls behind the LedgerClient trait)
//!
//! Orchestrator
//!     → pool.rs (K submissions per chain, one per sending account)
//!     → client.rs (LedgerClient)
//! ```
//!
//! # Security Constraints
//! - Private keys ONLY from environment variables
//! - Never log private keys or sensitive data
//! - All RPC calls have configurable timeouts

pub mod client;
pub mod evm;
pub mod memory;
pub mod pool;
pub mod rpc;
pub mod transaction;
pub mod types;
pub mod wallet;

pub use client::LedgerClient;
pub use evm::EvmLedger;
pub use memory::{InMemoryLedger, LedgerOp};
pub use pool::{SubmissionPermit, SubmissionPool};
pub use types::{ConfirmationStatus, ExecutePayload, LedgerError, LedgerResult, TxId};
pub use wallet::Wallet;
