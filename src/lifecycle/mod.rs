//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     broadcast → Orchestrator::abort_on_shutdown → abort_all
//!              → workers fail with Aborted at the next phase boundary
//! ```
//!
//! # Design Decisions
//! - A submission in flight is always allowed to finish and be recorded
//! - Aborted transfers are resumable after restart

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
