//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a ledger or the bridge authority:
//!     → retry.rs (re-run transient failures, poll pending status)
//!     → policy.rs (attempt budget, deadline)
//!     → backoff.rs (delay between attempts)
//! ```
//!
//! # Design Decisions
//! - Every loop is bounded twice: by attempts and by a wall-clock deadline
//! - Policies are values passed in by the caller, never globals
//! - Loops sleep on the Tokio clock so tests can run on paused time

pub mod backoff;
pub mod policy;
pub mod retry;

pub use policy::RetryPolicy;
pub use retry::{poll_until, retry, PollStatus, RetryError, Transient};
