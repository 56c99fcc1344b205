//! Balance reconciliation.
//!
//! # Data Flow
//! ```text
//! Orchestrator, before execution:  capture(dest ledger, recipient)  → before
//! Orchestrator, after execution:   verify(before, amount - fee,
//!                                         sibling credits since)  → Reconciled | Mismatch
//! ```
//!
//! A mismatch is a protocol inconsistency, reported apart from transport
//! failures and never retried.

pub mod reconciler;

pub use reconciler::{
    BalanceReconciler, Baseline, ReconcileError, ReconcileResult, Reconciled, SiblingCredit,
};
