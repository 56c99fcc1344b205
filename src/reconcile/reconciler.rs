//! Post-execution balance verification.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::ledger::{LedgerClient, LedgerError};
use crate::resilience::Transient;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// The observed balance change differs from the expected credit.
    #[error(
        "balance of {account} in {symbol} moved from {before} to {after}, expected an increase of exactly {expected}"
    )]
    Mismatch {
        account: String,
        symbol: String,
        before: u128,
        after: u128,
        expected: u128,
    },

    /// A sibling credit landed while the balance was being read.
    #[error("credit {command_id} to {account} landed during the balance read")]
    CreditInFlight { account: String, command_id: String },

    /// The balance could not be read.
    #[error("balance read failed: {0}")]
    Ledger(#[from] LedgerError),
}

impl Transient for ReconcileError {
    fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Ledger(e) => e.is_transient(),
            ReconcileError::CreditInFlight { .. } => true,
            ReconcileError::Mismatch { .. } => false,
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// A credit another transfer expects on the same account and asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingCredit {
    pub command_id: String,
    pub amount: u128,
    /// The other transfer already reconciled, so its credit has landed.
    pub settled: bool,
}

/// A balance and the sibling credits already included in it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baseline {
    pub balance: u128,
    pub credited: BTreeSet<String>,
}

/// Balances on both sides of a verified credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub before: u128,
    pub after: u128,
    /// Part of the change that belongs to sibling transfers.
    pub sibling_credits: u128,
}

/// Checks that a destination account was credited by exactly the expected amount.
///
/// There is no tolerance: amounts are integers in the smallest unit. Other
/// transfers crediting the same account are accounted for by their command
/// ids: a sibling credit counts once its command has executed on the
/// destination ledger and was not already part of the baseline. Credits from
/// outside the orchestrator are not expected while a transfer is in flight.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceReconciler;

impl BalanceReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Read the balance the later check compares against.
    pub async fn capture(
        &self,
        ledger: &dyn LedgerClient,
        account: &str,
        symbol: &str,
        siblings: &[SiblingCredit],
    ) -> ReconcileResult<Baseline> {
        let (balance, credited) = self.snapshot(ledger, account, symbol, siblings).await?;
        Ok(Baseline { balance, credited })
    }

    /// Compare the current balance against the baseline plus `expected_delta`
    /// plus every sibling credit that landed since.
    pub async fn verify(
        &self,
        ledger: &dyn LedgerClient,
        account: &str,
        symbol: &str,
        baseline: &Baseline,
        expected_delta: u128,
        siblings: &[SiblingCredit],
    ) -> ReconcileResult<Reconciled> {
        let before = baseline.balance;
        let (after, landed) = self.snapshot(ledger, account, symbol, siblings).await?;
        let sibling_credits: u128 = siblings
            .iter()
            .filter(|c| landed.contains(&c.command_id) && !baseline.credited.contains(&c.command_id))
            .map(|c| c.amount)
            .sum();
        let expected = expected_delta.saturating_add(sibling_credits);
        let matches = after
            .checked_sub(before)
            .is_some_and(|delta| delta == expected);

        if !matches {
            tracing::error!(
                chain = ledger.chain(),
                account,
                symbol,
                before,
                after,
                expected,
                sibling_credits,
                "Reconciliation mismatch"
            );
            return Err(ReconcileError::Mismatch {
                account: account.to_string(),
                symbol: symbol.to_string(),
                before,
                after,
                expected,
            });
        }

        tracing::debug!(chain = ledger.chain(), account, symbol, before, after, sibling_credits, "Balance reconciled");
        Ok(Reconciled {
            before,
            after,
            sibling_credits,
        })
    }

    /// Balance together with the sibling commands it includes.
    ///
    /// Executed commands stay executed, so a sibling seen executed only
    /// after the balance read means the read may have missed its credit.
    async fn snapshot(
        &self,
        ledger: &dyn LedgerClient,
        account: &str,
        symbol: &str,
        siblings: &[SiblingCredit],
    ) -> ReconcileResult<(u128, BTreeSet<String>)> {
        let mut landed = BTreeSet::new();
        for credit in siblings {
            if credit.settled || ledger.is_command_executed(&credit.command_id).await? {
                landed.insert(credit.command_id.clone());
            }
        }

        let balance = ledger.get_balance(account, symbol).await?;

        for credit in siblings.iter().filter(|c| !landed.contains(&c.command_id)) {
            if ledger.is_command_executed(&credit.command_id).await? {
                return Err(ReconcileError::CreditInFlight {
                    account: account.to_string(),
                    command_id: credit.command_id.clone(),
                });
            }
        }
        Ok((balance, landed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;

    const BOB: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    fn ledger() -> InMemoryLedger {
        InMemoryLedger::new("Polygon")
            .with_gateway("0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512")
            .with_token("USDC")
    }

    fn baseline(balance: u128) -> Baseline {
        Baseline {
            balance,
            credited: BTreeSet::new(),
        }
    }

    fn sibling(command_id: &str, amount: u128, settled: bool) -> SiblingCredit {
        SiblingCredit {
            command_id: command_id.to_string(),
            amount,
            settled,
        }
    }

    #[tokio::test]
    async fn test_exact_credit_reconciles() {
        let ledger = ledger();
        let reconciler = BalanceReconciler::new();
        let before = reconciler.capture(&ledger, BOB, "USDC", &[]).await.unwrap();
        ledger.mint(BOB, "USDC", 1_000);

        let result = reconciler.verify(&ledger, BOB, "USDC", &before, 1_000, &[]).await.unwrap();
        assert_eq!(
            result,
            Reconciled {
                before: 0,
                after: 1_000,
                sibling_credits: 0
            }
        );
    }

    #[tokio::test]
    async fn test_short_credit_is_mismatch() {
        let ledger = ledger();
        ledger.mint(BOB, "USDC", 1_000);
        let err = BalanceReconciler::new()
            .verify(&ledger, BOB, "USDC", &baseline(0), 1_001, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Mismatch { after: 1_000, expected: 1_001, .. }));
    }

    #[tokio::test]
    async fn test_decrease_is_mismatch() {
        let ledger = ledger();
        let err = BalanceReconciler::new()
            .verify(&ledger, BOB, "USDC", &baseline(50), 0, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Mismatch { before: 50, after: 0, .. }));
    }

    #[tokio::test]
    async fn test_settled_sibling_is_part_of_the_baseline() {
        let ledger = ledger();
        ledger.mint(BOB, "USDC", 700);
        let reconciler = BalanceReconciler::new();
        let siblings = [sibling("0xaa", 700, true)];

        let before = reconciler.capture(&ledger, BOB, "USDC", &siblings).await.unwrap();
        assert!(before.credited.contains("0xaa"));
        ledger.mint(BOB, "USDC", 1_000);

        let result = reconciler
            .verify(&ledger, BOB, "USDC", &before, 1_000, &siblings)
            .await
            .unwrap();
        assert_eq!(result.sibling_credits, 0);
    }

    #[tokio::test]
    async fn test_sibling_credit_after_baseline_is_expected() {
        let ledger = ledger();
        let reconciler = BalanceReconciler::new();
        let before = reconciler.capture(&ledger, BOB, "USDC", &[]).await.unwrap();
        ledger.mint(BOB, "USDC", 1_000 + 700);

        let settled = [sibling("0xaa", 700, true)];
        let result = reconciler
            .verify(&ledger, BOB, "USDC", &before, 1_000, &settled)
            .await
            .unwrap();
        assert_eq!(result.sibling_credits, 700);

        let err = reconciler
            .verify(&ledger, BOB, "USDC", &before, 1_000, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Mismatch { after: 1_700, expected: 1_000, .. }));
    }

    #[tokio::test]
    async fn test_unexecuted_sibling_is_not_expected() {
        let ledger = ledger();
        ledger.mint(BOB, "USDC", 1_000);
        let siblings = [sibling("0xbb", 500, false)];

        let result = BalanceReconciler::new()
            .verify(&ledger, BOB, "USDC", &baseline(0), 1_000, &siblings)
            .await
            .unwrap();
        assert_eq!(result.sibling_credits, 0);
    }

    #[test]
    fn test_only_mismatch_is_permanent() {
        let moving = ReconcileError::CreditInFlight {
            account: BOB.into(),
            command_id: "0xcc".into(),
        };
        assert!(moving.is_transient());
        let mismatch = ReconcileError::Mismatch {
            account: BOB.into(),
            symbol: "USDC".into(),
            before: 0,
            after: 1,
            expected: 2,
        };
        assert!(!mismatch.is_transient());
    }
}
