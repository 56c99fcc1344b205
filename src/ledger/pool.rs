//! Per-chain submission admission.
//!
//! At most K submissions run against one chain at a time, and submissions
//! from the same sending account run one after another so nonces never
//! collide.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// Bounded, account-serialized access to one chain.
#[derive(Debug)]
pub struct SubmissionPool {
    chain: String,
    limit: Arc<Semaphore>,
    accounts: Arc<DashMap<String, Arc<Mutex<()>>>>,
    max_concurrent: usize,
}

impl SubmissionPool {
    pub fn new(chain: impl Into<String>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            chain: chain.into(),
            limit: Arc::new(Semaphore::new(max_concurrent)),
            accounts: Arc::new(DashMap::new()),
            max_concurrent,
        }
    }

    /// Wait for the account's turn, then for a chain slot.
    ///
    /// The account lock is taken first so a queued account does not sit on
    /// a chain slot other accounts could use.
    pub async fn acquire(&self, account: &str) -> SubmissionPermit {
        let key = account.to_lowercase();
        let account_lock = self
            .accounts
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let account_guard = account_lock.lock_owned().await;

        // The semaphore is never closed.
        let slot = match self.limit.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => None,
        };

        tracing::trace!(
            chain = %self.chain,
            account,
            available = self.limit.available_permits(),
            "Submission slot acquired"
        );

        SubmissionPermit {
            _slot: slot,
            account: Some(account_guard),
            key,
            accounts: Arc::clone(&self.accounts),
        }
    }

    pub fn available(&self) -> usize {
        self.limit.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Accounts with a submission held or queued.
    pub fn tracked_accounts(&self) -> usize {
        self.accounts.len()
    }
}

/// A held submission slot. Dropping it releases both the account and the chain slot.
///
/// The account's lock entry is removed once nobody holds or waits on it.
#[derive(Debug)]
pub struct SubmissionPermit {
    _slot: Option<OwnedSemaphorePermit>,
    account: Option<OwnedMutexGuard<()>>,
    key: String,
    accounts: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for SubmissionPermit {
    fn drop(&mut self) {
        drop(self.account.take());
        // Waiters hold their own clone, so a count of one is the map's.
        self.accounts
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
