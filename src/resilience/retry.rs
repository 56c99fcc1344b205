//! Retry and polling loops.
//!
//! # Responsibilities
//! - Re-run an operation while it fails with a transient error
//! - Poll a read-only status until it becomes ready
//! - Enforce the attempt budget and the wall-clock deadline
//!
//! Both loops are plain futures: dropping them cancels the in-flight call.

use std::fmt;
use std::future::Future;
use tokio::time::{sleep, timeout};

use crate::resilience::policy::RetryPolicy;

/// Errors that know whether retrying them can help.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not there yet; poll again after backoff.
    Pending,
    /// The remote side reported a terminal failure.
    Failed(String),
}

/// Why a retry or polling loop stopped without a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Attempt budget used up.
    Exhausted { attempts: u32, last: Option<E> },
    /// Deadline passed before the budget was used up.
    DeadlineExceeded { attempts: u32, last: Option<E> },
    /// The polled status reported failure.
    Failed(String),
    /// A non-transient error; never retried.
    Permanent(E),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempts", attempts)?;
                if let Some(e) = last {
                    write!(f, " (last error: {})", e)?;
                }
                Ok(())
            }
            RetryError::DeadlineExceeded { attempts, last } => {
                write!(f, "deadline exceeded after {} attempts", attempts)?;
                if let Some(e) = last {
                    write!(f, " (last error: {})", e)?;
                }
                Ok(())
            }
            RetryError::Failed(reason) => write!(f, "remote failure: {}", reason),
            RetryError::Permanent(e) => write!(f, "{}", e),
        }
    }
}

impl<E> RetryError<E> {
    /// Number of attempts made before stopping, if known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::DeadlineExceeded { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}

/// Poll `op` until it reports [`PollStatus::Ready`].
///
/// Transient errors count against the budget like a pending poll; permanent
/// errors stop the loop at once. Returns the value and the number of polls.
pub async fn poll_until<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &'static str,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    E: Transient + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, E>>,
{
    let mut attempts = 0u32;
    let mut last_error: Option<E> = None;
    let max_attempts = policy.max_attempts.max(1);

    let outcome = timeout(policy.deadline(), async {
        loop {
            attempts += 1;
            match op(attempts).await {
                Ok(PollStatus::Ready(value)) => return Ok(value),
                Ok(PollStatus::Failed(reason)) => return Err(RetryError::Failed(reason)),
                Ok(PollStatus::Pending) => {
                    tracing::debug!(label, attempt = attempts, "Still pending");
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(label, attempt = attempts, error = %e, "Transient failure");
                    last_error = Some(e);
                }
                Err(e) => return Err(RetryError::Permanent(e)),
            }

            if attempts >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts,
                    last: last_error.take(),
                });
            }

            sleep(policy.delay_for(attempts)).await;
        }
    })
    .await;

    match outcome {
        Ok(Ok(value)) => Ok((value, attempts)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RetryError::DeadlineExceeded {
            attempts,
            last: last_error,
        }),
    }
}

/// Run `op` until it succeeds, retrying transient errors with backoff.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &'static str,
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    E: Transient + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    poll_until(policy, label, |attempt| {
        let fut = op(attempt);
        async move { fut.await.map(PollStatus::Ready) }
    })
    .await
}
