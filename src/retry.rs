//! Bounded retry of fallible cluster operations.
//!
//! Every call against the K8s API made while moving a pod goes through `retry_during`, which
//! bounds an operation both by a number of attempts and by the total time spent retrying it.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

/// Sleeps at or below this duration are skipped entirely.
const NEGLIGIBLE_SLEEP: Duration = Duration::from_millis(1);

/// The attempt budget used for most checks & mutations.
pub const RETRY_LESS: u32 = 2;
/// The attempt budget used when restoring state during cleanup.
pub const RETRY_MORE: u32 = 4;
/// The default bound on the time spent retrying an operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// The default delay between attempts of a mutation.
pub const DEFAULT_SLEEP: Duration = Duration::from_secs(3);
/// The delay between attempts of a read-only check.
pub const CHECK_SLEEP: Duration = Duration::from_secs(1);

/// The bounds placed on a retried operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of times the operation will be invoked.
    pub attempts: u32,
    /// The total time after which no further attempts will be made. Zero disables the bound.
    pub timeout: Duration,
    /// The delay between attempts.
    pub sleep: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, timeout: Duration, sleep: Duration) -> Self {
        Self { attempts, timeout, sleep }
    }

    /// A policy for mutating an object with the given number of attempts.
    pub fn update(attempts: u32) -> Self {
        Self::new(attempts, DEFAULT_TIMEOUT, DEFAULT_SLEEP)
    }

    /// A policy for re-reading an object with the given number of attempts.
    pub fn check(attempts: u32) -> Self {
        Self::new(attempts, DEFAULT_TIMEOUT, CHECK_SLEEP)
    }
}

/// Invoke `operation` until it succeeds or the given policy is exhausted.
///
/// The error of the final attempt is returned, annotated with the number of attempts made and,
/// when the timeout cut retries short, the time elapsed.
pub async fn retry_during<F, Fut, T>(policy: RetryPolicy, name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let max_attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(val) => {
                tracing::debug!(operation = name, attempt, max_attempts, "operation succeeded");
                return Ok(val);
            }
            Err(err) => err,
        };
        tracing::debug!(operation = name, attempt, max_attempts, error = %err, "operation failed");
        if attempt >= max_attempts {
            tracing::error!(operation = name, attempt, error = %err, "retries exhausted");
            return Err(err.context(format!("{} failed after {} attempts", name, attempt)));
        }

        let elapsed = start.elapsed();
        if !policy.timeout.is_zero() && elapsed > policy.timeout {
            tracing::error!(operation = name, attempt, ?elapsed, error = %err, "retries timed out");
            return Err(err.context(format!("{} timed out after {} attempts ({:?} elapsed)", name, attempt, elapsed)));
        }

        if policy.sleep > NEGLIGIBLE_SLEEP {
            tokio::time::sleep(policy.sleep).await;
        }
    }
}
