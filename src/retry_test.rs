use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::time::Instant;

use crate::retry::{retry_during, RetryPolicy};

#[tokio::test(start_paused = true)]
async fn retry_during_stops_on_first_success() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(1));

    let val = retry_during(policy, "test", || {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                bail!("transient");
            }
            Ok(42)
        }
    })
    .await?;

    assert_eq!(val, 42, "expected value from successful attempt, got {}", val);
    let calls = calls.load(Ordering::SeqCst);
    assert_eq!(calls, 3, "expected 3 attempts, got {}", calls);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_during_exhausts_attempts_with_last_error() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::new(3, Duration::ZERO, Duration::from_secs(1));

    let res: Result<()> = retry_during(policy, "create pod", || {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            bail!("failure {}", n)
        }
    })
    .await;

    let err = match res {
        Ok(_) => bail!("expected retry_during to fail"),
        Err(err) => err,
    };
    assert_eq!(calls.load(Ordering::SeqCst), 3, "expected all attempts to be used");
    assert!(err.to_string().contains("after 3 attempts"), "unexpected error annotation: {}", err);
    assert!(format!("{:#}", err).contains("failure 2"), "expected last error to be surfaced, got {:#}", err);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_during_aborts_once_timeout_elapsed() -> Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::new(10, Duration::from_secs(5), Duration::from_secs(3));

    let res: Result<()> = retry_during(policy, "update", || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            bail!("conflict")
        }
    })
    .await;

    // Attempts land at t=0s, t=3s & t=6s; the third exceeds the 5s bound.
    let calls = calls.load(Ordering::SeqCst);
    assert_eq!(calls, 3, "expected 3 attempts before timing out, got {}", calls);
    let err = res.err().map(|err| err.to_string()).unwrap_or_default();
    assert!(err.contains("timed out after 3 attempts"), "unexpected error annotation: {}", err);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retry_during_skips_negligible_sleep() -> Result<()> {
    let start = Instant::now();
    let policy = RetryPolicy::new(4, Duration::ZERO, Duration::ZERO);

    let res: Result<()> = retry_during(policy, "noop", || async { bail!("nope") }).await;

    assert!(res.is_err(), "expected retry_during to fail");
    assert!(start.elapsed() < Duration::from_millis(1), "expected no sleeping between attempts, took {:?}", start.elapsed());
    Ok(())
}
