//! Bounded retry with capped exponential backoff, shared by every I/O boundary.

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::time::{sleep, timeout};
use tracing::warn;

/// How many times an operation is attempted and how long to wait in between.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    /// Policy with explicit bounds.
    pub const fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Policy that never retries.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay following `current` in the backoff schedule.
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
///
/// The last error is returned unchanged.
pub async fn retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    operation: &'static str,
    is_retryable: R,
    op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    retry_with_hint(policy, operation, is_retryable, |_| None, op).await
}

/// Like [`retry`], but waits at least as long as the `retry_after` hint an
/// error carries. A hint beyond `max_delay` ends the retries at once.
pub async fn retry_with_hint<T, E, F, Fut, R, H>(
    policy: &RetryPolicy,
    operation: &'static str,
    is_retryable: R,
    retry_after: H,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    let mut delay = policy.initial_delay;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let pause = match retry_after(&err) {
                    Some(hint) if hint > policy.max_delay => {
                        warn!(operation, attempt, ?hint, error = %err, "retry hint beyond backoff cap; giving up");
                        return Err(err);
                    }
                    Some(hint) => hint.max(delay),
                    None => delay,
                };
                warn!(operation, attempt, ?pause, error = %err, "operation failed; backing off");
                sleep(pause).await;
                delay = policy.next_delay(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Await `fut` for at most `limit`, mapping an elapsed deadline through `on_timeout`.
pub async fn with_timeout<T, E, Fut>(
    limit: Duration,
    fut: Fut,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const FAST: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(300));
        assert_eq!(
            policy.next_delay(Duration::from_millis(100)),
            Duration::from_millis(200)
        );
        assert_eq!(
            policy.next_delay(Duration::from_millis(200)),
            Duration::from_millis(300)
        );
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(&FAST, "flaky", |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry(&FAST, "down", |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_owned()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry(&FAST, "auth", |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("unauthorized".to_owned()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hint_stretches_the_pause() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(2));
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<u32, String> = retry_with_hint(
            &policy,
            "throttled",
            |_| true,
            |_| Some(Duration::from_millis(1500)),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if n < 2 { Err("429".to_owned()) } else { Ok(n) } }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn hint_beyond_cap_gives_up() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(2));
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_hint(
            &policy,
            "throttled",
            |_| true,
            |_| Some(Duration::from_secs(900)),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("429".to_owned()) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_error() {
        let result: Result<(), &str> = with_timeout(
            Duration::from_millis(5),
            async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            || "timed out",
        )
        .await;
        assert_eq!(result, Err("timed out"));
    }
}
