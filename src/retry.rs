use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Retry-with-backoff policy shared by every remote integration.
///
/// The delay doubles after each failed attempt starting from `base_delay`.
/// Errors the predicate rejects are surfaced immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub async fn run<T, E, Fut, Op, Pred>(&self, mut op: Op, retryable: Pred) -> Result<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        Pred: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && retryable(&err) => {
                    let delay = self.base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "Attempt {} of {} failed, retrying in {:?}. {}",
                        attempt, self.max_attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Enforces a minimum interval between remote calls across all callers.
///
/// Callers await `acquire` before every request; the mutex around the
/// last-call instant serializes the check-and-sleep so concurrent workers
/// cannot exceed the configured requests-per-second ceiling.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_second(max_per_second: f64) -> Self {
        let max_per_second = max_per_second.max(f64::MIN_POSITIVE);
        Self {
            min_interval: Duration::from_secs_f64(1.0 / max_per_second),
            last_call: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.min_interval {
                tokio::time::sleep(self.min_interval - since).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result: Result<u32, String> = policy
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err("transient".to_string())
                        } else {
                            Ok(n)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let result: Result<(), String> = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("still down".to_string()) }
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let result: Result<(), String> = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("bad request".to_string()) }
                },
                |err| !err.contains("bad request"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limiter_spaces_out_calls() {
        let limiter = RateLimiter::per_second(50.0); // 20ms between calls
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
