//! Exponential backoff with jitter, shared by the IMAP fetch path and the
//! sink ingest path (spec.md §9). Grounded on
//! `original_source/pipeline/orchestrator.py`'s `retry_async`. The original's
//! `retry_to_thread` offloads a blocking Gmail SDK call onto a worker thread;
//! this crate's sink transport (`reqwest`) is natively async, so every retry
//! site here awaits in place and no thread-offload wrapper is needed.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Backoff parameters: attempts are 1-indexed, delay before attempt `i+1` is
/// `min(max_delay, base * 2^(i-1)) + U(0, jitter)`. The final attempt never
/// sleeps afterwards (spec.md §9).
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Retry an async operation under `policy`. Every failure is logged; the
/// last attempt's error is returned if all attempts are exhausted.
pub async fn retry_async<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    target: "retry",
                    %label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_async_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::from_millis(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<u32, String> = retry_async(policy, "test", |attempt| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err("not yet".to_string())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_async_exhausts_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: Duration::from_millis(0),
        };
        let result: Result<(), String> =
            retry_async(policy, "test", |_attempt| async { Err("always fails".to_string()) }).await;
        assert_eq!(result, Err("always fails".to_string()));
    }
}
