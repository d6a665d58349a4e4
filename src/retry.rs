//! Bounded retries with exponential backoff.
//!
//! Every outbound call in the gateway goes through [`retry_with_backoff`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use tracing::warn;

/// Attempt budget and delay bounds for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retries,
            initial_delay,
            max_delay,
        }
    }

    /// Forwarding to a backend.
    pub const FORWARD: RetryPolicy =
        RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10));

    /// Swift token acquisition.
    pub const SWIFT_AUTH: RetryPolicy =
        RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(1));

    /// Copy of this policy limited to a single attempt.
    pub fn single_attempt(self) -> RetryPolicy {
        RetryPolicy {
            retries: 1,
            ..self
        }
    }

    /// The sleeps taken between attempts, in order. There is one fewer
    /// entry than `retries`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max = self.max_delay;
        let count = self.retries.saturating_sub(1) as usize;
        std::iter::successors(Some(self.initial_delay.min(max)), move |d| {
            Some(d.saturating_mul(2).min(max))
        })
        .take(count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::FORWARD
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// Between failures the task sleeps, doubling the delay each time up to
/// `max_delay`. The last error is returned when every attempt fails. A
/// policy with `retries == 0` still makes one attempt.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut delays = policy.delays();
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => match delays.next() {
                Some(delay) => {
                    warn!(
                        "Attempt {attempt}/{} failed: {err}; retrying in {delay:?}",
                        policy.retries
                    );
                    counter!(crate::metrics::BACKEND_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::new(6, Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(RetryPolicy::FORWARD.retries, 5);
        assert_eq!(RetryPolicy::FORWARD.max_delay, Duration::from_secs(10));
        assert_eq!(RetryPolicy::SWIFT_AUTH.max_delay, Duration::from_secs(1));
        assert_eq!(RetryPolicy::FORWARD.single_attempt().retries, 1);
        assert_eq!(RetryPolicy::FORWARD.single_attempt().delays().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(300));
        let result: Result<u32, String> = retry_with_backoff(policy, || {
            let calls = calls.clone();
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(start.elapsed());
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err(format!("failure {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let seen = seen.lock().unwrap();
        let gaps: Vec<Duration> = seen.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        for pair in gaps.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(gaps.iter().all(|g| *g <= Duration::from_millis(300) + Duration::from_millis(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), String> = retry_with_backoff(
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10)),
            || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {n}"))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_still_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), &str> = retry_with_backoff(
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1)),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("nope")
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
