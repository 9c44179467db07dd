use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::launch::LaunchError;
use crate::error::ProvisioningError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Bounded exponential backoff for transient launch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    /// Delay slept before attempt `attempt` (1-based). The first attempt runs
    /// immediately; later ones wait `initial_delay * 2^(attempt - 2)`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Every delay slept when all attempts fail.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        (2..=self.max_attempts)
            .map(|attempt| self.delay_before_attempt(attempt))
            .collect()
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// or `max_attempts` transient failures have been seen.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, ProvisioningError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LaunchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => {
                    return Err(ProvisioningError::Permanent(err));
                }
                Err(err) if attempt >= max_attempts => {
                    return Err(ProvisioningError::Transient {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    attempt += 1;
                    let delay = self.delay_before_attempt(attempt);
                    warn!(
                        error_code = %err.kind,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient launch error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::provisioning::launch::LaunchErrorKind;

    fn throttled() -> LaunchError {
        LaunchError::new(LaunchErrorKind::Throttling, "slow down")
    }

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::new(4, Duration::from_secs(2));
        assert_eq!(policy.delay_before_attempt(1), Duration::ZERO);
        assert_eq!(
            policy.backoff_schedule(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_transient_errors_with_doubling_delays() {
        let policy = RetryPolicy::default();
        let started = Instant::now();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let result: Result<(), _> = policy
            .run(|_| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(started.elapsed());
                    Err(throttled())
                }
            })
            .await;

        match result {
            Err(ProvisioningError::Transient { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.kind, LaunchErrorKind::Throttling);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(6)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(LaunchError::new(
                        LaunchErrorKind::Other("InvalidParameterValue".into()),
                        "bad image",
                    ))
                }
            })
            .await;

        assert!(matches!(result, Err(ProvisioningError::Permanent(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_error() {
        let value = RetryPolicy::default()
            .run(|attempt| async move {
                if attempt < 2 {
                    Err(throttled())
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }
}
