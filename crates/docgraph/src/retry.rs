//! Reusable retry-with-exponential-backoff.
//!
//! A single higher-order routine parameterized by a retryable-error
//! predicate and a backoff schedule, shared by every external-service call
//! site instead of duplicating retry loops.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ServiceError;

/// Exponential backoff schedule: `base × multiplier^attempt`, capped.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `op` with retries for throttling-class failures.
///
/// Non-retryable errors propagate immediately. When the schedule is
/// exhausted the last throttle is escalated to
/// [`ServiceError::RetriesExhausted`] (service-fatal). A server-provided
/// `retry_after` hint takes precedence over the computed delay when longer.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut last_message = String::new();

    for attempt in 0..policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                last_message = err.to_string();
                // No sleep after the final attempt.
                if attempt + 1 == policy.max_attempts {
                    break;
                }
                let mut delay = policy.delay_for(attempt);
                if let ServiceError::Throttled {
                    retry_after: Some(hint),
                } = &err
                {
                    delay = delay.max(*hint);
                }
                tracing::debug!(
                    label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "throttled, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }

    Err(ServiceError::RetriesExhausted {
        attempts: policy.max_attempts,
        last: last_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::default()
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let p = policy();
        let delays: Vec<Duration> = (0..8).map(|i| p.delay_for(i)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[7], Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_four_times_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&policy(), "test", move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 4 {
                    Err(ServiceError::Throttled { retry_after: None })
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_every_attempt_exhausts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), ServiceError> = retry_with_backoff(&policy(), "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Throttled { retry_after: None })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(ServiceError::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), ServiceError> = retry_with_backoff(&policy(), "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::BadRequest("malformed".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(ServiceError::BadRequest(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_extends_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(&policy(), "test", move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(ServiceError::Throttled {
                        retry_after: Some(Duration::from_secs(10)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(10));
    }
}
