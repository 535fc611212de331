//! Retry with exponential backoff for calls to external services.
//!
//! Retries stay inside a single call; a failed analysis run is never replayed.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter, in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before retrying after failed attempt `attempt` (1-based), without jitter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=jitter);
        base.mul_f64(1.0 + extra).min(self.max_delay)
    }
}

/// Runs `f` until it succeeds, returns a non-retryable error, or runs out of attempts.
pub async fn retry_with_backoff<F, T, E, Fut>(
    config: &RetryConfig,
    mut f: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = config.jittered(config.delay_for_attempt(attempt));
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if an HTTP status is worth retrying
pub fn is_http_retryable(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new(5, Duration::from_millis(100));

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_config_max_delay() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 10.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.5,
        };

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(config.jittered(config.delay_for_attempt(5)), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::new(3, Duration::from_millis(100));
        for _ in 0..50 {
            let d = config.jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_is_http_retryable() {
        assert!(is_http_retryable(500));
        assert!(is_http_retryable(503));
        assert!(is_http_retryable(429)); // Too Many Requests
        assert!(is_http_retryable(408)); // Request Timeout
        assert!(!is_http_retryable(400));
        assert!(!is_http_retryable(401));
        assert!(!is_http_retryable(404));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(10));
        let result: Result<u32, String> = retry_with_backoff(
            &config,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("attempt {n}"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            &RetryConfig::default(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_owned()) }
            },
            |_| false,
        )
        .await;
        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
