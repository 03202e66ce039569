//! Retry with exponential backoff and jitter for transient failures.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff parameters for an operation that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Give up once this much time has elapsed. `None` retries forever.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        }
    }
}

impl RetryConfig {
    /// Bounded profile for cloud existence checks that should settle fast.
    pub fn existence_check() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_elapsed: Some(Duration::from_secs(2)),
        }
    }

    pub fn with_max_elapsed(max_elapsed: Duration) -> Self {
        Self {
            max_elapsed: Some(max_elapsed),
            ..Self::default()
        }
    }
}

/// Runs `operation` until it succeeds or the elapsed bound is exceeded,
/// sleeping with jittered exponential backoff between attempts.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if let Some(max_elapsed) = config.max_elapsed {
                    if started.elapsed() >= max_elapsed {
                        warn!(
                            operation = %operation_name,
                            attempt,
                            %error,
                            "giving up after elapsed bound"
                        );
                        return Err(error);
                    }
                }

                // 0.5x..1.5x jitter keeps concurrent retries from herding.
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep_for = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                debug!(
                    operation = %operation_name,
                    attempt,
                    %error,
                    delay_ms = sleep_for.as_millis(),
                    "operation failed; retrying"
                );
                tokio::time::sleep(sleep_for).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn returns_first_success() {
        let result: Result<u32, &str> =
            retry_with_backoff(&RetryConfig::default(), "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        };
        let result: Result<u32, &str> = retry_with_backoff(&config, "op", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_elapsed_bound() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            max_elapsed: Some(Duration::from_millis(20)),
        };
        let result: Result<u32, &str> =
            retry_with_backoff(&config, "op", || async { Err("always") }).await;
        assert_eq!(result, Err("always"));
    }
}
