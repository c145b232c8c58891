use crate::error::CoreError;
use crate::error_utils::ErrorExt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay for exponential backoff (in milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1000, // 1 second
            max_delay_ms: 30000, // 30 seconds
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

impl RetryConfig {
    /// Backoff for transient listing failures inside one poll cycle.
    pub fn reddit() -> Self {
        Self {
            max_attempts: u32::MAX, // bounded by the cycle budget instead
            base_delay_ms: 2000,
            max_delay_ms: 60000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2, // 20% jitter to prevent thundering herd
        }
    }

    /// Delay between failed poll cycles of one watch target.
    pub fn error_backoff() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay_ms: 5000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }

    /// Short fixed-interval retry for state store commands.
    pub fn store_local() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 500,
            max_delay_ms: 500,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }
}

/// Retry strategy based on error type
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Retry with exponential backoff
    Retry,
    /// Retry after the delay the remote side asked for
    RetryWithDelay(Duration),
    /// Don't retry (for permanent failures)
    NoRetry,
}

/// Determine retry strategy based on error type
pub fn get_retry_strategy(error: &CoreError) -> RetryStrategy {
    if !error.is_retryable() {
        return RetryStrategy::NoRetry;
    }
    match error {
        CoreError::RedditApi(_) | CoreError::Notify(_) => match error.retry_after() {
            Some(delay) if is_rate_limit(error) => RetryStrategy::RetryWithDelay(delay),
            _ => RetryStrategy::Retry,
        },
        _ => RetryStrategy::Retry,
    }
}

fn is_rate_limit(error: &CoreError) -> bool {
    matches!(
        error,
        CoreError::RedditApi(crate::RedditApiError::RateLimitExceeded { .. })
            | CoreError::Notify(crate::NotifyError::RateLimited { .. })
    )
}

/// Calculate delay with exponential backoff and jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base_delay = Duration::from_millis(config.base_delay_ms);
    let max_delay = Duration::from_millis(config.max_delay_ms);

    // Calculate exponential backoff
    let exponential_delay = if attempt == 0 {
        base_delay
    } else {
        let multiplier = config.backoff_multiplier.powi(attempt.min(63) as i32);
        let delay_ms = (config.base_delay_ms as f64 * multiplier).min(u64::MAX as f64) as u64;
        Duration::from_millis(delay_ms.min(config.max_delay_ms))
    };

    // Add jitter to prevent thundering herd
    let jitter_range = (exponential_delay.as_millis() as f64 * config.jitter_factor) as u64;
    let jitter = fastrand::u64(0..=jitter_range);
    let final_delay = exponential_delay + Duration::from_millis(jitter);

    // Ensure we don't exceed max delay
    final_delay.min(max_delay)
}

/// Far enough ahead to never fire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 3600);

/// `start + after`, saturating at a distant deadline instead of overflowing.
pub fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Suspend until `deadline`, returning early with `Cancelled` on shutdown.
pub async fn sleep_until_or_cancel(
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), CoreError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CoreError::Cancelled),
        _ = sleep_until(deadline) => Ok(()),
    }
}

pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), CoreError> {
    sleep_until_or_cancel(deadline_after(Instant::now(), delay), cancel).await
}

/// Outcome of a bounded retry run.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, CoreError>,
    pub attempts: u32,
}

/// Retry executor that wraps operations with bounded retry logic
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an operation with retry logic.
    ///
    /// Cancellation stops further retries but never interrupts an attempt
    /// already in flight.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Operation {} succeeded after {} attempts", operation_name, attempt);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            debug!("Attempt {} failed for {}: {}", attempt, operation_name, error);

            let delay = match get_retry_strategy(&error) {
                RetryStrategy::NoRetry => {
                    debug!("Not retrying {} due to error type: {}", operation_name, error);
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
                _ if attempt >= max_attempts => {
                    warn!(
                        "Operation {} failed after {} attempts: {}",
                        operation_name, attempt, error
                    );
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
                RetryStrategy::Retry => calculate_delay(attempt - 1, &self.config),
                RetryStrategy::RetryWithDelay(delay) => delay,
            };

            info!("Retrying {} in {:?} due to: {}", operation_name, delay, error);
            if sleep_or_cancel(delay, cancel).await.is_err() {
                warn!("Abandoning retries of {} on shutdown", operation_name);
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }
        }
    }
}
