//! Retry logic for failed operations with exponential backoff.
//!
//! Provides configurable retry strategies for engine operations with:
//! - Exponential backoff with jitter
//! - Max retry limits
//! - Error classification via [`ErrorClass`](crate::core::ErrorClass)
//! - Cancellation-aware waiting between attempts

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::config;
use crate::core::error::{EngineError, EngineResult, ErrorClass};
use crate::core::metrics;

/// Retry strategy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try.
    /// A value of 2 yields three attempts in total.
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    #[must_use]
    pub fn no_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.add_jitter {
            // Add up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25 * capped_delay;
            capped_delay + jitter
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Predefined retry configs for different scenarios.
impl RetryConfig {
    /// Job-level transfer policy. Three attempts in total with slow
    /// backoff, because each attempt may also swap to a fresh credential.
    pub fn transfer() -> Self {
        Self {
            max_retries: config::retry::MAX_JOB_ATTEMPTS - 1,
            initial_delay: config::retry::initial_delay(),
            max_delay: config::retry::max_delay(),
            backoff_multiplier: config::retry::BACKOFF_MULTIPLIER,
            add_jitter: true,
        }
    }

    /// Policy for waiting out a momentarily exhausted credential pool.
    pub fn acquire() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.5,
            add_jitter: true,
        }
    }

    /// Config for quick retries (e.g., temporary failures).
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

/// What to do after an attempt finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// The attempt succeeded, stop here
    Done,
    /// Schedule another attempt after the given delay
    RetryAfter(Duration),
    /// The error is not worth retrying, or the budget is spent
    GiveUp,
}

/// Decides the next step after `attempts` tries produced `result`.
///
/// Only [`ErrorClass::Transient`] failures are retried. When the error
/// carries a server hint the delay is the larger of the hint and the
/// computed backoff, so a hint can stretch a wait but never shrink it.
pub fn evaluate<T>(config: &RetryConfig, attempts: u32, result: &EngineResult<T>) -> RetryStep {
    let err = match result {
        Ok(_) => return RetryStep::Done,
        Err(err) => err,
    };

    if err.class() != ErrorClass::Transient || attempts > config.max_retries {
        return RetryStep::GiveUp;
    }

    let backoff = config.delay_for_attempt(attempts.saturating_sub(1));
    let delay = match err.retry_after() {
        Some(hint) => backoff.max(hint),
        None => backoff,
    };

    RetryStep::RetryAfter(delay)
}

/// Executes an async operation with retry logic.
///
/// The closure receives the 1-based attempt number. Between attempts the
/// sleep races the cancellation token, so a cancelled job never sits out
/// a full backoff window.
pub async fn execute<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> EngineResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        attempts += 1;
        let result = operation(attempts).await;

        match evaluate(config, attempts, &result) {
            RetryStep::Done | RetryStep::GiveUp => return result,
            RetryStep::RetryAfter(delay) => {
                metrics::RETRIES_TOTAL
                    .with_label_values(&[&attempts.to_string()])
                    .inc();

                if let Err(ref e) = result {
                    log::warn!(
                        "Attempt {}/{} for {} failed (retrying in {:?}): {}",
                        attempts,
                        config.max_retries + 1,
                        operation_name,
                        delay,
                        e
                    );
                }

                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
