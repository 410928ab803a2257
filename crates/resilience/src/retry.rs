//! Retry policies with exponential backoff

use crate::error::ResilienceError;
use std::time::Duration;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first attempt)
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    use_jitter: bool,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` attempts in total (at least one)
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            use_jitter: true,
        }
    }

    /// Creates a policy from a retry count: one attempt plus `limit` retries
    pub fn from_retry_limit(limit: u32) -> Self {
        Self::new(limit as usize + 1)
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Delay to wait before retry number `attempt` (1-based); zero for 0
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let base_delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.use_jitter {
            // deterministic spread in [0.75, 1.0)
            let jitter_factor = 0.75 + (attempt as f64 * 0.1 % 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Result of [`with_retry_if`], keeping the caller's own error type
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: usize },
    Failed { error: E, attempts: usize },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of times the operation ran
    pub fn attempts(&self) -> usize {
        match self {
            Self::Succeeded { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    /// Drops the attempt count
    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Succeeded { value, .. } => Ok(value),
            Self::Failed { error, .. } => Err(error),
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy runs out of attempts
///
/// The operation receives the 1-based attempt number. Between attempts the
/// calling thread sleeps for [`RetryPolicy::delay_for_attempt`].
pub fn with_retry_if<F, R, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: R,
) -> RetryOutcome<T, E>
where
    F: FnMut(usize) -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        match operation(attempt) {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                }
            }
            Err(error) => {
                if !is_retryable(&error) || attempt >= policy.max_attempts() {
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }

                let delay = policy.delay_for_attempt(attempt);
                log::debug!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    policy.max_attempts(),
                    error,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Retries every error, reporting failure as a [`ResilienceError`]
pub fn with_retry<F, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, ResilienceError>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    match with_retry_if(policy, |_| operation(), |_| true) {
        RetryOutcome::Succeeded { value, .. } => Ok(value),
        RetryOutcome::Failed { error, attempts } => Err(ResilienceError::RetriesExhausted {
            attempts,
            last_error: error.to_string(),
        }),
    }
}
