//! Bounded retry for operations that can fail transiently
//!
//! # Example
//!
//! ```rust
//! use earshot_resilience::{with_retry_if, RetryOutcome, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_millis(1));
//! let outcome = with_retry_if(&policy, |_attempt| Ok::<_, String>(7), |_err| true);
//! assert!(matches!(outcome, RetryOutcome::Succeeded { value: 7, attempts: 1 }));
//! ```

mod error;
mod retry;

pub use error::{ResilienceError, ResilienceResult};
pub use retry::{with_retry, with_retry_if, RetryOutcome, RetryPolicy};
