//! Error types for resilience operations

use thiserror::Error;

/// Result type for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// All retry attempts exhausted
    #[error("All {attempts} retry attempts exhausted: {last_error}")]
    RetriesExhausted { attempts: usize, last_error: String },

    /// The operation failed with an error that must not be retried
    #[error("Gave up after {attempts} attempt(s) on a permanent error: {error}")]
    Permanent { attempts: usize, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_exhausted_error() {
        let err = ResilienceError::RetriesExhausted {
            attempts: 3,
            last_error: "device busy".to_string(),
        };
        assert!(err.to_string().contains('3'));
        assert!(err.to_string().contains("device busy"));
    }

    #[test]
    fn test_permanent_error() {
        let err = ResilienceError::Permanent {
            attempts: 1,
            error: "missing duration".to_string(),
        };
        assert!(err.to_string().contains("permanent"));
    }
}
