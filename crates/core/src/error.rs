//! Error types for the domain model

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building or mutating domain values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// A book failed validation; every violation is listed
    #[error("Invalid book: {}", errors.join("; "))]
    InvalidBook { errors: Vec<String> },

    /// Speed outside the supported range or not a finite number
    #[error("Invalid playback speed {speed}: must be between {min} and {max}")]
    InvalidSpeed { speed: f32, min: f32, max: f32 },

    /// Gain outside 0 dB to the supported boost
    #[error("Invalid volume gain {db} dB: must be between 0 and {max}")]
    InvalidGain { db: f32, max: f32 },

    /// The file does not belong to any chapter of the book
    #[error("Unknown chapter file: {}", file.display())]
    UnknownChapter { file: PathBuf },
}

impl CoreError {
    /// Returns true if the caller supplied a value outside the domain
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSpeed { .. } | Self::InvalidGain { .. } | Self::UnknownChapter { .. }
        )
    }
}

/// Result type alias for domain operations
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_book_lists_all_errors() {
        let err = CoreError::InvalidBook {
            errors: vec!["Name cannot be empty".into(), "Book has no chapters".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Name cannot be empty"));
        assert!(msg.contains("Book has no chapters"));
    }

    #[test]
    fn test_user_errors() {
        let speed = CoreError::InvalidSpeed {
            speed: 4.0,
            min: 0.5,
            max: 3.0,
        };
        assert!(speed.is_user_error());
        assert!(!CoreError::InvalidBook { errors: vec![] }.is_user_error());
    }
}
