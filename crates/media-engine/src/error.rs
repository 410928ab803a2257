use crate::state::ControllerState;
use earshot_core::CoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The source lacks stream parameters playback cannot do without
    #[error("Malformed file {}: missing {}", file.display(), missing.join(", "))]
    FormatError { file: PathBuf, missing: Vec<String> },

    /// The container or codec could not be opened at all
    #[error("Unsupported format in {}: {message}", file.display())]
    UnsupportedFormat { file: PathBuf, message: String },

    /// The sink cannot be sized for the stream
    #[error("Audio device error: {0}")]
    DeviceError(String),

    /// The device exists but could not be opened right now
    #[error("Audio device busy: {0}")]
    DeviceBusy(String),

    /// Demuxer or decoder failure while streaming
    #[error("Codec error in {}: {message}", file.display())]
    CodecError { file: PathBuf, message: String },

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Cannot {command} while {state}")]
    IllegalStateTransition {
        command: &'static str,
        state: ControllerState,
    },

    #[error("No book initialized")]
    NoBookInitialized,

    #[error("Unknown decoder backend: {0}")]
    UnknownBackend(String),

    #[error("Invalid stream parameters: {0}")]
    InvalidParameters(String),

    #[error("Decode thread is gone")]
    PipelineGone,

    #[error(transparent)]
    Book(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl EngineError {
    /// Errors worth another prepare attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceBusy(_) | Self::CodecError { .. })
    }

    /// Errors that blame the file itself and surface as a malformed-file event
    pub fn is_malformed_file(&self) -> bool {
        matches!(
            self,
            Self::FormatError { .. } | Self::UnsupportedFormat { .. } | Self::DeviceError(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
