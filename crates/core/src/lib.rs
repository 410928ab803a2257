//! Domain model shared by the Earshot crates: books, chapters, speed and gain.

pub mod error;
pub mod types;

// Re-export commonly used types
pub use error::{CoreError, Result};
pub use types::{Book, BookId, Chapter, ChapterMark, PlaybackSpeed, Validator, VolumeGain};
