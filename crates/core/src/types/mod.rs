//! Domain types for Earshot
//!
//! - `book`: Book, Chapter and BookId
//! - `playback`: Playback speed and volume gain
//! - `common`: Shared traits

mod book;
mod common;
mod playback;

pub use book::{Book, BookId, Chapter, ChapterMark};
pub use common::Validator;
pub use playback::{PlaybackSpeed, VolumeGain};
