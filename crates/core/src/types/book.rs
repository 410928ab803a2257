//! Book and chapter domain models

use crate::error::{CoreError, Result};
use crate::types::{PlaybackSpeed, Validator, VolumeGain};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Unique identifier for a book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookId(Uuid);

impl BookId {
    /// Creates a new random BookId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a stable BookId derived from the book's root path
    ///
    /// The same root always maps to the same id, so a front-end without a
    /// library database can still find a saved position again.
    pub fn from_root(root: &Path) -> Self {
        Self(Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            root.to_string_lossy().as_bytes(),
        ))
    }

    /// Creates a BookId from a UUID string
    pub fn from_string(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Returns the BookId as a string
    pub fn as_string(&self) -> String {
        self.0.to_string()
    }
}

impl Default for BookId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named section inside one chapter file, such as an embedded chapter of
/// a single-file audiobook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMark {
    pub name: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl ChapterMark {
    pub fn new(name: impl Into<String>, start_ms: u64, end_ms: u64) -> Self {
        Self {
            name: name.into(),
            start_ms,
            end_ms,
        }
    }

    pub fn contains(&self, position_ms: u64) -> bool {
        (self.start_ms..=self.end_ms).contains(&position_ms)
    }
}

/// One playable audio file of a book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub file: PathBuf,
    pub duration_ms: u64,
    pub name: String,
    /// Sections inside the file, ordered by start; empty when the file is
    /// one section
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<ChapterMark>,
}

impl Chapter {
    /// Creates a new chapter
    pub fn new(file: impl Into<PathBuf>, duration_ms: u64, name: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            duration_ms,
            name: name.into(),
            marks: Vec::new(),
        }
    }

    /// Replaces the marks
    pub fn with_marks(mut self, marks: Vec<ChapterMark>) -> Self {
        self.marks = marks;
        self
    }

    /// Index of the mark playing at `position_ms`.
    ///
    /// Falls back to the last mark when no mark covers the position; `None`
    /// only for chapters without marks.
    pub fn mark_index_at(&self, position_ms: u64) -> Option<usize> {
        if self.marks.is_empty() {
            return None;
        }
        Some(
            self.marks
                .iter()
                .position(|mark| mark.contains(position_ms))
                .unwrap_or(self.marks.len() - 1),
        )
    }

    pub fn mark_at(&self, position_ms: u64) -> Option<&ChapterMark> {
        self.mark_index_at(position_ms).map(|index| &self.marks[index])
    }
}

impl Validator for Chapter {
    fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.file.as_os_str().is_empty() {
            errors.push("Chapter file cannot be empty".to_string());
        }

        if self.duration_ms == 0 {
            errors.push(format!(
                "Chapter {} must have a duration greater than zero",
                self.file.display()
            ));
        }

        for (index, mark) in self.marks.iter().enumerate() {
            if mark.start_ms > mark.end_ms || mark.end_ms > self.duration_ms {
                errors.push(format!(
                    "Mark '{}' of {} spans {}..{}ms outside the chapter",
                    mark.name,
                    self.file.display(),
                    mark.start_ms,
                    mark.end_ms
                ));
            }
            if index > 0 && mark.start_ms <= self.marks[index - 1].start_ms {
                errors.push(format!(
                    "Marks of {} are not in ascending order",
                    self.file.display()
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// An audiobook: ordered chapters plus the listener's position and speed
///
/// The current chapter always names exactly one element of `chapters` and the
/// position never exceeds that chapter's duration. Every constructor and
/// mutator keeps this true, and deserialization re-validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BookRecord", into = "BookRecord")]
pub struct Book {
    id: BookId,
    name: String,
    author: Option<String>,
    chapters: Vec<Chapter>,
    current: usize,
    time_ms: u64,
    speed: PlaybackSpeed,
    gain: VolumeGain,
    root: PathBuf,
}

impl Book {
    /// Creates a book positioned at the start of its first chapter
    pub fn new(
        name: impl Into<String>,
        author: Option<String>,
        chapters: Vec<Chapter>,
        root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let root = root.into();
        let current_file = chapters
            .first()
            .map(|c| c.file.clone())
            .unwrap_or_default();

        BookRecord {
            id: BookId::from_root(&root),
            name: name.into(),
            author,
            chapters,
            current_file,
            time_ms: 0,
            speed: PlaybackSpeed::default().value(),
            gain_db: 0.0,
            root,
        }
        .try_into()
    }

    /// Moves to `file` at `time_ms`, clamping the time to the chapter duration
    pub fn with_position(mut self, file: &Path, time_ms: u64) -> Result<Self> {
        self.set_position(file, time_ms)?;
        Ok(self)
    }

    /// Replaces the playback speed
    pub fn with_speed(mut self, speed: PlaybackSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// In-place form of [`Book::with_position`]
    pub fn set_position(&mut self, file: &Path, time_ms: u64) -> Result<()> {
        let index = self
            .index_of(file)
            .ok_or_else(|| CoreError::UnknownChapter {
                file: file.to_path_buf(),
            })?;
        self.current = index;
        self.time_ms = time_ms.min(self.chapters[index].duration_ms);
        Ok(())
    }

    /// In-place form of [`Book::with_speed`]
    pub fn set_speed(&mut self, speed: PlaybackSpeed) {
        self.speed = speed;
    }

    pub fn with_gain(mut self, gain: VolumeGain) -> Self {
        self.gain = gain;
        self
    }

    pub fn set_gain(&mut self, gain: VolumeGain) {
        self.gain = gain;
    }

    pub fn id(&self) -> BookId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn chapters(&self) -> &[Chapter] {
        &self.chapters
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn speed(&self) -> PlaybackSpeed {
        self.speed
    }

    pub fn gain(&self) -> VolumeGain {
        self.gain
    }

    /// Position inside the current chapter in milliseconds
    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub fn current_file(&self) -> &Path {
        &self.chapters[self.current].file
    }

    pub fn current_chapter(&self) -> &Chapter {
        &self.chapters[self.current]
    }

    pub fn current_chapter_index(&self) -> usize {
        self.current
    }

    /// The chapter after the current one, if any
    pub fn next_chapter(&self) -> Option<&Chapter> {
        self.chapters.get(self.current + 1)
    }

    /// The mark after the one playing, within the current chapter
    pub fn next_mark(&self) -> Option<&ChapterMark> {
        let chapter = self.current_chapter();
        let index = chapter.mark_index_at(self.time_ms)?;
        chapter.marks.get(index + 1)
    }

    /// The chapter before the current one, if any
    pub fn previous_chapter(&self) -> Option<&Chapter> {
        self.current
            .checked_sub(1)
            .and_then(|index| self.chapters.get(index))
    }

    /// Looks up the chapter backed by `file`
    pub fn chapter_for(&self, file: &Path) -> Option<&Chapter> {
        self.index_of(file).map(|index| &self.chapters[index])
    }

    fn index_of(&self, file: &Path) -> Option<usize> {
        self.chapters.iter().position(|c| c.file == file)
    }

    /// Sum of all chapter durations
    pub fn global_duration_ms(&self) -> u64 {
        self.chapters.iter().map(|c| c.duration_ms).sum()
    }

    /// Position measured from the start of the first chapter
    pub fn global_position_ms(&self) -> u64 {
        self.chapters[..self.current]
            .iter()
            .map(|c| c.duration_ms)
            .sum::<u64>()
            + self.time_ms
    }
}

impl Validator for Book {
    fn validate(&self) -> std::result::Result<(), Vec<String>> {
        BookRecord::from(self.clone()).validate()
    }
}

/// Serialized form of a book; also the input of validation
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BookRecord {
    id: BookId,
    name: String,
    author: Option<String>,
    chapters: Vec<Chapter>,
    current_file: PathBuf,
    time_ms: u64,
    speed: f32,
    #[serde(default)]
    gain_db: f32,
    root: PathBuf,
}

impl Validator for BookRecord {
    fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Name cannot be empty".to_string());
        }

        if self.chapters.is_empty() {
            errors.push("Book has no chapters".to_string());
        }

        let mut seen = HashSet::new();
        for chapter in &self.chapters {
            if let Err(chapter_errors) = chapter.validate() {
                errors.extend(chapter_errors);
            }
            if !seen.insert(&chapter.file) {
                errors.push(format!(
                    "Chapter file {} appears more than once",
                    chapter.file.display()
                ));
            }
        }

        match self.chapters.iter().find(|c| c.file == self.current_file) {
            Some(chapter) if self.time_ms > chapter.duration_ms => errors.push(format!(
                "Position {}ms exceeds chapter duration {}ms",
                self.time_ms, chapter.duration_ms
            )),
            Some(_) => {}
            None if !self.chapters.is_empty() => errors.push(format!(
                "Current file {} is not a chapter of this book",
                self.current_file.display()
            )),
            None => {}
        }

        if let Err(speed_errors) = PlaybackSpeed::new(self.speed).map_err(|e| vec![e.to_string()]) {
            errors.extend(speed_errors);
        }

        if let Err(e) = VolumeGain::new(self.gain_db) {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl TryFrom<BookRecord> for Book {
    type Error = CoreError;

    fn try_from(record: BookRecord) -> Result<Self> {
        record
            .validate()
            .map_err(|errors| CoreError::InvalidBook { errors })?;

        let current = record
            .chapters
            .iter()
            .position(|c| c.file == record.current_file)
            .unwrap_or(0);

        Ok(Self {
            id: record.id,
            name: record.name,
            author: record.author,
            chapters: record.chapters,
            current,
            time_ms: record.time_ms,
            speed: PlaybackSpeed::new(record.speed)?,
            gain: VolumeGain::new(record.gain_db)?,
            root: record.root,
        })
    }
}

impl From<Book> for BookRecord {
    fn from(book: Book) -> Self {
        let current_file = book.chapters[book.current].file.clone();
        Self {
            id: book.id,
            name: book.name,
            author: book.author,
            chapters: book.chapters,
            current_file,
            time_ms: book.time_ms,
            speed: book.speed.value(),
            gain_db: book.gain.db(),
            root: book.root,
        }
    }
}
