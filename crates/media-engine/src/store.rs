//! Position persistence

use crate::error::EngineResult;
use earshot_core::{BookId, PlaybackSpeed, VolumeGain};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// One position/speed snapshot of a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub book_id: BookId,
    pub current_file: PathBuf,
    pub position_ms: u64,
    pub speed: PlaybackSpeed,
    #[serde(default)]
    pub gain: VolumeGain,
}

/// Durable store the controller writes positions to
pub trait PositionStore: Send + Sync {
    fn save(&self, update: &PositionUpdate) -> EngineResult<()>;

    fn load(&self, book_id: &BookId) -> EngineResult<Option<PositionUpdate>>;
}

/// Keeps the latest position of each book in memory
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    latest: Mutex<HashMap<BookId, PositionUpdate>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of books with a saved position
    pub fn len(&self) -> usize {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PositionStore for MemoryPositionStore {
    fn save(&self, update: &PositionUpdate) -> EngineResult<()> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(update.book_id, update.clone());
        Ok(())
    }

    fn load(&self, book_id: &BookId) -> EngineResult<Option<PositionUpdate>> {
        Ok(self
            .latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(book_id)
            .cloned())
    }
}

/// One `<book id>.json` file per book, replaced atomically on every save
#[derive(Debug)]
pub struct JsonPositionStore {
    dir: PathBuf,
    /// Last update written per book; repeated identical saves are skipped
    last: Mutex<HashMap<BookId, PositionUpdate>>,
}

impl JsonPositionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, book_id: &BookId) -> PathBuf {
        self.dir.join(format!("{book_id}.json"))
    }
}

impl PositionStore for JsonPositionStore {
    fn save(&self, update: &PositionUpdate) -> EngineResult<()> {
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if last.get(&update.book_id) == Some(update) {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(update)?;

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(json.as_bytes())?;
        temp.flush()?;
        temp.persist(self.path_for(&update.book_id))
            .map_err(|e| e.error)?;

        last.insert(update.book_id, update.clone());
        log::trace!("Saved position {} ms of {}", update.position_ms, update.book_id);
        Ok(())
    }

    fn load(&self, book_id: &BookId) -> EngineResult<Option<PositionUpdate>> {
        let path = self.path_for(book_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}
