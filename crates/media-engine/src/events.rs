//! Notifications produced for the session/UI layer

use crate::state::ControllerState;
use crossbeam_channel::{unbounded, Receiver, Sender};
use earshot_core::BookId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

/// Events emitted by the playback controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    PositionChanged {
        file: PathBuf,
        position_ms: u64,
    },
    SpeedChanged {
        speed: f32,
    },
    GainChanged {
        gain_db: f32,
    },
    ChapterChanged {
        index: usize,
        file: PathBuf,
    },
    /// `-1` once the timer is inactive
    SleepTimerChanged {
        remaining_ms: i64,
    },
    SleepTimerExpired,
    /// The file could not be played at all; the caller may skip it
    MalformedFile {
        book_id: BookId,
        file: PathBuf,
        reason: String,
    },
    Error {
        book_id: Option<BookId>,
        message: String,
    },
}

/// Fan-out of events to any number of subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Sends `event` to every live subscriber, dropping the ones that hung up
    pub fn emit(&self, event: PlayerEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
