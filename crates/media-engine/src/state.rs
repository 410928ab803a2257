//! Controller state

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the playback controller is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    Idle,
    Initialized,
    Prepared,
    Started,
    Paused,
    PlaybackCompleted,
    Error,
}

impl ControllerState {
    /// States that accept `change_position`
    pub fn accepts_position_change(self) -> bool {
        !matches!(self, Self::Idle | Self::Error)
    }

    pub fn is_playing(self) -> bool {
        self == Self::Started
    }
}

impl Default for ControllerState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Initialized => "Initialized",
            Self::Prepared => "Prepared",
            Self::Started => "Started",
            Self::Paused => "Paused",
            Self::PlaybackCompleted => "PlaybackCompleted",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}
