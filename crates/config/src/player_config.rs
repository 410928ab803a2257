//! Player configuration section

use crate::validation::{ConfigSection, ValidationError, Validator};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Playback engine preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerConfig {
    /// Distance covered by one skip forward/backward, in seconds
    pub seek_time_secs: u64,

    /// Rewind applied when pausing with rewind, in seconds
    pub auto_rewind_secs: u64,

    /// Default sleep timer length in minutes
    pub sleep_time_minutes: u64,

    /// Final stretch of the sleep timer over which the volume fades to
    /// silence, in seconds; 0 pauses without fading
    pub fade_out_secs: u64,

    /// Speed used for books without a stored speed (0.5 - 3.0)
    pub default_speed: f32,

    /// Playback speed change step
    pub speed_step: f32,

    /// How often the playing position is written out, in milliseconds
    pub position_sync_interval_ms: u64,

    /// Extra prepare attempts after a retryable failure
    pub prepare_retry_limit: u32,

    /// Bounded wait of the decode loop between command checks, in milliseconds
    pub decode_poll_ms: u64,

    /// Pause without rewinding when another app asks us to duck
    pub pause_on_transient_focus_loss: bool,

    /// Name of the source backend used to demux and decode chapters
    pub decoder_backend: String,
}

impl PlayerConfig {
    pub fn seek_time(&self) -> Duration {
        Duration::from_secs(self.seek_time_secs)
    }

    pub fn auto_rewind(&self) -> Duration {
        Duration::from_secs(self.auto_rewind_secs)
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time_minutes * 60)
    }

    pub fn fade_out(&self) -> Duration {
        Duration::from_secs(self.fade_out_secs)
    }

    pub fn position_sync_interval(&self) -> Duration {
        Duration::from_millis(self.position_sync_interval_ms)
    }

    pub fn decode_poll(&self) -> Duration {
        Duration::from_millis(self.decode_poll_ms)
    }
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            seek_time_secs: 20,
            auto_rewind_secs: 2,
            sleep_time_minutes: 20,
            fade_out_secs: 10,
            default_speed: 1.0,
            speed_step: 0.1,
            position_sync_interval_ms: 1000,
            prepare_retry_limit: 5,
            decode_poll_ms: 10,
            pause_on_transient_focus_loss: true,
            decoder_backend: "symphonia".to_string(),
        }
    }
}

impl ConfigSection for PlayerConfig {
    fn validate(&self) -> Result<(), Vec<ValidationError>> {
        Validator::collect_errors(vec![
            Validator::in_range(self.seek_time_secs, 1, 300, "player.seek_time_secs"),
            Validator::in_range(self.auto_rewind_secs, 0, 60, "player.auto_rewind_secs"),
            Validator::in_range(self.sleep_time_minutes, 1, 240, "player.sleep_time_minutes"),
            Validator::in_range(self.fade_out_secs, 0, 60, "player.fade_out_secs"),
            Validator::in_range(self.default_speed, 0.5, 3.0, "player.default_speed"),
            Validator::in_range(self.speed_step, 0.05, 0.5, "player.speed_step"),
            Validator::in_range(
                self.position_sync_interval_ms,
                100,
                10_000,
                "player.position_sync_interval_ms",
            ),
            Validator::in_range(self.prepare_retry_limit, 0, 20, "player.prepare_retry_limit"),
            Validator::in_range(self.decode_poll_ms, 1, 500, "player.decode_poll_ms"),
            Validator::not_empty(&self.decoder_backend, "player.decoder_backend"),
        ])
    }

    fn merge(&mut self, other: Self) {
        *self = other;
    }

    fn section_name(&self) -> &'static str {
        "player"
    }
}
