//! Earshot configuration
//!
//! Settings live in a single TOML file split into sections. Each section is a
//! type implementing [`ConfigSection`], so validation and merging stay local to
//! the feature that owns the values.
//!
//! - Invalid or unreadable files fall back to defaults with a warning
//!   ([`ConfigManager::load_or_default`])
//! - Writes go through a temporary file and an atomic rename
//! - Files written by an older version are upgraded and rewritten on load
//!
//! # Example
//!
//! ```rust,no_run
//! use earshot_config::ConfigManager;
//!
//! let manager = ConfigManager::new().expect("Failed to initialize config");
//! let config = manager.load_or_default();
//! println!("Seek time: {}s", config.player.seek_time_secs);
//! ```

mod error;
mod manager;
mod migration;
mod persistence;
mod player_config;
mod validation;

pub use error::{ConfigError, ConfigResult, ValidationError};
pub use manager::ConfigManager;
pub use player_config::PlayerConfig;
pub use validation::{ConfigSection, Validator};

use serde::{Deserialize, Serialize};

/// Current config file format version
pub const CONFIG_VERSION: u32 = 1;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Config file format version
    pub version: u32,

    /// Playback engine settings
    pub player: PlayerConfig,
}

impl Config {
    /// Creates a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the entire configuration, returning every error found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        self.player.validate()
    }

    /// Merges this config with another, preferring values from `other`
    pub fn merge(&mut self, other: Config) {
        self.player.merge(other.player);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            player: PlayerConfig::default(),
        }
    }
}
