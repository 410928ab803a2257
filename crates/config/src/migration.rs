//! Upgrades config files written by older versions

use crate::{Config, CONFIG_VERSION};

/// Brings `config` up to [`CONFIG_VERSION`]
///
/// Fields an older file lacks were already filled with defaults by serde, so
/// upgrading only stamps the current version. Newer files are used as-is.
pub fn migrate_to_latest(mut config: Config) -> Config {
    if config.version > CONFIG_VERSION {
        log::warn!(
            "Config version {} is newer than supported version {}. Attempting to use as-is.",
            config.version,
            CONFIG_VERSION
        );
        return config;
    }

    if config.version < CONFIG_VERSION {
        log::info!(
            "Migrating config from version {} to {}",
            config.version,
            CONFIG_VERSION
        );
        config.version = CONFIG_VERSION;
    }

    config
}

/// Returns true if a file with this version must be rewritten after loading
pub fn needs_rewrite(version: u32) -> bool {
    version < CONFIG_VERSION
}
