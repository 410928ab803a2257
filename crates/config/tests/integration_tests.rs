//! Integration tests for the configuration system

use earshot_config::{Config, ConfigError, ConfigManager, ConfigSection, PlayerConfig, CONFIG_VERSION};
use std::fs;
use tempfile::TempDir;

fn setup_test_manager() -> Result<(TempDir, ConfigManager), Box<dyn std::error::Error>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let temp_dir = TempDir::new()?;
    let manager = ConfigManager::with_directory(temp_dir.path().to_path_buf())?;
    Ok((temp_dir, manager))
}

#[test]
fn test_full_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let (_temp_dir, manager) = setup_test_manager()?;

    assert!(manager.initialize()?);

    let config = manager.load()?;
    assert_eq!(config.version, CONFIG_VERSION);

    let mut modified = config.clone();
    modified.player.default_speed = 1.5;
    modified.player.pause_on_transient_focus_loss = false;
    manager.save(&modified)?;

    let reloaded = manager.load()?;
    assert_eq!(reloaded.player.default_speed, 1.5);
    assert!(!reloaded.player.pause_on_transient_focus_loss);

    manager.reset()?;
    assert_eq!(manager.load()?, Config::default());

    Ok(())
}

#[test]
fn test_partial_file_keeps_defaults() -> Result<(), Box<dyn std::error::Error>> {
    let (_temp_dir, manager) = setup_test_manager()?;
    fs::write(
        manager.config_path(),
        "version = 1\n\n[player]\nseek_time_secs = 30\n",
    )?;

    let config = manager.load()?;
    assert_eq!(config.player.seek_time_secs, 30);
    assert_eq!(config.player.auto_rewind_secs, 2);
    assert_eq!(config.player.decoder_backend, "symphonia");
    Ok(())
}

#[test]
fn test_invalid_file_falls_back_to_defaults() -> Result<(), Box<dyn std::error::Error>> {
    let (_temp_dir, manager) = setup_test_manager()?;
    fs::write(manager.config_path(), "[player]\nprepare_retry_limit = 99\n")?;

    assert!(matches!(manager.load(), Err(ConfigError::ValidationError(_))));
    assert_eq!(manager.load_or_default(), Config::default());
    Ok(())
}

#[test]
fn test_atomic_save_leaves_no_temp_files() -> Result<(), Box<dyn std::error::Error>> {
    let (temp_dir, manager) = setup_test_manager()?;

    for limit in 0..5 {
        manager.update(|config| config.player.prepare_retry_limit = limit)?;
    }

    let names: Vec<String> = fs::read_dir(temp_dir.path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["config.toml".to_string()]);
    Ok(())
}

#[test]
fn test_section_name() {
    assert_eq!(PlayerConfig::default().section_name(), "player");
}
