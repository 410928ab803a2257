// FILE: crates/cli/src/commands.rs

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use console::style;
use earshot_config::{ConfigManager, PlayerConfig};
use earshot_core::{Book, PlaybackSpeed, VolumeGain};
use media_engine::{
    chapter_from_file, list_output_devices, read_stream_info, BackendRegistry, JsonPositionStore,
    PlaybackController, PositionStore, SourceBackend,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::player;

/// Directories chosen on the command line
#[derive(Debug, Default, Clone)]
pub struct Dirs {
    pub config: Option<PathBuf>,
    pub state: Option<PathBuf>,
}

impl Dirs {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let lookup = |id: &str| {
            matches
                .get_one::<String>(id)
                .or_else(|| {
                    matches
                        .subcommand()
                        .and_then(|(_, sub)| sub.get_one::<String>(id))
                })
                .map(PathBuf::from)
        };
        Self {
            config: lookup("config"),
            state: lookup("state"),
        }
    }

    fn config_manager(&self) -> Result<ConfigManager> {
        let manager = match &self.config {
            Some(dir) => ConfigManager::with_directory(dir.clone()),
            None => ConfigManager::new(),
        };
        manager.context("Failed to resolve the config directory")
    }

    fn state_dir(&self) -> Result<PathBuf> {
        match &self.state {
            Some(dir) => Ok(dir.clone()),
            None => Ok(ConfigManager::default_data_dir()
                .context("Failed to resolve the data directory")?
                .join("positions")),
        }
    }
}

/// Loads the player settings, honoring `EARSHOT_PLAYER_*` overrides
pub fn load_config(dirs: &Dirs) -> Result<PlayerConfig> {
    let manager = dirs.config_manager()?;
    let config = match manager.load_with_env_overrides() {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Ignoring environment overrides: {}", e);
            manager.load_or_default()
        }
    };
    Ok(config.player)
}

/// Reads the stream info of every file and builds a book from them
pub fn build_book(
    backend: &dyn SourceBackend,
    files: &[PathBuf],
    name: Option<&str>,
    author: Option<&str>,
) -> Result<Book> {
    let Some(first) = files.first() else {
        bail!("No chapter files given");
    };

    let chapters = files
        .iter()
        .map(|file| {
            chapter_from_file(backend, file)
                .with_context(|| format!("Failed to read {}", file.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let root = first
        .canonicalize()
        .unwrap_or_else(|_| first.clone())
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Untitled".to_string())
    });

    Book::new(name, author.map(str::to_string), chapters, root).context("Invalid book")
}

/// Moves `book` to the saved position, if the store has one that still fits
pub fn restore_position(book: Book, store: &dyn PositionStore) -> Book {
    let saved = match store.load(&book.id()) {
        Ok(Some(saved)) => saved,
        Ok(None) => return book,
        Err(e) => {
            log::warn!("Failed to read saved position: {}", e);
            return book;
        }
    };

    match book.clone().with_position(&saved.current_file, saved.position_ms) {
        Ok(book) => book.with_speed(saved.speed).with_gain(saved.gain),
        Err(e) => {
            log::warn!("Saved position no longer matches the book: {}", e);
            book
        }
    }
}

pub fn play(dirs: &Dirs, matches: &ArgMatches) -> Result<()> {
    let files: Vec<PathBuf> = matches
        .get_many::<String>("files")
        .ok_or_else(|| anyhow::anyhow!("At least one file is required"))?
        .map(PathBuf::from)
        .collect();

    let config = load_config(dirs)?;
    let sources = BackendRegistry::with_defaults();
    let backend = sources
        .get(&config.decoder_backend)
        .context("Configured decoder backend is not available")?;

    let book = build_book(
        backend.as_ref(),
        &files,
        matches.get_one::<String>("name").map(String::as_str),
        matches.get_one::<String>("author").map(String::as_str),
    )?;

    let store = Arc::new(JsonPositionStore::new(dirs.state_dir()?));
    let mut book = if matches.get_flag("restart") {
        book
    } else {
        restore_position(book, store.as_ref())
    };

    let speed = match matches.get_one::<f32>("speed") {
        Some(&speed) => Some(speed),
        None if book.speed().is_normal() => Some(config.default_speed),
        None => None,
    };
    if let Some(speed) = speed {
        book.set_speed(PlaybackSpeed::new(speed).context("Invalid speed")?);
    }
    if let Some(&gain) = matches.get_one::<f32>("gain") {
        book.set_gain(VolumeGain::new(gain).context("Invalid gain")?);
    }

    let controller = PlaybackController::builder()
        .config(config)
        .sources(sources)
        .store(store)
        .build()
        .context("Failed to create the player")?;

    player::run(&controller, book)
}

pub fn show_info(matches: &ArgMatches) -> Result<()> {
    let backend = media_engine::SymphoniaBackend::new();
    let files = matches
        .get_many::<String>("files")
        .ok_or_else(|| anyhow::anyhow!("At least one file is required"))?;

    for file in files {
        let path = Path::new(file);
        match read_stream_info(&backend, path) {
            Ok(info) => println!(
                "{}  {}  {} Hz  {} ch  {}",
                style(file).bold(),
                format_ms(info.duration_ms),
                info.sample_rate,
                info.channels,
                info.codec
            ),
            Err(e) => println!("{}  {}", style(file).bold(), style(e).red()),
        }
    }
    Ok(())
}

pub fn list_devices() -> Result<()> {
    let devices = list_output_devices().context("Failed to list output devices")?;
    if devices.is_empty() {
        println!("No audio output devices found.");
        return Ok(());
    }

    for device in devices {
        let marker = if device.is_default { "*" } else { " " };
        println!(
            "{} {}  ({}-{} channels, default rate {})",
            style(marker).green().bold(),
            style(&device.name).cyan(),
            device.min_channels,
            device.max_channels,
            device
                .default_sample_rate
                .map_or_else(|| "unknown".to_string(), |rate| format!("{rate} Hz"))
        );
    }
    Ok(())
}

pub fn init_config(dirs: &Dirs) -> Result<()> {
    let manager = dirs.config_manager()?;
    if manager.initialize().context("Failed to write config")? {
        println!("Wrote {}", manager.config_path().display());
    } else {
        println!("Config already exists at {}", manager.config_path().display());
    }
    Ok(())
}

/// `h:mm:ss` or `m:ss`
pub fn format_ms(ms: u64) -> String {
    let total = ms / 1000;
    let (hours, minutes, seconds) = (total / 3600, total / 60 % 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
