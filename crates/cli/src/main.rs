// FILE: crates/cli/src/main.rs

use anyhow::Result;
use clap::{Arg, ArgAction, Command};

mod commands;
mod player;

fn build_cli() -> Command {
    Command::new("earshot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Audiobook player with pitch-preserving speed control")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("DIR")
                .help("Directory holding config.toml (defaults to the platform config dir)")
                .global(true),
        )
        .arg(
            Arg::new("state")
                .long("state")
                .value_name("DIR")
                .help("Directory for saved positions (defaults to the platform data dir)")
                .global(true),
        )
        .subcommand(
            Command::new("play")
                .about("Play files as the chapters of one book")
                .arg(
                    Arg::new("files")
                        .required(true)
                        .num_args(1..)
                        .value_name("FILE")
                        .help("Chapter files, in playing order"),
                )
                .arg(
                    Arg::new("name")
                        .short('n')
                        .long("name")
                        .value_name("NAME")
                        .help("Book name (defaults to the first file's directory)"),
                )
                .arg(
                    Arg::new("author")
                        .short('a')
                        .long("author")
                        .value_name("AUTHOR")
                        .help("Book author"),
                )
                .arg(
                    Arg::new("speed")
                        .short('s')
                        .long("speed")
                        .value_name("SPEED")
                        .value_parser(clap::value_parser!(f32))
                        .help("Playback speed between 0.5 and 3.0"),
                )
                .arg(
                    Arg::new("gain")
                        .short('g')
                        .long("gain")
                        .value_name("DB")
                        .value_parser(clap::value_parser!(f32))
                        .help("Volume boost in dB between 0 and 9"),
                )
                .arg(
                    Arg::new("restart")
                        .long("restart")
                        .help("Ignore the saved position")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("info")
                .about("Show stream parameters of audio files")
                .arg(
                    Arg::new("files")
                        .required(true)
                        .num_args(1..)
                        .value_name("FILE"),
                ),
        )
        .subcommand(Command::new("devices").about("List audio output devices"))
        .subcommand(Command::new("config").about("Write a default config file if none exists"))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let matches = build_cli().get_matches();
    let dirs = commands::Dirs::from_matches(&matches);

    match matches.subcommand() {
        Some(("play", sub_matches)) => commands::play(&dirs, sub_matches),
        Some(("info", sub_matches)) => commands::show_info(sub_matches),
        Some(("devices", _)) => commands::list_devices(),
        Some(("config", _)) => commands::init_config(&dirs),
        _ => {
            build_cli().print_help()?;
            Ok(())
        }
    }
}
