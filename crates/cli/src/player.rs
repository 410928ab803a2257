use anyhow::{Context, Result};
use console::style;
use crossbeam_channel::{select, unbounded, Receiver};
use earshot_core::Book;
use media_engine::{ControllerState, PlaybackController, PlayerEvent, SkipDirection};
use std::io::{self, BufRead, Write};
use std::thread;

use crate::commands::format_ms;

/// Gain change per louder/quieter command, in dB
const GAIN_STEP_DB: f32 = 1.0;

/// One line of user input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    PlayPause,
    Stop,
    Forward,
    Backward,
    Next,
    Previous,
    Faster,
    Slower,
    Louder,
    Quieter,
    SleepTimer,
    Status,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Option<PlayerCommand> {
    let command = match line.trim() {
        "p" => PlayerCommand::PlayPause,
        "s" => PlayerCommand::Stop,
        "f" => PlayerCommand::Forward,
        "b" => PlayerCommand::Backward,
        "n" => PlayerCommand::Next,
        "l" => PlayerCommand::Previous,
        "+" | "=" => PlayerCommand::Faster,
        "-" | "_" => PlayerCommand::Slower,
        ">" | "." => PlayerCommand::Louder,
        "<" | "," => PlayerCommand::Quieter,
        "t" => PlayerCommand::SleepTimer,
        "i" | "" => PlayerCommand::Status,
        "h" | "?" => PlayerCommand::Help,
        "q" => PlayerCommand::Quit,
        _ => return None,
    };
    Some(command)
}

/// Plays `book` and reads commands from stdin until `q` or end of input
pub fn run(controller: &PlaybackController, book: Book) -> Result<()> {
    println!("\n  {}", style(book.name()).bold().cyan());
    if let Some(author) = book.author() {
        println!("  by {}", style(author).dim());
    }
    println!("  {} chapters, {}", book.chapters().len(), format_ms(book.global_duration_ms()));

    let events = controller.subscribe();
    let (stop_tx, stop_rx) = unbounded::<()>();
    let printer = thread::Builder::new()
        .name("earshot-events".to_string())
        .spawn(move || print_events(&events, &stop_rx))
        .context("Failed to start event printer")?;

    controller.init(book);
    if let Err(e) = controller.play() {
        println!("  {} {}", style("Cannot play:").red(), e);
    }
    print_help();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read input")?;
        match parse_command(&line) {
            Some(PlayerCommand::Quit) => break,
            Some(command) => {
                if let Err(e) = apply(controller, command) {
                    println!("  {}", style(e).yellow());
                }
            }
            None => println!("  Unknown command '{}', h for help", line.trim()),
        }
        io::stdout().flush().ok();
    }

    if controller.state() != ControllerState::Idle {
        if let Err(e) = controller.stop() {
            log::warn!("Stopping on exit failed: {}", e);
        }
    }
    let _ = stop_tx.send(());
    if printer.join().is_err() {
        log::error!("Event printer panicked");
    }
    Ok(())
}

fn apply(controller: &PlaybackController, command: PlayerCommand) -> media_engine::EngineResult<()> {
    let step = controller.config().speed_step;
    match command {
        PlayerCommand::PlayPause => controller.play_pause(),
        PlayerCommand::Stop => controller.stop(),
        PlayerCommand::Forward => controller.skip(SkipDirection::Forward),
        PlayerCommand::Backward => controller.skip(SkipDirection::Backward),
        PlayerCommand::Next => controller.next(),
        PlayerCommand::Previous => controller.previous(false),
        PlayerCommand::Faster => controller.set_speed(controller.speed().step(step).value()),
        PlayerCommand::Slower => controller.set_speed(controller.speed().step(-step).value()),
        PlayerCommand::Louder => controller.set_gain(controller.gain().step(GAIN_STEP_DB).db()),
        PlayerCommand::Quieter => controller.set_gain(controller.gain().step(-GAIN_STEP_DB).db()),
        PlayerCommand::SleepTimer => {
            if controller.sleep_timer_active() {
                controller.sleep_timer_deactivate();
            } else {
                controller.sleep_timer_activate();
            }
            Ok(())
        }
        PlayerCommand::Status => {
            print_status(controller);
            Ok(())
        }
        PlayerCommand::Help => {
            print_help();
            Ok(())
        }
        PlayerCommand::Quit => Ok(()),
    }
}

fn print_status(controller: &PlaybackController) {
    let Some(book) = controller.book() else {
        return;
    };
    let chapter = book.current_chapter();
    println!(
        "  [{}] {} ({}/{})  {} / {}  {:.2}x",
        style(controller.state()).green(),
        chapter.name,
        book.current_chapter_index() + 1,
        book.chapters().len(),
        format_ms(controller.current_position_ms()),
        format_ms(controller.duration_ms()),
        controller.speed().value()
    );
    let gain = controller.gain();
    if gain.db() > 0.0 {
        println!("  Gain: {}", gain);
    }
    let remaining = controller.sleep_timer_remaining_ms();
    if remaining >= 0 {
        println!("  Sleep timer: {}", format_ms(remaining.unsigned_abs()));
    }
}

fn print_help() {
    println!("\n  Controls (type a letter, then Enter):");
    println!("    p  play/pause      s  stop");
    println!("    f  skip forward    b  skip back");
    println!("    n  next chapter    l  previous chapter");
    println!("    +  faster          -  slower");
    println!("    >  louder          <  quieter");
    println!("    t  sleep timer     i  status");
    println!("    q  quit\n");
}

fn print_events(events: &Receiver<PlayerEvent>, stop: &Receiver<()>) {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => print_event(&event),
                Err(_) => return,
            },
            recv(stop) -> _ => return,
        }
    }
}

fn print_event(event: &PlayerEvent) {
    match event {
        PlayerEvent::ChapterChanged { index, file } => {
            println!("  {} {} ({})", style("Chapter").cyan(), index + 1, file.display());
        }
        PlayerEvent::SpeedChanged { speed } => println!("  Speed {:.2}x", speed),
        PlayerEvent::GainChanged { gain_db } => println!("  Gain +{:.1} dB", gain_db),
        PlayerEvent::StateChanged {
            to: ControllerState::PlaybackCompleted,
            ..
        } => println!("  {}", style("Finished the book").green().bold()),
        PlayerEvent::SleepTimerExpired => println!("  {}", style("Sleep timer expired").yellow()),
        PlayerEvent::MalformedFile { file, reason, .. } => {
            println!("  {} {}: {}", style("Unplayable").red(), file.display(), reason);
        }
        PlayerEvent::Error { message, .. } => println!("  {} {}", style("Error").red(), message),
        other => log::debug!("{:?}", other),
    }
}
