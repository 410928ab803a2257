//! Integration tests for complete playback of real files
//!
//! Chapters are WAV files written to a temporary directory and decoded by
//! symphonia; output goes to a null sink.

use earshot_config::PlayerConfig;
use earshot_core::Book;
use media_engine::{
    chapter_from_file, BackendRegistry, ControllerState, EngineError, NullOutput,
    PlaybackController, PlayerEvent, SymphoniaBackend,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const RATE: u32 = 8_000;

fn write_wav(path: &Path, frames: u32) {
    let data_len = frames * 2;
    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&RATE.to_le_bytes());
    bytes.extend_from_slice(&(RATE * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    for i in 0..frames {
        let t = i as f32 / RATE as f32;
        let value = ((2.0 * std::f32::consts::PI * 330.0 * t).sin() * 6000.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let mut file = std::fs::File::create(path).expect("Failed to create wav");
    file.write_all(&bytes).expect("Failed to write wav");
}

/// Writes one WAV per duration and reads them back as a book
fn wav_book(dir: &TempDir, durations_ms: &[u32]) -> Book {
    let backend = SymphoniaBackend::new();
    let chapters = durations_ms
        .iter()
        .enumerate()
        .map(|(i, ms)| {
            let path: PathBuf = dir.path().join(format!("{:02}.wav", i + 1));
            write_wav(&path, ms * RATE / 1000);
            chapter_from_file(&backend, &path).expect("Failed to read chapter")
        })
        .collect();
    Book::new("Wave Book", None, chapters, dir.path()).expect("Invalid book")
}

fn controller(output: &NullOutput) -> PlaybackController {
    PlaybackController::builder()
        .config(PlayerConfig::default())
        .sources(BackendRegistry::with_defaults())
        .output(Arc::new(output.clone()))
        .manual_clock(true)
        .build()
        .expect("Failed to build controller")
}

fn wait_for_state(controller: &PlaybackController, state: ControllerState) -> bool {
    for _ in 0..1_000 {
        if controller.state() == state {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_chapters_report_their_duration() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let book = wav_book(&dir, &[1_500, 750]);

    assert_eq!(book.chapters()[0].duration_ms, 1_500);
    assert_eq!(book.chapters()[1].duration_ms, 750);
    assert_eq!(book.chapters()[0].name, "01");
    assert_eq!(book.global_duration_ms(), 2_250);
}

#[test]
fn test_book_plays_to_completion() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let book = wav_book(&dir, &[1_000, 1_000]);
    let output = NullOutput::unpaced();
    let controller = controller(&output);
    controller.init(book);
    let events = controller.subscribe();

    controller.play().expect("Failed to play");
    assert!(wait_for_state(&controller, ControllerState::PlaybackCompleted));

    assert_eq!(output.frames_played(), 2 * u64::from(RATE));
    let book = controller.book().expect("Book missing");
    assert_eq!(book.current_chapter_index(), 1);
    assert_eq!(book.time_ms(), 1_000);
    assert!(events
        .try_iter()
        .any(|event| matches!(event, PlayerEvent::ChapterChanged { index: 1, .. })));
}

#[test]
fn test_fast_playback_writes_fewer_frames() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let book = wav_book(&dir, &[3_000]);
    let output = NullOutput::unpaced();
    let controller = controller(&output);
    controller.init(book);

    controller.set_speed(1.5).expect("Failed to set speed");
    controller.play().expect("Failed to play");
    assert!(wait_for_state(&controller, ControllerState::PlaybackCompleted));

    let expected = 2 * u64::from(RATE);
    let played = output.frames_played();
    assert!(
        played.abs_diff(expected) < u64::from(RATE) / 20,
        "played {} frames, expected about {}",
        played,
        expected
    );
}

#[test]
fn test_resume_from_saved_position() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let book = wav_book(&dir, &[4_000]);
    let file = book.chapters()[0].file.clone();
    let book = book.with_position(&file, 3_000).expect("Bad position");
    let output = NullOutput::unpaced();
    let controller = controller(&output);
    controller.init(book);

    controller.play().expect("Failed to play");
    assert!(wait_for_state(&controller, ControllerState::PlaybackCompleted));

    // Only the last second or so is played; seeks may land a packet early
    let played = output.frames_played();
    assert!(played >= u64::from(RATE) / 2, "played {} frames", played);
    assert!(played < 2 * u64::from(RATE), "played {} frames", played);
}

#[test]
fn test_corrupt_chapter_reports_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let book = wav_book(&dir, &[1_000]);
    std::fs::write(&book.chapters()[0].file, b"definitely not audio").expect("Failed to corrupt");
    let controller = controller(&NullOutput::unpaced());
    controller.init(book);
    let events = controller.subscribe();

    let result = controller.play();
    assert!(matches!(result, Err(EngineError::UnsupportedFormat { .. })));
    assert_eq!(controller.state(), ControllerState::Error);
    assert!(events
        .try_iter()
        .any(|event| matches!(event, PlayerEvent::MalformedFile { .. })));
}
