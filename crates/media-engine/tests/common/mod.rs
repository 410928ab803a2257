//! Shared fakes for the media-engine integration tests
#![allow(dead_code)]

use crossbeam_channel::Receiver;
use earshot_config::PlayerConfig;
use earshot_core::{Book, Chapter, ChapterMark};
use media_engine::{
    AudioSource, EngineError, EngineResult, NullOutput, PlaybackController, PlayerEvent,
    SourceBackend, StreamParams,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const RATE: u32 = 8_000;

// ============================================================================
// Fake source backend
// ============================================================================

/// Describes what a fake chapter file decodes to
#[derive(Debug, Clone)]
pub struct FakeTrack {
    pub params: StreamParams,
    pub frames: u64,
    pub chunk_frames: usize,
    /// Sleep before every chunk; keeps a chapter "playing" for a while
    pub chunk_delay: Duration,
    /// Fail with a codec error once this many chunks were produced
    pub fail_after: Option<usize>,
    /// Seeks land this far past the requested position
    pub seek_overshoot_ms: u64,
}

impl FakeTrack {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            params: StreamParams {
                sample_rate: Some(RATE),
                channels: Some(1),
                duration_ms: Some(duration_ms),
                codec: Some("pcm_f32le".to_string()),
            },
            frames: duration_ms * u64::from(RATE) / 1000,
            chunk_frames: 512,
            chunk_delay: Duration::ZERO,
            fail_after: None,
            seek_overshoot_ms: 0,
        }
    }

    /// Decodes slower than real time so the chapter never ends during a test
    pub fn slow(mut self) -> Self {
        self.chunk_delay = Duration::from_millis(20);
        self
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Seeks land on the next "keyframe" `ms` after the target
    pub fn overshooting_seeks(mut self, ms: u64) -> Self {
        self.seek_overshoot_ms = ms;
        self
    }

    pub fn without_duration(mut self) -> Self {
        self.params.duration_ms = None;
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.params.channels = Some(channels);
        self
    }
}

#[derive(Default)]
pub struct FakeBackend {
    tracks: Mutex<HashMap<PathBuf, FakeTrack>>,
    opens: AtomicUsize,
    transient_failures: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&self, path: impl Into<PathBuf>, track: FakeTrack) {
        self.tracks
            .lock()
            .unwrap()
            .insert(path.into(), track);
    }

    /// The next `count` opens fail with a retryable codec error
    pub fn fail_next_opens(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Sources currently alive, i.e. owned by a decode thread
    pub fn live_sources(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl SourceBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn open(&self, path: &Path) -> EngineResult<Box<dyn AudioSource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(EngineError::CodecError {
                file: path.to_path_buf(),
                message: "decoder busy".to_string(),
            });
        }

        let track = self
            .tracks
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::FileNotFound(path.to_path_buf()))?;

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            path: path.to_path_buf(),
            track,
            cursor: 0,
            chunks: 0,
            live: Arc::clone(&self.live),
        }))
    }
}

struct FakeSource {
    path: PathBuf,
    track: FakeTrack,
    cursor: u64,
    chunks: usize,
    live: Arc<AtomicUsize>,
}

impl AudioSource for FakeSource {
    fn params(&self) -> &StreamParams {
        &self.track.params
    }

    fn next_chunk(&mut self) -> EngineResult<Option<Vec<f32>>> {
        if self.track.fail_after == Some(self.chunks) {
            return Err(EngineError::CodecError {
                file: self.path.clone(),
                message: "corrupt frame".to_string(),
            });
        }
        if self.cursor >= self.track.frames {
            return Ok(None);
        }
        if !self.track.chunk_delay.is_zero() {
            thread::sleep(self.track.chunk_delay);
        }

        let channels = usize::from(self.track.params.channels.unwrap_or(1));
        let frames = (self.track.frames - self.cursor).min(self.track.chunk_frames as u64);
        let mut samples = Vec::with_capacity(frames as usize * channels);
        for i in 0..frames {
            let t = (self.cursor + i) as f32 / RATE as f32;
            let value = (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 0.25;
            samples.extend(std::iter::repeat(value).take(channels));
        }
        self.cursor += frames;
        self.chunks += 1;
        Ok(Some(samples))
    }

    fn seek(&mut self, position_ms: u64) -> EngineResult<u64> {
        let target = position_ms + self.track.seek_overshoot_ms;
        self.cursor = (target * u64::from(RATE) / 1000).min(self.track.frames);
        Ok(self.cursor * 1000 / u64::from(RATE))
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Books and controllers
// ============================================================================

/// A book whose chapters are `/fake/book/NN.mp3` with the given durations
pub fn book(durations_ms: &[u64]) -> Book {
    let chapters = durations_ms
        .iter()
        .enumerate()
        .map(|(i, &ms)| Chapter::new(chapter_path(i), ms, format!("Chapter {}", i + 1)))
        .collect();
    Book::new("The Test Book", Some("A. Writer".to_string()), chapters, "/fake/book").unwrap()
}

/// Two one-minute chapters; the first is split into three marks
pub fn marked_book() -> Book {
    let marks = vec![
        ChapterMark::new("Prologue", 0, 19_999),
        ChapterMark::new("Part One", 20_000, 39_999),
        ChapterMark::new("Part Two", 40_000, 60_000),
    ];
    let chapters = vec![
        Chapter::new(chapter_path(0), 60_000, "Opening").with_marks(marks),
        Chapter::new(chapter_path(1), 60_000, "Chapter 2"),
    ];
    Book::new("Marked Book", None, chapters, "/fake/book").unwrap()
}

pub fn chapter_path(index: usize) -> PathBuf {
    PathBuf::from(format!("/fake/book/{:02}.mp3", index + 1))
}

/// Registers slow tracks for every chapter of `book`
pub fn register_slow(backend: &FakeBackend, book: &Book) {
    for chapter in book.chapters() {
        backend.add_track(&chapter.file, FakeTrack::new(chapter.duration_ms).slow());
    }
}

pub fn controller_with(
    backend: Arc<FakeBackend>,
    config: PlayerConfig,
    manual_clock: bool,
) -> PlaybackController {
    controller_with_output(backend, config, manual_clock, Arc::new(NullOutput::unpaced()))
}

/// Like [`controller_with`], writing into `output` so tests can inspect it
pub fn controller_with_output(
    backend: Arc<FakeBackend>,
    config: PlayerConfig,
    manual_clock: bool,
    output: Arc<NullOutput>,
) -> PlaybackController {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut sources = media_engine::BackendRegistry::new();
    sources.register(backend);
    PlaybackController::builder()
        .config(PlayerConfig {
            decoder_backend: "fake".to_string(),
            ..config
        })
        .sources(sources)
        .output(output)
        .manual_clock(manual_clock)
        .build()
        .unwrap()
}

pub fn controller(backend: Arc<FakeBackend>) -> PlaybackController {
    controller_with(backend, PlayerConfig::default(), true)
}

// ============================================================================
// Event helpers
// ============================================================================

/// Waits until an event matching `predicate` arrives
pub fn wait_for<F>(events: &Receiver<PlayerEvent>, timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut(&PlayerEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) if predicate(&event) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
    false
}

/// Polls `condition` until it holds or `timeout` passes
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn drain(events: &Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
    events.try_iter().collect()
}
