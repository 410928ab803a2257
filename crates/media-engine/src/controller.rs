//! Playback controller
//!
//! Serialises every transport command under one lock, drives a
//! [`DecodePipeline`] per chapter and reacts to its completion and error
//! notifications. Notifications arrive on a dispatcher thread and re-take
//! the lock there, never on the decode thread itself.

use crate::backend::{BackendRegistry, OutputBackend, SourceBackend};
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, PlayerEvent};
use crate::heartbeat::Heartbeat;
use crate::output::CpalOutput;
use crate::pipeline::{DecodePipeline, PipelineListener, PrepareRequest};
use crate::sleep_timer::{SleepTimer, SleepTimerTick};
use crate::state::ControllerState;
use crate::store::{MemoryPositionStore, PositionStore, PositionUpdate};
use crossbeam_channel::{unbounded, Receiver, Sender};
use earshot_config::PlayerConfig;
use earshot_core::{Book, CoreError, PlaybackSpeed, VolumeGain};
use earshot_resilience::{with_retry_if, RetryOutcome, RetryPolicy};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

/// `previous()` restarts the current chapter or mark past this point
const PREVIOUS_THRESHOLD_MS: u64 = 2000;
/// Positions are written at most this often while playing
const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDirection {
    Forward,
    Backward,
}

/// Kinds of audio focus loss reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusLoss {
    Permanent,
    Transient,
    TransientCanDuck,
}

enum Notification {
    Completed { generation: u64 },
    Failed { generation: u64, error: EngineError },
}

struct NotificationForwarder {
    tx: Sender<Notification>,
}

impl PipelineListener for NotificationForwarder {
    fn on_completion(&self, generation: u64) {
        let _ = self.tx.send(Notification::Completed { generation });
    }

    fn on_error(&self, generation: u64, error: EngineError) {
        let _ = self.tx.send(Notification::Failed { generation, error });
    }
}

/// State guarded by the controller lock
struct ControllerCore {
    state: ControllerState,
    book: Option<Book>,
    pipeline: Option<DecodePipeline>,
    /// Bumped for every pipeline; notifications from older ones are dropped
    generation: u64,
    sleep_timer: SleepTimer,
    heartbeat: Option<Heartbeat>,
    heartbeat_generation: u64,
    /// Time played since the last position write
    unsaved: Duration,
    /// Sleep timer fade factor, 1 outside the fade
    fade: f32,
    /// Volume last sent to the pipeline
    volume: f32,
    last_error_retryable: bool,
    paused_by_focus_loss: bool,
}

struct ControllerInner {
    core: Mutex<ControllerCore>,
    events: EventBus,
    config: PlayerConfig,
    source: Arc<dyn SourceBackend>,
    output: Arc<dyn OutputBackend>,
    store: Arc<dyn PositionStore>,
    notify_tx: Sender<Notification>,
    manual_clock: bool,
    self_ref: Weak<ControllerInner>,
}

/// Builds a [`PlaybackController`]
pub struct ControllerBuilder {
    config: PlayerConfig,
    sources: BackendRegistry,
    output: Option<Arc<dyn OutputBackend>>,
    store: Option<Arc<dyn PositionStore>>,
    manual_clock: bool,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            config: PlayerConfig::default(),
            sources: BackendRegistry::with_defaults(),
            output: None,
            store: None,
            manual_clock: false,
        }
    }

    pub fn config(mut self, config: PlayerConfig) -> Self {
        self.config = config;
        self
    }

    /// Source backends to pick `decoder_backend` from
    pub fn sources(mut self, sources: BackendRegistry) -> Self {
        self.sources = sources;
        self
    }

    pub fn output(mut self, output: Arc<dyn OutputBackend>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Skip the heartbeat thread; the caller drives [`PlaybackController::tick`]
    pub fn manual_clock(mut self, manual: bool) -> Self {
        self.manual_clock = manual;
        self
    }

    pub fn build(self) -> EngineResult<PlaybackController> {
        let source = self.sources.get(&self.config.decoder_backend)?;
        let output = self
            .output
            .unwrap_or_else(|| Arc::new(CpalOutput::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryPositionStore::new()));
        let (notify_tx, notify_rx) = unbounded();
        let config = self.config;
        let manual_clock = self.manual_clock;

        let inner = Arc::new_cyclic(|self_ref| ControllerInner {
            core: Mutex::new(ControllerCore {
                state: ControllerState::Idle,
                book: None,
                pipeline: None,
                generation: 0,
                sleep_timer: SleepTimer::new(config.sleep_time()),
                heartbeat: None,
                heartbeat_generation: 0,
                unsaved: Duration::ZERO,
                fade: 1.0,
                volume: 1.0,
                last_error_retryable: false,
                paused_by_focus_loss: false,
            }),
            events: EventBus::new(),
            config,
            source,
            output,
            store,
            notify_tx,
            manual_clock,
            self_ref: self_ref.clone(),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("earshot-controller".to_string())
            .spawn(move || dispatch(weak, notify_rx))?;

        log::debug!(
            "Playback controller ready ({} -> {})",
            inner.source.name(),
            inner.output.name()
        );
        Ok(PlaybackController { inner })
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handles pipeline notifications until the controller goes away
fn dispatch(weak: Weak<ControllerInner>, rx: Receiver<Notification>) {
    while let Ok(notification) = rx.recv() {
        let Some(inner) = weak.upgrade() else { break };
        match notification {
            Notification::Completed { generation } => inner.on_completed(generation),
            Notification::Failed { generation, error } => inner.on_failed(generation, error),
        }
    }
    log::trace!("Controller dispatcher stopped");
}

/// Transport surface of the engine
#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<ControllerInner>,
}

impl PlaybackController {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    /// A controller with default backends and an in-memory position store
    pub fn new(config: PlayerConfig) -> EngineResult<Self> {
        ControllerBuilder::new().config(config).build()
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.inner.config
    }

    /// Replaces the book; any running playback is torn down
    pub fn init(&self, book: Book) {
        let inner = &self.inner;
        let mut core = inner.lock();
        if core.pipeline.is_some() {
            inner.sync_position(&mut core);
            inner.persist(&mut core);
        }
        inner.release_pipeline(&mut core);
        inner.cancel_sleep_timer(&mut core);
        log::info!("Initialised '{}' ({} chapters)", book.name(), book.chapters().len());
        core.book = Some(book);
        core.last_error_retryable = false;
        core.paused_by_focus_loss = false;
        inner.set_state(&mut core, ControllerState::Idle);
    }

    /// Opens the current chapter without starting it
    pub fn prepare(&self) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        match core.state {
            ControllerState::Idle => inner.prepare_locked(&mut core),
            ControllerState::Error if core.last_error_retryable => inner.prepare_locked(&mut core),
            state => Err(illegal("prepare", state)),
        }
    }

    pub fn play(&self) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        inner.play_locked(&mut core)
    }

    /// Pauses, rewinding by the configured amount when `rewind` is set
    pub fn pause(&self, rewind: bool) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        inner.pause_locked(&mut core, rewind)
    }

    /// Pauses with rewind when playing, plays otherwise
    pub fn play_pause(&self) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        if core.state.is_playing() {
            inner.pause_locked(&mut core, true)
        } else {
            inner.play_locked(&mut core)
        }
    }

    pub fn stop(&self) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        inner.stop_locked(&mut core)
    }

    /// Moves to `time_ms` of the chapter backed by `file`
    pub fn change_position(&self, time_ms: u64, file: &Path) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        if !core.state.accepts_position_change() {
            return Err(illegal("change position", core.state));
        }
        inner.change_position_locked(&mut core, time_ms, file)
    }

    /// Jumps by the configured seek time, crossing chapter bounds as needed
    pub fn skip(&self, direction: SkipDirection) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        if !core.state.accepts_position_change() {
            return Err(illegal("skip", core.state));
        }
        inner.sync_position(&mut core);

        let book = core.book.as_ref().ok_or(EngineError::NoBookInitialized)?;
        let position = book.time_ms();
        let duration = book.current_chapter().duration_ms;
        let file = book.current_file().to_path_buf();
        let delta = duration_ms(inner.config.seek_time());

        match direction {
            SkipDirection::Forward if position + delta > duration => inner.next_locked(&mut core),
            SkipDirection::Forward => inner.change_position_locked(&mut core, position + delta, &file),
            SkipDirection::Backward if position < delta => inner.previous_locked(&mut core, false),
            SkipDirection::Backward => inner.change_position_locked(&mut core, position - delta, &file),
        }
    }

    /// Starts the following chapter; does nothing on the last one
    pub fn next(&self) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        if !core.state.accepts_position_change() {
            return Err(illegal("next", core.state));
        }
        inner.next_locked(&mut core)
    }

    /// Restarts the current chapter, or moves to the previous one when
    /// within the first two seconds
    pub fn previous(&self, to_start_of_track: bool) -> EngineResult<()> {
        let inner = &self.inner;
        let mut core = inner.lock();
        if !core.state.accepts_position_change() {
            return Err(illegal("previous", core.state));
        }
        inner.previous_locked(&mut core, to_start_of_track)
    }

    /// Changes speed without interrupting playback
    pub fn set_speed(&self, speed: f32) -> EngineResult<()> {
        let speed = PlaybackSpeed::new(speed)?;
        let inner = &self.inner;
        let mut core = inner.lock();
        let book = core.book.as_mut().ok_or(EngineError::NoBookInitialized)?;
        book.set_speed(speed);
        if let Some(pipeline) = core.pipeline.as_ref() {
            pipeline.set_speed(speed);
        }
        log::debug!("Speed set to {}", speed);
        inner.events.emit(PlayerEvent::SpeedChanged {
            speed: speed.value(),
        });
        inner.sync_position(&mut core);
        inner.persist(&mut core);
        Ok(())
    }

    /// Boosts the book's loudness by `db` decibels (0 - 9)
    pub fn set_gain(&self, db: f32) -> EngineResult<()> {
        let gain = VolumeGain::new(db)?;
        let inner = &self.inner;
        let mut core = inner.lock();
        let book = core.book.as_mut().ok_or(EngineError::NoBookInitialized)?;
        book.set_gain(gain);
        inner.apply_volume(&mut core);
        log::debug!("Gain set to {}", gain);
        inner.events.emit(PlayerEvent::GainChanged { gain_db: gain.db() });
        inner.sync_position(&mut core);
        inner.persist(&mut core);
        Ok(())
    }

    /// Starts the sleep timer with the configured default
    pub fn sleep_timer_activate(&self) {
        let inner = &self.inner;
        let mut core = inner.lock();
        core.sleep_timer.activate();
        inner.reset_fade(&mut core);
        inner.emit_sleep_timer(&core);
    }

    /// Starts the sleep timer with a user-chosen interval
    pub fn sleep_timer_activate_for(&self, duration: Duration) {
        let inner = &self.inner;
        let mut core = inner.lock();
        core.sleep_timer.activate_for(duration);
        inner.reset_fade(&mut core);
        inner.emit_sleep_timer(&core);
    }

    pub fn sleep_timer_deactivate(&self) {
        let inner = &self.inner;
        let mut core = inner.lock();
        inner.cancel_sleep_timer(&mut core);
    }

    pub fn audio_focus_lost(&self, kind: FocusLoss) {
        let inner = &self.inner;
        let mut core = inner.lock();
        let result = match kind {
            FocusLoss::Permanent if core.state != ControllerState::Idle => {
                inner.stop_locked(&mut core)
            }
            FocusLoss::Transient if core.state.is_playing() => {
                inner.pause_locked(&mut core, true).map(|()| {
                    core.paused_by_focus_loss = true;
                })
            }
            FocusLoss::TransientCanDuck
                if core.state.is_playing() && inner.config.pause_on_transient_focus_loss =>
            {
                inner.pause_locked(&mut core, false).map(|()| {
                    core.paused_by_focus_loss = true;
                })
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("Reacting to focus loss failed: {}", e);
        }
    }

    /// Resumes playback paused by a transient focus loss
    pub fn audio_focus_gained(&self) {
        let inner = &self.inner;
        let mut core = inner.lock();
        if core.paused_by_focus_loss && core.state == ControllerState::Paused {
            if let Err(e) = inner.play_locked(&mut core) {
                log::warn!("Resuming after focus gain failed: {}", e);
            }
        }
        core.paused_by_focus_loss = false;
    }

    /// Advances position sync and the sleep timer by `elapsed`.
    ///
    /// Called by the heartbeat while playing; tests call it directly with a
    /// manual clock.
    pub fn tick(&self, elapsed: Duration) {
        let inner = &self.inner;
        let mut core = inner.lock();
        inner.tick_locked(&mut core, elapsed);
    }

    pub fn state(&self) -> ControllerState {
        self.inner.lock().state
    }

    /// Snapshot of the current book
    pub fn book(&self) -> Option<Book> {
        self.inner.lock().book.clone()
    }

    /// Position inside the current chapter
    pub fn current_position_ms(&self) -> u64 {
        let core = self.inner.lock();
        match (core.state, core.pipeline.as_ref(), core.book.as_ref()) {
            (ControllerState::Started, Some(pipeline), _) => pipeline.position_ms(),
            (_, _, Some(book)) => book.time_ms(),
            _ => 0,
        }
    }

    /// Duration of the current chapter
    pub fn duration_ms(&self) -> u64 {
        self.inner
            .lock()
            .book
            .as_ref()
            .map_or(0, |book| book.current_chapter().duration_ms)
    }

    pub fn speed(&self) -> PlaybackSpeed {
        self.inner
            .lock()
            .book
            .as_ref()
            .map(Book::speed)
            .unwrap_or_default()
    }

    pub fn gain(&self) -> VolumeGain {
        self.inner
            .lock()
            .book
            .as_ref()
            .map(Book::gain)
            .unwrap_or_default()
    }

    /// Linear volume applied to decoded audio: gain times sleep timer fade
    pub fn volume(&self) -> f32 {
        let inner = &self.inner;
        let core = inner.lock();
        inner.target_volume(&core)
    }

    pub fn sleep_timer_remaining_ms(&self) -> i64 {
        self.inner.lock().sleep_timer.remaining_ms()
    }

    pub fn sleep_timer_active(&self) -> bool {
        self.inner.lock().sleep_timer.is_active()
    }
}

impl ControllerInner {
    fn lock(&self) -> MutexGuard<'_, ControllerCore> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, core: &mut ControllerCore, to: ControllerState) {
        let from = core.state;
        if from == to {
            return;
        }
        core.state = to;
        log::debug!("{} -> {}", from, to);
        self.events.emit(PlayerEvent::StateChanged { from, to });

        if to == ControllerState::Started {
            self.start_heartbeat(core);
        } else if let Some(mut heartbeat) = core.heartbeat.take() {
            heartbeat.stop();
        }
    }

    fn start_heartbeat(&self, core: &mut ControllerCore) {
        if self.manual_clock || core.heartbeat.is_some() {
            return;
        }
        core.heartbeat_generation += 1;
        let generation = core.heartbeat_generation;
        let weak = self.self_ref.clone();

        match Heartbeat::start(self.config.position_sync_interval(), move |elapsed| {
            match weak.upgrade() {
                Some(inner) => inner.heartbeat_tick(generation, elapsed),
                None => false,
            }
        }) {
            Ok(heartbeat) => core.heartbeat = Some(heartbeat),
            Err(e) => log::error!("Failed to start position sync: {}", e),
        }
    }

    fn heartbeat_tick(&self, generation: u64, elapsed: Duration) -> bool {
        let mut core = self.lock();
        if core.heartbeat.is_none() || core.heartbeat_generation != generation {
            return false;
        }
        self.tick_locked(&mut core, elapsed);
        true
    }

    fn tick_locked(&self, core: &mut ControllerCore, elapsed: Duration) {
        if !core.state.is_playing() {
            return;
        }

        self.sync_position(core);
        if let Some(book) = core.book.as_ref() {
            self.events.emit(PlayerEvent::PositionChanged {
                file: book.current_file().to_path_buf(),
                position_ms: book.time_ms(),
            });
        }
        core.unsaved += elapsed;
        if core.unsaved >= PERSIST_INTERVAL {
            self.persist(core);
        }

        match core.sleep_timer.tick(elapsed) {
            SleepTimerTick::Inactive => {}
            SleepTimerTick::Running(remaining_ms) => {
                core.fade = core.sleep_timer.fade_level(self.config.fade_out());
                self.apply_volume(core);
                self.events
                    .emit(PlayerEvent::SleepTimerChanged { remaining_ms });
            }
            SleepTimerTick::Expired => {
                log::info!("Sleep timer expired, pausing");
                // The faded stretch was barely audible; rewind over it
                let rewind = if self.config.fade_out_secs > 0 {
                    self.config.fade_out()
                } else {
                    self.config.auto_rewind()
                };
                if let Err(e) = self.pause_by(core, duration_ms(rewind)) {
                    log::warn!("Sleep timer could not pause: {}", e);
                }
                core.sleep_timer.deactivate();
                self.reset_fade(core);
                self.events.emit(PlayerEvent::SleepTimerExpired);
                self.emit_sleep_timer(core);
            }
        }
    }

    fn target_volume(&self, core: &ControllerCore) -> f32 {
        let gain = core.book.as_ref().map(Book::gain).unwrap_or_default();
        gain.factor() * core.fade
    }

    /// Sends the current gain and fade to the pipeline when they changed
    fn apply_volume(&self, core: &mut ControllerCore) {
        let volume = self.target_volume(core);
        if (volume - core.volume).abs() < f32::EPSILON {
            return;
        }
        core.volume = volume;
        if let Some(pipeline) = core.pipeline.as_ref() {
            pipeline.set_volume(volume);
        }
    }

    fn reset_fade(&self, core: &mut ControllerCore) {
        core.fade = 1.0;
        self.apply_volume(core);
    }

    fn emit_sleep_timer(&self, core: &ControllerCore) {
        self.events.emit(PlayerEvent::SleepTimerChanged {
            remaining_ms: core.sleep_timer.remaining_ms(),
        });
    }

    fn cancel_sleep_timer(&self, core: &mut ControllerCore) {
        if core.sleep_timer.is_active() {
            core.sleep_timer.deactivate();
            self.emit_sleep_timer(core);
        }
        self.reset_fade(core);
    }

    /// Copies the pipeline's position into the book
    fn sync_position(&self, core: &mut ControllerCore) {
        let (Some(pipeline), Some(book)) = (core.pipeline.as_ref(), core.book.as_mut()) else {
            return;
        };
        let file = book.current_file().to_path_buf();
        if pipeline.file() != file {
            return;
        }
        if let Err(e) = book.set_position(&file, pipeline.position_ms()) {
            log::warn!("Dropping position update: {}", e);
        }
    }

    fn persist(&self, core: &mut ControllerCore) {
        core.unsaved = Duration::ZERO;
        let Some(book) = core.book.as_ref() else {
            return;
        };
        let update = PositionUpdate {
            book_id: book.id(),
            current_file: book.current_file().to_path_buf(),
            position_ms: book.time_ms(),
            speed: book.speed(),
            gain: book.gain(),
        };
        if let Err(e) = self.store.save(&update) {
            log::warn!("Failed to save position of {}: {}", update.book_id, e);
        }
    }

    fn release_pipeline(&self, core: &mut ControllerCore) {
        if let Some(mut pipeline) = core.pipeline.take() {
            pipeline.reset();
        }
    }

    fn listener(&self) -> Arc<dyn PipelineListener> {
        Arc::new(NotificationForwarder {
            tx: self.notify_tx.clone(),
        })
    }

    /// Opens the book's current chapter at its current position
    fn prepare_locked(&self, core: &mut ControllerCore) -> EngineResult<()> {
        let book = core.book.as_ref().ok_or(EngineError::NoBookInitialized)?;
        let file = book.current_file().to_path_buf();
        let start_ms = book.time_ms();
        let speed = book.speed();
        let volume = self.target_volume(core);

        self.release_pipeline(core);
        core.volume = volume;
        self.set_state(core, ControllerState::Initialized);
        core.generation += 1;
        let generation = core.generation;

        let policy = RetryPolicy::from_retry_limit(self.config.prepare_retry_limit)
            .with_initial_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_millis(400));

        let outcome = with_retry_if(
            &policy,
            |attempt| {
                if attempt > 1 {
                    log::info!("Preparing {} again (attempt {})", file.display(), attempt);
                }
                DecodePipeline::prepare(PrepareRequest {
                    file: file.clone(),
                    start_ms,
                    speed,
                    volume,
                    source: Arc::clone(&self.source),
                    output: Arc::clone(&self.output),
                    listener: self.listener(),
                    generation,
                    poll: self.config.decode_poll(),
                })
            },
            EngineError::is_retryable,
        );

        match outcome {
            RetryOutcome::Succeeded { value, .. } => {
                core.pipeline = Some(value);
                core.last_error_retryable = false;
                self.set_state(core, ControllerState::Prepared);
                Ok(())
            }
            RetryOutcome::Failed { error, attempts } => {
                log::error!(
                    "Preparing {} failed after {} attempt(s): {}",
                    file.display(),
                    attempts,
                    error
                );
                self.fail(core, &file, &error);
                Err(error)
            }
        }
    }

    /// Moves to `Error` and reports `error` once
    fn fail(&self, core: &mut ControllerCore, file: &Path, error: &EngineError) {
        core.last_error_retryable = error.is_retryable();
        self.release_pipeline(core);
        self.set_state(core, ControllerState::Error);

        let book_id = core.book.as_ref().map(Book::id);
        match book_id {
            Some(book_id) if error.is_malformed_file() => {
                self.events.emit(PlayerEvent::MalformedFile {
                    book_id,
                    file: file.to_path_buf(),
                    reason: error.to_string(),
                });
            }
            _ => self.events.emit(PlayerEvent::Error {
                book_id,
                message: error.to_string(),
            }),
        }
    }

    fn start_locked(&self, core: &mut ControllerCore) -> EngineResult<()> {
        let pipeline = core.pipeline.as_ref().ok_or(EngineError::PipelineGone)?;
        pipeline.start();
        core.paused_by_focus_loss = false;
        self.set_state(core, ControllerState::Started);
        Ok(())
    }

    fn play_locked(&self, core: &mut ControllerCore) -> EngineResult<()> {
        if core.book.is_none() {
            return Err(EngineError::NoBookInitialized);
        }
        match core.state {
            ControllerState::Idle | ControllerState::Initialized => {
                self.prepare_locked(core)?;
                self.start_locked(core)
            }
            ControllerState::Error if core.last_error_retryable => {
                self.prepare_locked(core)?;
                self.start_locked(core)
            }
            ControllerState::Prepared | ControllerState::Paused => self.start_locked(core),
            ControllerState::PlaybackCompleted => {
                if let Some(book) = core.book.as_mut() {
                    let file = book.current_file().to_path_buf();
                    book.set_position(&file, 0)?;
                }
                self.prepare_locked(core)?;
                self.start_locked(core)
            }
            state @ (ControllerState::Started | ControllerState::Error) => {
                Err(illegal("play", state))
            }
        }
    }

    fn pause_locked(&self, core: &mut ControllerCore, rewind: bool) -> EngineResult<()> {
        let back = if rewind {
            duration_ms(self.config.auto_rewind())
        } else {
            0
        };
        self.pause_by(core, back)
    }

    /// Pauses and steps back `rewind_ms`, never into an earlier mark
    fn pause_by(&self, core: &mut ControllerCore, rewind_ms: u64) -> EngineResult<()> {
        if !core.state.is_playing() {
            return Err(illegal("pause", core.state));
        }
        self.sync_position(core);

        if let Some(pipeline) = core.pipeline.as_ref() {
            pipeline.pause();
        }
        if rewind_ms > 0 {
            if let Some(book) = core.book.as_mut() {
                let file = book.current_file().to_path_buf();
                let position = book.time_ms();
                let mut rewound = position.saturating_sub(rewind_ms);
                let chapter = book.current_chapter();
                if let (Some(now), Some(then)) =
                    (chapter.mark_index_at(position), chapter.mark_index_at(rewound))
                {
                    if now != then {
                        rewound = rewound.max(chapter.marks[now].start_ms);
                    }
                }
                book.set_position(&file, rewound)?;
                if let Some(pipeline) = core.pipeline.as_ref() {
                    pipeline.seek(rewound);
                }
            }
        }

        self.set_state(core, ControllerState::Paused);
        self.persist(core);
        Ok(())
    }

    fn stop_locked(&self, core: &mut ControllerCore) -> EngineResult<()> {
        if core.state == ControllerState::Idle {
            return Err(illegal("stop", core.state));
        }
        self.sync_position(core);
        self.release_pipeline(core);
        self.cancel_sleep_timer(core);
        core.paused_by_focus_loss = false;
        self.set_state(core, ControllerState::Idle);
        self.persist(core);
        Ok(())
    }

    fn change_position_locked(
        &self,
        core: &mut ControllerCore,
        time_ms: u64,
        file: &Path,
    ) -> EngineResult<()> {
        let was = core.state;
        let book = core.book.as_mut().ok_or(EngineError::NoBookInitialized)?;
        if book.chapter_for(file).is_none() {
            return Err(CoreError::UnknownChapter {
                file: file.to_path_buf(),
            }
            .into());
        }
        let same_file = book.current_file() == file;
        book.set_position(file, time_ms)?;
        let position = book.time_ms();
        let index = book.current_chapter_index();

        if same_file && was != ControllerState::PlaybackCompleted {
            if let Some(pipeline) = core.pipeline.as_ref() {
                pipeline.seek(position);
                self.events.emit(PlayerEvent::PositionChanged {
                    file: file.to_path_buf(),
                    position_ms: position,
                });
                self.persist(core);
                return Ok(());
            }
        }

        if !same_file {
            log::debug!("Moving to chapter {} ({})", index, file.display());
            self.events.emit(PlayerEvent::ChapterChanged {
                index,
                file: file.to_path_buf(),
            });
        }
        self.events.emit(PlayerEvent::PositionChanged {
            file: file.to_path_buf(),
            position_ms: position,
        });
        self.persist(core);

        self.prepare_locked(core)?;
        match was {
            ControllerState::Started => self.start_locked(core),
            ControllerState::Paused | ControllerState::PlaybackCompleted => {
                self.set_state(core, ControllerState::Paused);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Moves to the next mark of the current chapter, else the next chapter
    fn next_locked(&self, core: &mut ControllerCore) -> EngineResult<()> {
        self.sync_position(core);
        let book = core.book.as_ref().ok_or(EngineError::NoBookInitialized)?;
        let target = match book.next_mark() {
            Some(mark) => Some((mark.start_ms, book.current_file().to_path_buf())),
            None => book.next_chapter().map(|chapter| (0, chapter.file.clone())),
        };
        match target {
            Some((time_ms, file)) => self.change_position_locked(core, time_ms, &file),
            None => {
                log::debug!("Already on the last chapter");
                Ok(())
            }
        }
    }

    fn previous_locked(&self, core: &mut ControllerCore, to_start_of_track: bool) -> EngineResult<()> {
        self.sync_position(core);
        let book = core.book.as_ref().ok_or(EngineError::NoBookInitialized)?;
        let current: PathBuf = book.current_file().to_path_buf();
        let time = book.time_ms();

        let chapter = book.current_chapter();
        if let Some(index) = chapter.mark_index_at(time) {
            let mark_start = chapter.marks[index].start_ms;
            if time.saturating_sub(mark_start) > PREVIOUS_THRESHOLD_MS {
                return self.change_position_locked(core, mark_start, &current);
            }
            if index > 0 {
                let previous_start = chapter.marks[index - 1].start_ms;
                return self.change_position_locked(core, previous_start, &current);
            }
        }

        let target = match book.previous_chapter() {
            Some(previous) if book.time_ms() <= PREVIOUS_THRESHOLD_MS => {
                let time = if to_start_of_track {
                    0
                } else {
                    previous
                        .duration_ms
                        .saturating_sub(duration_ms(self.config.seek_time()))
                };
                (time, previous.file.clone())
            }
            _ => (0, current),
        };
        self.change_position_locked(core, target.0, &target.1)
    }

    fn on_completed(&self, generation: u64) {
        let mut core = self.lock();
        if generation != core.generation || core.pipeline.is_none() {
            log::debug!("Ignoring completion of stale pipeline {}", generation);
            return;
        }
        let was = core.state;
        self.release_pipeline(&mut core);

        let Some(book) = core.book.as_mut() else {
            return;
        };
        let next = book.next_chapter().map(|chapter| chapter.file.clone());

        match next {
            Some(file) => {
                if let Err(e) = book.set_position(&file, 0) {
                    log::error!("Cannot advance to {}: {}", file.display(), e);
                    return;
                }
                let index = book.current_chapter_index();
                log::info!("Chapter finished, continuing with {}", file.display());
                self.events.emit(PlayerEvent::ChapterChanged { index, file });
                self.persist(&mut core);

                let result = self.prepare_locked(&mut core).and_then(|()| {
                    if was == ControllerState::Started {
                        self.start_locked(&mut core)
                    } else {
                        self.set_state(&mut core, ControllerState::Paused);
                        Ok(())
                    }
                });
                if let Err(e) = result {
                    log::warn!("Could not continue with the next chapter: {}", e);
                }
            }
            None => {
                let file = book.current_file().to_path_buf();
                let end = book.current_chapter().duration_ms;
                if let Err(e) = book.set_position(&file, end) {
                    log::warn!("Dropping final position: {}", e);
                }
                log::info!("Finished '{}'", book.name());
                self.persist(&mut core);
                self.set_state(&mut core, ControllerState::PlaybackCompleted);
            }
        }
    }

    fn on_failed(&self, generation: u64, error: EngineError) {
        let mut core = self.lock();
        if generation != core.generation || core.pipeline.is_none() {
            log::debug!("Ignoring error of stale pipeline {}: {}", generation, error);
            return;
        }
        self.sync_position(&mut core);
        self.persist(&mut core);
        let file = core
            .pipeline
            .as_ref()
            .map(|pipeline| pipeline.file().to_path_buf())
            .unwrap_or_default();
        self.fail(&mut core, &file, &error);
    }
}

fn illegal(command: &'static str, state: ControllerState) -> EngineError {
    log::warn!("Ignoring {} while {}", command, state);
    EngineError::IllegalStateTransition { command, state }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::NullOutput;

    fn controller() -> PlaybackController {
        PlaybackController::builder()
            .output(Arc::new(NullOutput::unpaced()))
            .manual_clock(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let config = PlayerConfig {
            decoder_backend: "exoplayer".to_string(),
            ..PlayerConfig::default()
        };
        let result = PlaybackController::builder()
            .config(config)
            .output(Arc::new(NullOutput::unpaced()))
            .build();
        assert!(matches!(result, Err(EngineError::UnknownBackend(_))));
    }

    #[test]
    fn test_play_without_book() {
        let controller = controller();
        assert!(matches!(controller.play(), Err(EngineError::NoBookInitialized)));
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_stop_while_idle_is_illegal() {
        let controller = controller();
        assert!(matches!(
            controller.stop(),
            Err(EngineError::IllegalStateTransition { command: "stop", .. })
        ));
    }

    #[test]
    fn test_sleep_timer_reports_changes() {
        let controller = controller();
        let events = controller.subscribe();

        controller.sleep_timer_activate_for(Duration::from_secs(90));
        controller.sleep_timer_deactivate();

        assert_eq!(
            events.try_recv().unwrap(),
            PlayerEvent::SleepTimerChanged { remaining_ms: 90_000 }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            PlayerEvent::SleepTimerChanged { remaining_ms: -1 }
        );
        assert!(!controller.sleep_timer_active());
    }

    #[test]
    fn test_tick_outside_playback_does_not_count_down() {
        let controller = controller();
        controller.sleep_timer_activate_for(Duration::from_secs(5));
        controller.tick(Duration::from_secs(3));
        assert_eq!(controller.sleep_timer_remaining_ms(), 5_000);
    }
}
