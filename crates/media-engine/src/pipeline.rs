//! Decode pipeline: one chapter on a dedicated thread
//!
//! demux -> decode -> time-stretch -> gain -> sink. The thread owns every resource;
//! the handle only posts commands and reads atomics. Completion and errors
//! go to a [`PipelineListener`] after the thread has released its resources.

use crate::backend::{AudioSink, AudioSource, OutputBackend, SourceBackend, StreamInfo};
use crate::error::{EngineError, EngineResult};
use crate::speed::TimeStretcher;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use earshot_core::PlaybackSpeed;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Commands sent to the decode thread
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    Start,
    Pause,
    Seek(u64),
    SetSpeed(PlaybackSpeed),
    /// Linear amplitude factor applied to everything decoded from now on
    SetVolume(f32),
    Stop,
}

/// State of the decode thread, separate from the controller's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    Initialized = 1,
    Prepared = 2,
    Started = 3,
    Paused = 4,
    PlaybackCompleted = 5,
    Error = 6,
    Stopped = 7,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initialized,
            2 => Self::Prepared,
            3 => Self::Started,
            4 => Self::Paused,
            5 => Self::PlaybackCompleted,
            6 => Self::Error,
            7 => Self::Stopped,
            _ => Self::Idle,
        }
    }

    /// The thread has exited or is about to
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::PlaybackCompleted | Self::Error | Self::Stopped)
    }
}

/// Receives the outcome of a pipeline, at most once per pipeline
pub trait PipelineListener: Send + Sync {
    fn on_completion(&self, generation: u64);

    fn on_error(&self, generation: u64, error: EngineError);
}

/// Everything needed to start decoding one chapter
pub struct PrepareRequest {
    pub file: PathBuf,
    pub start_ms: u64,
    pub speed: PlaybackSpeed,
    /// Linear amplitude factor, see [`PipelineCommand::SetVolume`]
    pub volume: f32,
    pub source: Arc<dyn SourceBackend>,
    pub output: Arc<dyn OutputBackend>,
    pub listener: Arc<dyn PipelineListener>,
    /// Echoed back to the listener so stale notifications can be told apart
    pub generation: u64,
    /// Longest the thread blocks before re-checking its commands
    pub poll: Duration,
}

pub struct DecodePipeline {
    handle: Option<thread::JoinHandle<()>>,
    command_tx: Sender<PipelineCommand>,
    state: Arc<AtomicU8>,
    position_ms: Arc<AtomicU64>,
    /// Seeks posted by the handle so far
    seek_requests: Arc<AtomicU64>,
    info: StreamInfo,
    file: PathBuf,
    generation: u64,
}

impl DecodePipeline {
    /// Spawns the decode thread and waits until the chapter is open.
    ///
    /// On failure the thread has already exited and been joined.
    pub fn prepare(request: PrepareRequest) -> EngineResult<Self> {
        let PrepareRequest {
            file,
            start_ms,
            speed,
            volume,
            source,
            output,
            listener,
            generation,
            poll,
        } = request;

        let state = Arc::new(AtomicU8::new(PipelineState::Initialized as u8));
        let position_ms = Arc::new(AtomicU64::new(start_ms));
        let seek_requests = Arc::new(AtomicU64::new(0));
        let (command_tx, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded::<EngineResult<StreamInfo>>(1);

        let thread_state = Arc::clone(&state);
        let thread_position = Arc::clone(&position_ms);
        let thread_seeks = Arc::clone(&seek_requests);
        let thread_file = file.clone();

        let handle = thread::Builder::new()
            .name("earshot-decode".to_string())
            .spawn(move || {
                let mut session = match DecodeSession::open(
                    &thread_file,
                    start_ms,
                    speed,
                    volume,
                    source.as_ref(),
                    output.as_ref(),
                    poll,
                    thread_position,
                    thread_seeks,
                ) {
                    Ok(session) => session,
                    Err(e) => {
                        thread_state.store(PipelineState::Error as u8, Ordering::Release);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                thread_state.store(PipelineState::Prepared as u8, Ordering::Release);
                let _ = ready_tx.send(Ok(session.info.clone()));

                let outcome = session.run(&command_rx, &thread_state);
                // Resources go before anyone hears about the outcome
                drop(session);

                match outcome {
                    Outcome::Completed => {
                        log::debug!("Finished {}", thread_file.display());
                        thread_state.store(PipelineState::PlaybackCompleted as u8, Ordering::Release);
                        listener.on_completion(generation);
                    }
                    Outcome::Failed(e) => {
                        log::error!("Decoding {} failed: {}", thread_file.display(), e);
                        thread_state.store(PipelineState::Error as u8, Ordering::Release);
                        listener.on_error(generation, e);
                    }
                    Outcome::Stopped => {
                        thread_state.store(PipelineState::Stopped as u8, Ordering::Release);
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(info)) => Ok(Self {
                handle: Some(handle),
                command_tx,
                state,
                position_ms,
                seek_requests,
                info,
                file,
                generation,
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(EngineError::PipelineGone)
            }
        }
    }

    pub fn start(&self) {
        self.send(PipelineCommand::Start);
    }

    pub fn pause(&self) {
        self.send(PipelineCommand::Pause);
    }

    /// Repositions playback; the reported position jumps immediately
    pub fn seek(&self, position_ms: u64) {
        self.seek_requests.fetch_add(1, Ordering::AcqRel);
        self.position_ms.store(position_ms, Ordering::Release);
        self.send(PipelineCommand::Seek(position_ms));
    }

    pub fn set_speed(&self, speed: PlaybackSpeed) {
        self.send(PipelineCommand::SetSpeed(speed));
    }

    pub fn set_volume(&self, volume: f32) {
        self.send(PipelineCommand::SetVolume(volume));
    }

    /// Stops the thread, waits for it and returns to `Idle`
    pub fn reset(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.command_tx.send(PipelineCommand::Stop);
            if handle.join().is_err() {
                log::error!("Decode thread for {} panicked", self.file.display());
            }
            self.state.store(PipelineState::Idle as u8, Ordering::Release);
        }
    }

    pub fn position_ms(&self) -> u64 {
        self.position_ms.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&self, command: PipelineCommand) {
        if self.command_tx.send(command.clone()).is_err() {
            log::debug!("Decode thread already gone, dropping {:?}", command);
        }
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.reset();
    }
}

enum Outcome {
    Completed,
    Failed(EngineError),
    Stopped,
}

enum Progress {
    Working,
    /// Nothing could be done without waiting on the sink
    Waiting,
    Finished,
}

/// Maps output handed to the sink back to source time
#[derive(Debug, Clone, Copy, PartialEq)]
struct PlaybackClock {
    /// Where the last seek landed
    base_ms: u64,
    /// Source frames covered by the output handed over since `base_ms`
    handed: f64,
}

impl PlaybackClock {
    fn new(base_ms: u64) -> Self {
        Self { base_ms, handed: 0.0 }
    }

    /// `frames` of output stretched at `speed` went to the sink
    fn hand_over(&mut self, frames: usize, speed: f32) {
        self.handed += frames as f64 * f64::from(speed);
    }

    /// Position the listener has reached while `queued` output frames,
    /// stretched at `speed`, still wait in the sink
    fn heard_ms(&self, info: &StreamInfo, queued: usize, speed: f32) -> u64 {
        let heard = (self.handed - queued as f64 * f64::from(speed)).max(0.0);
        (self.base_ms + info.frames_to_ms(heard as u64)).min(info.duration_ms)
    }
}

/// Resources owned by the decode thread
struct DecodeSession {
    source: Box<dyn AudioSource>,
    sink: Box<dyn AudioSink>,
    stretcher: TimeStretcher,
    info: StreamInfo,
    poll: Duration,
    /// Stretched samples not yet taken by the sink
    pending: Vec<f32>,
    pending_offset: usize,
    /// Speed `pending` was stretched at
    pending_speed: f32,
    volume: f32,
    clock: PlaybackClock,
    position_ms: Arc<AtomicU64>,
    /// Last value this thread wrote to `position_ms`; `None` while a seek
    /// target published by the handle is still queued
    published: Option<u64>,
    seek_requests: Arc<AtomicU64>,
    seeks_handled: u64,
    input_done: bool,
    eos_signalled: bool,
}

impl DecodeSession {
    #[allow(clippy::too_many_arguments)]
    fn open(
        file: &Path,
        start_ms: u64,
        speed: PlaybackSpeed,
        volume: f32,
        source_backend: &dyn SourceBackend,
        output_backend: &dyn OutputBackend,
        poll: Duration,
        position_ms: Arc<AtomicU64>,
        seek_requests: Arc<AtomicU64>,
    ) -> EngineResult<Self> {
        let source = source_backend.open(file)?;
        let info = StreamInfo::from_params(file, source.params())?;
        let stretcher = TimeStretcher::new(info.sample_rate, info.channels, speed)?;
        let sink = output_backend.open(info.sample_rate, info.channels)?;

        log::info!(
            "Prepared {} ({} Hz x {}, {} ms, {}) with {}/{}",
            file.display(),
            info.sample_rate,
            info.channels,
            info.duration_ms,
            info.codec,
            source_backend.name(),
            output_backend.name()
        );

        let mut session = Self {
            source,
            sink,
            stretcher,
            info,
            poll,
            pending: Vec::new(),
            pending_offset: 0,
            pending_speed: speed.value(),
            volume,
            clock: PlaybackClock::new(0),
            position_ms,
            published: Some(start_ms),
            seek_requests,
            seeks_handled: 0,
            input_done: false,
            eos_signalled: false,
        };
        if start_ms > 0 {
            session.seek(start_ms)?;
        } else {
            session.publish(0);
        }
        Ok(session)
    }

    fn run(&mut self, commands: &Receiver<PipelineCommand>, state: &AtomicU8) -> Outcome {
        let mut running = false;
        let mut waiting = false;

        loop {
            let command = if running && !waiting {
                match commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => Some(PipelineCommand::Stop),
                }
            } else {
                match commands.recv_timeout(self.poll) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => Some(PipelineCommand::Stop),
                }
            };

            if let Some(command) = command {
                match command {
                    PipelineCommand::Start => {
                        running = true;
                        self.sink.resume();
                        state.store(PipelineState::Started as u8, Ordering::Release);
                    }
                    PipelineCommand::Pause => {
                        running = false;
                        self.sink.pause();
                        state.store(PipelineState::Paused as u8, Ordering::Release);
                    }
                    PipelineCommand::Seek(position_ms) => {
                        self.seeks_handled += 1;
                        if let Err(e) = self.seek(position_ms) {
                            return Outcome::Failed(e);
                        }
                    }
                    PipelineCommand::SetSpeed(speed) => self.stretcher.set_speed(speed),
                    PipelineCommand::SetVolume(volume) => self.volume = volume,
                    PipelineCommand::Stop => return Outcome::Stopped,
                }
                waiting = false;
                continue;
            }

            if !running {
                continue;
            }

            match self.pump() {
                Ok(Progress::Working) => waiting = false,
                Ok(Progress::Waiting) => waiting = true,
                Ok(Progress::Finished) => return Outcome::Completed,
                Err(e) => return Outcome::Failed(e),
            }
        }
    }

    /// One step of the loop: write pending output, or decode more, or wait
    /// for the sink to drain at end of stream
    fn pump(&mut self) -> EngineResult<Progress> {
        if self.pending_offset < self.pending.len() {
            let written = self
                .sink
                .write(&self.pending[self.pending_offset..], self.poll)?;
            self.pending_offset += written;
            self.clock
                .hand_over(written / usize::from(self.info.channels), self.pending_speed);
            self.publish_heard();
            if self.pending_offset >= self.pending.len() {
                self.pending.clear();
                self.pending_offset = 0;
            }
            return Ok(if written == 0 {
                Progress::Waiting
            } else {
                Progress::Working
            });
        }

        if self.input_done {
            if !self.eos_signalled {
                self.sink.end_of_stream();
                self.eos_signalled = true;
            }
            return Ok(if self.sink.is_drained() {
                self.publish(self.info.duration_ms);
                Progress::Finished
            } else {
                self.publish_heard();
                Progress::Waiting
            });
        }

        self.pending_speed = self.stretcher.speed().value();
        match self.source.next_chunk()? {
            Some(chunk) => self.pending = self.stretcher.process(&chunk),
            None => {
                self.pending = self.stretcher.flush();
                self.input_done = true;
            }
        }
        apply_volume(&mut self.pending, self.volume);
        Ok(Progress::Working)
    }

    fn publish_heard(&mut self) {
        let position = self
            .clock
            .heard_ms(&self.info, self.sink.queued_frames(), self.pending_speed);
        self.publish(position);
    }

    /// Writes `position` unless the handle has published a seek target since
    /// our last write
    fn publish(&mut self, position: u64) {
        let Some(last) = self.published else {
            return;
        };
        self.published = self
            .position_ms
            .compare_exchange(last, position, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| position);
    }

    /// Drops everything buffered and repositions the source
    fn seek(&mut self, position_ms: u64) -> EngineResult<()> {
        self.sink.flush();
        self.stretcher.clear();
        self.pending.clear();
        self.pending_offset = 0;
        self.input_done = false;
        self.eos_signalled = false;

        let landed = self.source.seek(position_ms)?;
        log::debug!("Seek to {} ms landed at {} ms", position_ms, landed);
        self.clock = PlaybackClock::new(landed);
        // Only the newest seek may replace the target the handle published
        if self.seek_requests.load(Ordering::Acquire) == self.seeks_handled {
            self.position_ms.store(landed, Ordering::Release);
            self.published = Some(landed);
        } else {
            self.published = None;
        }
        Ok(())
    }
}

fn apply_volume(samples: &mut [f32], volume: f32) {
    if (volume - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples {
        *sample = (*sample * volume).clamp(-1.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StreamInfo {
        StreamInfo {
            sample_rate: 8_000,
            channels: 1,
            duration_ms: 10_000,
            codec: "pcm".to_string(),
        }
    }

    #[test]
    fn test_clock_weights_each_block_by_its_speed() {
        let mut clock = PlaybackClock::new(1_000);
        clock.hand_over(8_000, 1.0);
        clock.hand_over(4_000, 2.0);

        assert_eq!(clock.heard_ms(&info(), 0, 2.0), 3_000);
    }

    #[test]
    fn test_clock_excludes_queued_output() {
        let mut clock = PlaybackClock::new(0);
        clock.hand_over(8_000, 1.5);

        assert_eq!(clock.heard_ms(&info(), 4_000, 1.5), 750);
        assert_eq!(clock.heard_ms(&info(), 20_000, 1.5), 0);
    }

    #[test]
    fn test_clock_stops_at_duration() {
        let mut clock = PlaybackClock::new(9_500);
        clock.hand_over(8_000, 1.0);
        assert_eq!(clock.heard_ms(&info(), 0, 1.0), 10_000);
    }

    #[test]
    fn test_volume_scales_and_clips() {
        let mut samples = vec![0.25, -0.5, 0.75];
        apply_volume(&mut samples, 2.0);
        assert_eq!(samples, vec![0.5, -1.0, 1.0]);

        let mut untouched = vec![0.3];
        apply_volume(&mut untouched, 1.0);
        assert_eq!(untouched, vec![0.3]);
    }

    #[test]
    fn test_state_round_trip_through_u8() {
        for state in [
            PipelineState::Idle,
            PipelineState::Initialized,
            PipelineState::Prepared,
            PipelineState::Started,
            PipelineState::Paused,
            PipelineState::PlaybackCompleted,
            PipelineState::Error,
            PipelineState::Stopped,
        ] {
            assert_eq!(PipelineState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(PipelineState::PlaybackCompleted.is_terminal());
        assert!(PipelineState::Stopped.is_terminal());
        assert!(!PipelineState::Paused.is_terminal());
    }
}
