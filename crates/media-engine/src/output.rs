//! Audio output backends

use crate::audio_device::{self, Negotiated};
use crate::backend::{AudioSink, OutputBackend};
use crate::error::{EngineError, EngineResult};
use crate::resampler::Resampler;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::Stream;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Blocks queued between the decode thread and the device callback
const QUEUE_BLOCKS: usize = 8;

/// Plays through the default cpal output device as 32-bit float
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl CpalOutput {
    pub const NAME: &'static str = "cpal";

    pub fn new() -> Self {
        Self
    }
}

impl OutputBackend for CpalOutput {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn open(&self, sample_rate: u32, channels: u16) -> EngineResult<Box<dyn AudioSink>> {
        Ok(Box::new(CpalSink::open(sample_rate, channels)?))
    }
}

#[derive(Debug)]
struct CallbackState {
    flushing: AtomicBool,
    idle: AtomicBool,
    /// Device samples queued but not yet handed to the callback's output
    queued: AtomicU64,
}

pub struct CpalSink {
    stream: Stream,
    tx: Sender<Vec<f32>>,
    /// Kept to drop queued blocks on flush
    rx: Receiver<Vec<f32>>,
    shared: Arc<CallbackState>,
    /// Converted block the queue had no room for
    staged: Option<Vec<f32>>,
    resampler: Option<Resampler>,
    source_channels: usize,
    source_rate: u32,
    layout: Negotiated,
}

impl CpalSink {
    pub fn open(sample_rate: u32, channels: u16) -> EngineResult<Self> {
        let device = audio_device::default_device()?;
        let ranges = audio_device::float_ranges(&device)?;
        let default_rate = device.default_output_config().ok().map(|c| c.sample_rate().0);
        let layout = audio_device::negotiate(&ranges, default_rate, sample_rate, channels)?;

        let resampler = if layout.sample_rate != sample_rate {
            log::info!(
                "Device rejects {} Hz, resampling to {} Hz",
                sample_rate,
                layout.sample_rate
            );
            Some(Resampler::new(sample_rate, layout.sample_rate, layout.channels)?)
        } else {
            None
        };

        let (tx, rx) = bounded::<Vec<f32>>(QUEUE_BLOCKS);
        let shared = Arc::new(CallbackState {
            flushing: AtomicBool::new(false),
            idle: AtomicBool::new(true),
            queued: AtomicU64::new(0),
        });

        let callback_rx = rx.clone();
        let callback_state = Arc::clone(&shared);
        let mut current: Vec<f32> = Vec::new();
        let mut position = 0;

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let error_name = device_name.clone();

        let stream = device
            .build_output_stream(
                &layout.stream_config(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if callback_state.flushing.swap(false, Ordering::AcqRel) {
                        current.clear();
                        position = 0;
                    }

                    let mut written = 0;
                    while written < data.len() {
                        if position >= current.len() {
                            match callback_rx.try_recv() {
                                Ok(next) => {
                                    current = next;
                                    position = 0;
                                    continue;
                                }
                                Err(_) => break,
                            }
                        }
                        let n = (current.len() - position).min(data.len() - written);
                        data[written..written + n].copy_from_slice(&current[position..position + n]);
                        written += n;
                        position += n;
                    }
                    data[written..].fill(0.0);
                    let _ = callback_state.queued.fetch_update(
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        |queued| Some(queued.saturating_sub(written as u64)),
                    );

                    callback_state
                        .idle
                        .store(position >= current.len() && callback_rx.is_empty(), Ordering::Release);
                },
                move |err| {
                    log::error!("Audio output error on device '{}': {}", error_name, err);
                },
                None,
            )
            .map_err(|e| EngineError::DeviceBusy(format!("failed to build stream: {e}")))?;

        stream
            .play()
            .map_err(|e| EngineError::DeviceBusy(format!("failed to start stream: {e}")))?;

        log::info!(
            "Audio output open on '{}': {} Hz x {}",
            device_name,
            layout.sample_rate,
            layout.channels
        );

        Ok(Self {
            stream,
            tx,
            rx,
            shared,
            staged: None,
            resampler,
            source_channels: usize::from(channels),
            source_rate: sample_rate,
            layout,
        })
    }

    fn convert(&mut self, samples: &[f32]) -> EngineResult<Vec<f32>> {
        let widened = if usize::from(self.layout.channels) != self.source_channels {
            samples.iter().flat_map(|&s| [s, s]).collect()
        } else {
            samples.to_vec()
        };
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&widened),
            None => Ok(widened),
        }
    }

    fn queue(&mut self, block: Vec<f32>) -> EngineResult<()> {
        if block.is_empty() {
            return Ok(());
        }
        let len = block.len() as u64;
        match self.tx.try_send(block) {
            Ok(()) => {
                self.shared.queued.fetch_add(len, Ordering::AcqRel);
                Ok(())
            }
            Err(TrySendError::Full(block)) => {
                self.staged = Some(block);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(EngineError::DeviceError("output stream closed".to_string()))
            }
        }
    }

    /// Moves the staged block into the queue; false if it is still full
    fn push_staged(&mut self, timeout: Duration) -> EngineResult<bool> {
        let Some(block) = self.staged.take() else {
            return Ok(true);
        };
        let len = block.len() as u64;
        match self.tx.send_timeout(block, timeout) {
            Ok(()) => {
                self.shared.queued.fetch_add(len, Ordering::AcqRel);
                Ok(true)
            }
            Err(SendTimeoutError::Timeout(block)) => {
                self.staged = Some(block);
                Ok(false)
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                Err(EngineError::DeviceError("output stream closed".to_string()))
            }
        }
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, samples: &[f32], timeout: Duration) -> EngineResult<usize> {
        if !self.push_staged(timeout)? {
            return Ok(0);
        }

        let whole = samples.len() / self.source_channels * self.source_channels;
        if whole == 0 {
            return Ok(0);
        }
        let block = self.convert(&samples[..whole])?;
        self.queue(block)?;
        Ok(whole)
    }

    fn flush(&mut self) {
        self.staged = None;
        for _ in self.rx.try_iter() {}
        self.shared.flushing.store(true, Ordering::Release);
        self.shared.queued.store(0, Ordering::Release);
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    fn pause(&mut self) {
        if let Err(e) = self.stream.pause() {
            log::warn!("Failed to pause output stream: {}", e);
        }
    }

    fn resume(&mut self) {
        if let Err(e) = self.stream.play() {
            log::warn!("Failed to resume output stream: {}", e);
        }
    }

    fn end_of_stream(&mut self) {
        let tail = match self.resampler.as_mut().map(Resampler::flush) {
            Some(Ok(tail)) => tail,
            Some(Err(e)) => {
                log::warn!("Dropping resampler tail: {}", e);
                Vec::new()
            }
            None => Vec::new(),
        };
        if !tail.is_empty() {
            match self.staged.as_mut() {
                Some(staged) => staged.extend(tail),
                None => {
                    if let Err(e) = self.queue(tail) {
                        log::warn!("Dropping resampler tail: {}", e);
                    }
                }
            }
        }
    }

    fn is_drained(&mut self) -> bool {
        match self.push_staged(Duration::ZERO) {
            Ok(true) => self.rx.is_empty() && self.shared.idle.load(Ordering::Acquire),
            Ok(false) => false,
            Err(_) => true,
        }
    }

    fn queued_frames(&self) -> usize {
        let staged = self.staged.as_ref().map_or(0, Vec::len) as u64;
        let device_samples = self.shared.queued.load(Ordering::Acquire) + staged;
        let device_frames = device_samples / u64::from(self.layout.channels);
        (device_frames * u64::from(self.source_rate) / u64::from(self.layout.sample_rate)) as usize
    }
}

/// Discards PCM, optionally at real-time pace. Used headless and in tests.
#[derive(Debug, Clone)]
pub struct NullOutput {
    paced: bool,
    frames_played: Arc<AtomicU64>,
    /// Bits of the loudest absolute sample seen
    peak: Arc<AtomicU32>,
}

impl NullOutput {
    pub const NAME: &'static str = "null";

    /// How far a paced sink may run ahead of the wall clock
    const MAX_LEAD: Duration = Duration::from_millis(200);

    /// A sink that takes as long to "play" audio as a real device
    pub fn new() -> Self {
        Self {
            paced: true,
            frames_played: Arc::new(AtomicU64::new(0)),
            peak: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A sink that accepts everything immediately
    pub fn unpaced() -> Self {
        Self {
            paced: false,
            ..Self::new()
        }
    }

    /// Frames accepted by every sink this backend opened
    pub fn frames_played(&self) -> u64 {
        self.frames_played.load(Ordering::Relaxed)
    }

    /// Loudest absolute sample written to any sink of this backend
    pub fn peak_level(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBackend for NullOutput {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn open(&self, sample_rate: u32, channels: u16) -> EngineResult<Box<dyn AudioSink>> {
        if channels == 0 || channels > audio_device::MAX_CHANNELS {
            return Err(EngineError::DeviceError(format!(
                "unsupported channel layout: {channels} channels"
            )));
        }
        Ok(Box::new(NullSink {
            sample_rate,
            channels: usize::from(channels),
            paced: self.paced,
            played_until: Instant::now(),
            paused_at: None,
            frames_played: Arc::clone(&self.frames_played),
            peak: Arc::clone(&self.peak),
        }))
    }
}

struct NullSink {
    sample_rate: u32,
    channels: usize,
    paced: bool,
    played_until: Instant,
    paused_at: Option<Instant>,
    frames_played: Arc<AtomicU64>,
    peak: Arc<AtomicU32>,
}

impl AudioSink for NullSink {
    fn write(&mut self, samples: &[f32], timeout: Duration) -> EngineResult<usize> {
        let frames = samples.len() / self.channels;
        if frames == 0 {
            return Ok(0);
        }

        if self.paced {
            let now = Instant::now();
            let ahead = self.played_until.saturating_duration_since(now);
            if ahead > NullOutput::MAX_LEAD {
                std::thread::sleep((ahead - NullOutput::MAX_LEAD).min(timeout));
                if self.played_until.saturating_duration_since(Instant::now()) > NullOutput::MAX_LEAD {
                    return Ok(0);
                }
            }
            let length = Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate));
            self.played_until = self.played_until.max(Instant::now()) + length;
        }

        let taken = frames * self.channels;
        let loudest = samples[..taken].iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        // Non-negative floats order the same as their bit patterns
        self.peak.fetch_max(loudest.to_bits(), Ordering::Relaxed);
        self.frames_played.fetch_add(frames as u64, Ordering::Relaxed);
        Ok(taken)
    }

    fn flush(&mut self) {
        self.played_until = Instant::now();
    }

    fn pause(&mut self) {
        self.paused_at.get_or_insert_with(Instant::now);
    }

    fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.played_until += paused_at.elapsed();
        }
    }

    fn is_drained(&mut self) -> bool {
        !self.paced || Instant::now() >= self.played_until
    }

    fn queued_frames(&self) -> usize {
        if !self.paced {
            return 0;
        }
        let now = self.paused_at.unwrap_or_else(Instant::now);
        let ahead = self.played_until.saturating_duration_since(now);
        (ahead.as_secs_f64() * f64::from(self.sample_rate)) as usize
    }
}
