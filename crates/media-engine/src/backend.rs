//! Decoder and output backends
//!
//! A [`SourceBackend`] turns a chapter file into an [`AudioSource`] producing
//! interleaved `f32` PCM; an [`OutputBackend`] opens an [`AudioSink`] for a
//! given sample rate and channel count. The decode pipeline only talks to
//! these traits, so the backend is picked by name when a chapter is prepared.

use crate::decoder::SymphoniaBackend;
use crate::error::{EngineError, EngineResult};
use earshot_core::Chapter;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Stream parameters as reported by the demuxer; any of them may be absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub duration_ms: Option<u64>,
    pub codec: Option<String>,
}

/// Stream parameters a chapter needs before it can be played
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u64,
    pub codec: String,
}

impl StreamInfo {
    /// Checks that every required parameter is present.
    ///
    /// Fails with [`EngineError::FormatError`] naming all missing keys.
    pub fn from_params(file: &Path, params: &StreamParams) -> EngineResult<Self> {
        let mut missing = Vec::new();

        let sample_rate = params.sample_rate.filter(|&r| r > 0);
        if sample_rate.is_none() {
            missing.push("sample rate".to_string());
        }
        let channels = params.channels.filter(|&c| c > 0);
        if channels.is_none() {
            missing.push("channel count".to_string());
        }
        if params.duration_ms.is_none() {
            missing.push("duration".to_string());
        }
        let codec = params.codec.clone().filter(|c| !c.is_empty());
        if codec.is_none() {
            missing.push("codec".to_string());
        }

        match (sample_rate, channels, params.duration_ms, codec) {
            (Some(sample_rate), Some(channels), Some(duration_ms), Some(codec)) => Ok(Self {
                sample_rate,
                channels,
                duration_ms,
                codec,
            }),
            _ => Err(EngineError::FormatError {
                file: file.to_path_buf(),
                missing,
            }),
        }
    }

    /// Milliseconds covered by `frames` frames at this rate
    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        frames * 1000 / u64::from(self.sample_rate)
    }
}

/// An opened, demuxed and decoding chapter
pub trait AudioSource: Send {
    fn params(&self) -> &StreamParams;

    /// Next block of interleaved samples, or `None` at end of stream
    fn next_chunk(&mut self) -> EngineResult<Option<Vec<f32>>>;

    /// Repositions to a sync point near `position_ms`, normally at or
    /// before it.
    ///
    /// Returns where the stream actually landed, even past the target.
    fn seek(&mut self, position_ms: u64) -> EngineResult<u64>;
}

/// A PCM output device bound to one sample rate and channel layout
pub trait AudioSink {
    /// Queues as much of `samples` as fits within `timeout`.
    ///
    /// Returns the number of samples taken, always a whole number of frames.
    fn write(&mut self, samples: &[f32], timeout: Duration) -> EngineResult<usize>;

    /// Drops everything queued but not yet played
    fn flush(&mut self);

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// No more samples will follow
    fn end_of_stream(&mut self) {}

    /// True once every queued sample has been played; moves staged
    /// samples along as a side effect
    fn is_drained(&mut self) -> bool;

    /// Frames taken by `write` that have not been heard yet, at the rate the
    /// sink was opened with
    fn queued_frames(&self) -> usize {
        0
    }
}

pub trait SourceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, path: &Path) -> EngineResult<Box<dyn AudioSource>>;
}

pub trait OutputBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, sample_rate: u32, channels: u16) -> EngineResult<Box<dyn AudioSink>>;
}

/// Source backends by name
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn SourceBackend>>,
}

impl BackendRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in symphonia backend
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SymphoniaBackend::new()));
        registry
    }

    /// Adds `backend`, replacing any backend of the same name
    pub fn register(&mut self, backend: Arc<dyn SourceBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> EngineResult<Arc<dyn SourceBackend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownBackend(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Opens `path` just long enough to read its stream parameters
pub fn read_stream_info(backend: &dyn SourceBackend, path: &Path) -> EngineResult<StreamInfo> {
    let source = backend.open(path)?;
    StreamInfo::from_params(path, source.params())
}

/// Builds a [`Chapter`] named after the file stem with its decoded duration
pub fn chapter_from_file(backend: &dyn SourceBackend, path: &Path) -> EngineResult<Chapter> {
    let info = read_stream_info(backend, path)?;
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Chapter::new(path, info.duration_ms, name))
}
