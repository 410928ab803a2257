//! Media Engine - audiobook playback for Earshot
//!
//! A [`PlaybackController`] state machine drives one [`DecodePipeline`] per
//! chapter. Each pipeline decodes on its own thread, stretches PCM to the
//! requested speed with a pitch-preserving [`TimeStretcher`] and writes it
//! to an [`AudioSink`].

mod audio_device;
mod backend;
mod controller;
mod decoder;
mod error;
mod events;
mod heartbeat;
mod output;
mod pipeline;
mod resampler;
mod sleep_timer;
mod speed;
mod state;
mod store;

pub use audio_device::{list_output_devices, AudioDeviceInfo, MAX_CHANNELS};
pub use backend::{
    chapter_from_file, read_stream_info, AudioSink, AudioSource, BackendRegistry, OutputBackend,
    SourceBackend, StreamInfo, StreamParams,
};
pub use controller::{ControllerBuilder, FocusLoss, PlaybackController, SkipDirection};
pub use decoder::{SymphoniaBackend, SymphoniaSource};
pub use error::{EngineError, EngineResult};
pub use events::{EventBus, PlayerEvent};
pub use heartbeat::Heartbeat;
pub use output::{CpalOutput, CpalSink, NullOutput};
pub use pipeline::{
    DecodePipeline, PipelineCommand, PipelineListener, PipelineState, PrepareRequest,
};
pub use resampler::Resampler;
pub use sleep_timer::{SleepTimer, SleepTimerTick};
pub use speed::TimeStretcher;
pub use state::ControllerState;
pub use store::{JsonPositionStore, MemoryPositionStore, PositionStore, PositionUpdate};
pub use earshot_core::PlaybackSpeed;
