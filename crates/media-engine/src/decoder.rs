//! Symphonia source backend

use crate::backend::{AudioSource, SourceBackend, StreamParams};
use crate::error::{EngineError, EngineResult};
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::{Error as SymphoniaError, SeekErrorKind};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

/// Demuxes and decodes every container/codec symphonia was built with
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaBackend;

impl SymphoniaBackend {
    pub const NAME: &'static str = "symphonia";

    pub fn new() -> Self {
        Self
    }
}

impl SourceBackend for SymphoniaBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn open(&self, path: &Path) -> EngineResult<Box<dyn AudioSource>> {
        Ok(Box::new(SymphoniaSource::open(path)?))
    }
}

pub struct SymphoniaSource {
    path: PathBuf,
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    params: StreamParams,
    /// Set when a seek lands past the last packet
    exhausted: bool,
}

impl SymphoniaSource {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::FileNotFound(path.to_path_buf()),
            _ => EngineError::IoError(e),
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(extension);
        }

        let detected = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| unsupported(path, format!("unrecognised container: {e}")))?;

        let reader = detected.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| unsupported(path, "no audio track".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| unsupported(path, format!("no decoder: {e}")))?;

        let duration_ms = match (codec_params.n_frames, codec_params.time_base, codec_params.sample_rate) {
            (Some(frames), Some(time_base), _) => Some(time_to_ms(time_base.calc_time(frames))),
            (Some(frames), None, Some(rate)) if rate > 0 => Some(frames * 1000 / u64::from(rate)),
            _ => None,
        };

        let params = StreamParams {
            sample_rate: codec_params.sample_rate,
            channels: codec_params.channels.map(|c| c.count() as u16),
            duration_ms,
            codec: symphonia::default::get_codecs()
                .get_codec(codec_params.codec)
                .map(|descriptor| descriptor.short_name.to_string()),
        };

        log::debug!("Opened {}: {:?}", path.display(), params);

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            decoder,
            track_id,
            time_base: codec_params.time_base,
            params,
            exhausted: false,
        })
    }

    fn codec_error(&self, message: String) -> EngineError {
        EngineError::CodecError {
            file: self.path.clone(),
            message,
        }
    }
}

impl AudioSource for SymphoniaSource {
    fn params(&self) -> &StreamParams {
        &self.params
    }

    fn next_chunk(&mut self) -> EngineResult<Option<Vec<f32>>> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => return Err(self.codec_error(format!("read failed: {e}"))),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    log::warn!("Decode error in {}, skipping packet: {}", self.path.display(), e);
                    continue;
                }
                Err(e) => return Err(self.codec_error(format!("decode failed: {e}"))),
            };

            if decoded.frames() == 0 {
                continue;
            }

            let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
            buffer.copy_interleaved_ref(decoded);
            return Ok(Some(buffer.samples().to_vec()));
        }
    }

    fn seek(&mut self, position_ms: u64) -> EngineResult<u64> {
        let to = SeekTo::Time {
            time: Time::from(position_ms as f64 / 1000.0),
            track_id: Some(self.track_id),
        };

        // Coarse lands on a nearby sync point, usually at or before the target
        match self.reader.seek(SeekMode::Coarse, to) {
            Ok(seeked) => {
                self.decoder.reset();
                self.exhausted = false;
                let landed = match (self.time_base, self.params.sample_rate) {
                    (Some(time_base), _) => time_to_ms(time_base.calc_time(seeked.actual_ts)),
                    (None, Some(rate)) if rate > 0 => seeked.actual_ts * 1000 / u64::from(rate),
                    _ => position_ms,
                };
                Ok(checked_landing(&self.path, position_ms, landed))
            }
            Err(SymphoniaError::SeekError(SeekErrorKind::OutOfRange)) => {
                log::debug!("Seek to {position_ms} ms is past the end of {}", self.path.display());
                self.exhausted = true;
                Ok(position_ms)
            }
            Err(e) => Err(self.codec_error(format!("seek failed: {e}"))),
        }
    }
}

/// Passes the landing point through, noting seeks that overshoot; the
/// reported position must match what is heard next
fn checked_landing(path: &Path, requested_ms: u64, landed_ms: u64) -> u64 {
    if landed_ms > requested_ms {
        log::debug!(
            "Seek in {} overshot: asked for {} ms, landed at {} ms",
            path.display(),
            requested_ms,
            landed_ms
        );
    }
    landed_ms
}

fn time_to_ms(time: Time) -> u64 {
    time.seconds * 1000 + (time.frac * 1000.0).round() as u64
}

fn unsupported(path: &Path, message: String) -> EngineError {
    EngineError::UnsupportedFormat {
        file: path.to_path_buf(),
        message,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Writes a 16-bit PCM WAV holding a 440 Hz tone
    pub(crate) fn write_wav(path: &Path, sample_rate: u32, channels: u16, frames: u32) {
        let data_len = frames * u32::from(channels) * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * u32::from(channels) * 2).to_le_bytes());
        bytes.extend_from_slice(&(channels * 2).to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let value = ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 8000.0) as i16;
            for _ in 0..channels {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&bytes).unwrap();
    }

    #[test]
    fn test_overshooting_seek_reports_landing() {
        let path = Path::new("book.m4b");
        assert_eq!(checked_landing(path, 10_000, 10_480), 10_480);
        assert_eq!(checked_landing(path, 10_000, 9_600), 9_600);
    }

    #[test]
    fn test_missing_file() {
        let result = SymphoniaSource::open(Path::new("nonexistent.mp3"));
        assert!(matches!(result, Err(EngineError::FileNotFound(_))));
    }

    #[test]
    fn test_garbage_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.mp3");
        std::fs::write(&path, b"definitely not audio").unwrap();

        let result = SymphoniaSource::open(&path);
        assert!(matches!(result, Err(EngineError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_wav_stream_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 8_000, 2, 16_000);

        let source = SymphoniaSource::open(&path).unwrap();
        let params = source.params();

        assert_eq!(params.sample_rate, Some(8_000));
        assert_eq!(params.channels, Some(2));
        assert_eq!(params.duration_ms, Some(2_000));
        assert!(params.codec.is_some());
    }

    #[test]
    fn test_decodes_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 8_000, 1, 4_000);

        let mut source = SymphoniaSource::open(&path).unwrap();
        let mut total = 0;
        while let Some(chunk) = source.next_chunk().unwrap() {
            total += chunk.len();
        }

        assert_eq!(total, 4_000);
    }

    #[test]
    fn test_seek_lands_at_or_before_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_wav(&path, 8_000, 1, 16_000);

        let mut source = SymphoniaSource::open(&path).unwrap();
        let landed = source.seek(1_000).unwrap();

        assert!(landed <= 1_000);
        assert!(source.next_chunk().unwrap().is_some());
    }
}
