//! Sample rate conversion for devices that reject the stream's rate

use crate::error::{EngineError, EngineResult};
use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};

const CHUNK_FRAMES: usize = 1024;

/// Streaming interleaved resampler
pub struct Resampler {
    inner: SincFixedIn<f32>,
    channels: usize,
    /// Deinterleaved input waiting for a full chunk
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> EngineResult<Self> {
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            oversampling_factor: 256,
            interpolation: SincInterpolationType::Cubic,
            window: WindowFunction::BlackmanHarris,
        };

        let channels = usize::from(channels);
        let inner = SincFixedIn::new(
            f64::from(to_rate) / f64::from(from_rate),
            1.0,
            params,
            CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| EngineError::DeviceError(format!("cannot resample {from_rate} -> {to_rate}: {e}")))?;

        Ok(Self {
            inner,
            channels,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES); channels],
        })
    }

    /// Converts `input` and returns whatever whole chunks are ready
    pub fn process(&mut self, input: &[f32]) -> EngineResult<Vec<f32>> {
        for frame in input.chunks_exact(self.channels) {
            for (channel, &sample) in frame.iter().enumerate() {
                self.pending[channel].push(sample);
            }
        }

        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending[0].len() < needed {
                break;
            }
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();
            let converted = self
                .inner
                .process(&chunk, None)
                .map_err(|e| EngineError::DeviceError(format!("resampling failed: {e}")))?;
            interleave(&converted, &mut out);
        }
        Ok(out)
    }

    /// Pushes out the partial chunk still buffered
    pub fn flush(&mut self) -> EngineResult<Vec<f32>> {
        let mut out = Vec::new();
        if !self.pending[0].is_empty() {
            let converted = self
                .inner
                .process_partial(Some(self.pending.as_slice()), None)
                .map_err(|e| EngineError::DeviceError(format!("resampling failed: {e}")))?;
            interleave(&converted, &mut out);
        }
        self.reset();
        Ok(out)
    }

    pub fn reset(&mut self) {
        self.inner.reset();
        self.pending.iter_mut().for_each(Vec::clear);
    }
}

fn interleave(planes: &[Vec<f32>], out: &mut Vec<f32>) {
    let frames = planes.first().map_or(0, Vec::len);
    out.reserve(frames * planes.len());
    for frame in 0..frames {
        for plane in planes {
            out.push(plane[frame]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsampling_length() {
        let mut resampler = Resampler::new(44_100, 48_000, 2).unwrap();
        let input = vec![0.25f32; 44_100 * 2];

        let mut out = resampler.process(&input).unwrap();
        out.extend(resampler.flush().unwrap());

        let frames = out.len() / 2;
        let ratio = frames as f64 / 48_000.0;
        assert_eq!(out.len() % 2, 0);
        assert!((ratio - 1.0).abs() < 0.05, "ratio {ratio}");
    }

    #[test]
    fn test_short_input_waits_for_chunk() {
        let mut resampler = Resampler::new(22_050, 48_000, 1).unwrap();
        assert!(resampler.process(&[0.1; 100]).unwrap().is_empty());
        assert!(!resampler.flush().unwrap().is_empty());
    }
}
