//! Pitch-preserving time stretching (WSOLA)
//!
//! Input is cut into Hann-windowed segments that overlap by half a window.
//! Output segments are laid down at a fixed synthesis hop while the analysis
//! position advances by `hop * speed`. Around each analysis position the
//! stretcher searches a small tolerance region for the segment that best
//! continues the previous one, so waveforms line up and pitch is unchanged.

use crate::error::{EngineError, EngineResult};
use earshot_core::PlaybackSpeed;

/// Segment length
const WINDOW_SECS: f64 = 0.040;
/// How far the search may move a segment from its nominal position
const TOLERANCE_SECS: f64 = 0.010;
const MIN_WINDOW: usize = 8;
/// Consumed input is dropped once this many windows have piled up
const DISCARD_WINDOWS: usize = 4;

/// Streaming time stretcher bound to one sample rate and channel count.
///
/// Feed interleaved samples with [`process`](Self::process); call
/// [`flush`](Self::flush) at end of stream to drain the tail and
/// [`clear`](Self::clear) after a discontinuity such as a seek.
#[derive(Debug, Clone)]
pub struct TimeStretcher {
    channels: usize,
    speed: PlaybackSpeed,
    window: Vec<f32>,
    overlap: usize,
    tolerance: i64,
    /// Interleaved input starting at frame `base`
    input: Vec<f32>,
    /// Mono mixdown of `input`, used by the similarity search
    mono: Vec<f32>,
    base: i64,
    /// Samples of an incomplete frame carried to the next call
    remainder: Vec<f32>,
    template: Vec<f32>,
    prev: i64,
    analysis: f64,
    /// Output frames still due for the input received so far
    owed: f64,
    started: bool,
}

impl TimeStretcher {
    pub fn new(sample_rate: u32, channels: u16, speed: PlaybackSpeed) -> EngineResult<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(EngineError::InvalidParameters(format!(
                "time stretcher needs a sample rate and channels, got {sample_rate} Hz x {channels}"
            )));
        }

        let mut window_len = ((f64::from(sample_rate) * WINDOW_SECS).round() as usize).max(MIN_WINDOW);
        if window_len % 2 == 1 {
            window_len += 1;
        }
        // Periodic Hann: halves overlapped at window_len / 2 sum to exactly one
        let window = (0..window_len)
            .map(|n| {
                let phase = 2.0 * std::f32::consts::PI * n as f32 / window_len as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        let overlap = window_len / 2;
        let tolerance = ((f64::from(sample_rate) * TOLERANCE_SECS).round() as i64).max(1);

        Ok(Self {
            channels: usize::from(channels),
            speed,
            window,
            overlap,
            tolerance,
            input: Vec::new(),
            mono: Vec::new(),
            base: 0,
            remainder: Vec::new(),
            template: Vec::with_capacity(overlap / 2 + 1),
            prev: -(overlap as i64),
            analysis: 0.0,
            owed: 0.0,
            started: false,
        })
    }

    pub fn speed(&self) -> PlaybackSpeed {
        self.speed
    }

    /// Takes effect from the next processed segment
    pub fn set_speed(&mut self, speed: PlaybackSpeed) {
        self.speed = speed;
    }

    /// Stretches `samples` (interleaved) and returns whatever output is ready
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.push(samples);

        let mut out = Vec::new();
        while self.end() >= self.needed_end() {
            self.step(&mut out);
        }
        self.discard_consumed();
        out
    }

    /// Drains the buffered tail and resets for a new stream
    pub fn flush(&mut self) -> Vec<f32> {
        let frames = self.owed.round().max(0.0) as usize;
        let len = frames * self.channels;

        let mut out = Vec::with_capacity(len + self.overlap * self.channels);
        while out.len() < len {
            self.step(&mut out);
        }
        out.truncate(len);

        self.clear();
        out
    }

    /// Discards all buffered input without producing output
    pub fn clear(&mut self) {
        self.input.clear();
        self.mono.clear();
        self.remainder.clear();
        self.base = 0;
        self.prev = -(self.overlap as i64);
        self.analysis = 0.0;
        self.owed = 0.0;
        self.started = false;
    }

    fn push(&mut self, mut samples: &[f32]) {
        if !self.remainder.is_empty() {
            let take = (self.channels - self.remainder.len()).min(samples.len());
            self.remainder.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.remainder.len() < self.channels {
                return;
            }
            let frame = std::mem::take(&mut self.remainder);
            self.append(&frame);
        }

        let whole = samples.len() / self.channels * self.channels;
        self.append(&samples[..whole]);
        self.remainder.extend_from_slice(&samples[whole..]);
    }

    fn append(&mut self, frames: &[f32]) {
        let scale = 1.0 / self.channels as f32;
        self.mono.extend(
            frames
                .chunks_exact(self.channels)
                .map(|frame| frame.iter().sum::<f32>() * scale),
        );
        self.input.extend_from_slice(frames);
        self.owed += (frames.len() / self.channels) as f64 / f64::from(self.speed.value());
    }

    fn end(&self) -> i64 {
        self.base + self.mono.len() as i64
    }

    fn hop(&self) -> f64 {
        self.overlap as f64 * f64::from(self.speed.value())
    }

    fn nominal(&self) -> i64 {
        if !self.started {
            0
        } else if self.speed.is_normal() {
            self.prev + self.overlap as i64
        } else {
            self.analysis.round() as i64
        }
    }

    /// Input needed before the next segment can be chosen; also covers the
    /// half window the segment after it will fade out
    fn needed_end(&self) -> i64 {
        self.nominal() + self.tolerance + self.window.len() as i64
    }

    fn sample(&self, frame: i64, channel: usize) -> f32 {
        if frame < self.base {
            return 0.0;
        }
        let index = (frame - self.base) as usize;
        if index >= self.mono.len() {
            0.0
        } else {
            self.input[index * self.channels + channel]
        }
    }

    fn mono_at(&self, frame: i64) -> f32 {
        if frame < self.base {
            return 0.0;
        }
        self.mono
            .get((frame - self.base) as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Emits `overlap` frames: the fading tail of the previous segment plus
    /// the rising head of the next one
    fn step(&mut self, out: &mut Vec<f32>) {
        let searched = self.started && !self.speed.is_normal();
        let pos = if searched {
            self.search(self.nominal())
        } else {
            self.nominal()
        };

        let overlap = self.overlap;
        let tail = self.prev + overlap as i64;
        for n in 0..overlap {
            let fade_out = self.window[overlap + n];
            let fade_in = self.window[n];
            for channel in 0..self.channels {
                out.push(
                    self.sample(tail + n as i64, channel) * fade_out
                        + self.sample(pos + n as i64, channel) * fade_in,
                );
            }
        }

        self.analysis = if searched {
            self.analysis + self.hop()
        } else {
            pos as f64 + self.hop()
        };
        self.prev = pos;
        self.started = true;
        self.owed -= overlap as f64;
    }

    /// Best segment start within the tolerance region around `nominal`
    fn search(&mut self, nominal: i64) -> i64 {
        let tail = self.prev + self.overlap as i64;
        let template: Vec<f32> = (0..self.overlap)
            .step_by(2)
            .map(|n| self.mono_at(tail + n as i64))
            .collect();
        self.template = template;

        let lo = (nominal - self.tolerance).max(self.base).max(0);
        let hi = nominal + self.tolerance;

        let mut best = nominal.clamp(lo, hi);
        let mut best_score = self.similarity(best);

        let mut candidate = lo;
        while candidate <= hi {
            if candidate != best {
                let score = self.similarity(candidate);
                if score > best_score {
                    best = candidate;
                    best_score = score;
                }
            }
            candidate += 2;
        }

        let coarse = best;
        for candidate in [coarse - 1, coarse + 1] {
            if (lo..=hi).contains(&candidate) {
                let score = self.similarity(candidate);
                if score > best_score {
                    best = candidate;
                    best_score = score;
                }
            }
        }
        best
    }

    /// Normalised cross-correlation of the segment at `pos` with the template
    fn similarity(&self, pos: i64) -> f32 {
        let mut dot = 0.0f32;
        let mut energy = 0.0f32;
        for (i, &t) in self.template.iter().enumerate() {
            let x = self.mono_at(pos + 2 * i as i64);
            dot += t * x;
            energy += x * x;
        }
        if energy <= f32::EPSILON {
            0.0
        } else {
            dot / energy.sqrt()
        }
    }

    fn discard_consumed(&mut self) {
        if !self.started {
            return;
        }
        let keep_from = (self.prev + self.overlap as i64)
            .min(self.nominal() - self.tolerance)
            .max(self.base);
        let drop = (keep_from - self.base) as usize;
        if drop >= self.window.len() * DISCARD_WINDOWS {
            self.input.drain(..drop * self.channels);
            self.mono.drain(..drop);
            self.base += drop as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 44_100;

    fn speed(value: f32) -> PlaybackSpeed {
        PlaybackSpeed::new(value).unwrap()
    }

    fn sine(freq: f32, seconds: f32, channels: usize) -> Vec<f32> {
        let frames = (RATE as f32 * seconds) as usize;
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let t = i as f32 / RATE as f32;
            let value = (2.0 * std::f32::consts::PI * freq * t).sin() * 0.5;
            for _ in 0..channels {
                samples.push(value);
            }
        }
        samples
    }

    fn stretch(stretcher: &mut TimeStretcher, input: &[f32], chunk: usize) -> Vec<f32> {
        let mut out = Vec::new();
        for block in input.chunks(chunk) {
            out.extend(stretcher.process(block));
        }
        out.extend(stretcher.flush());
        out
    }

    #[test]
    fn test_rejects_empty_layout() {
        assert!(TimeStretcher::new(0, 2, PlaybackSpeed::NORMAL).is_err());
        assert!(TimeStretcher::new(RATE, 0, PlaybackSpeed::NORMAL).is_err());
    }

    #[test]
    fn test_normal_speed_is_transparent() {
        let input = sine(440.0, 0.5, 2);
        let mut stretcher = TimeStretcher::new(RATE, 2, PlaybackSpeed::NORMAL).unwrap();

        let out = stretch(&mut stretcher, &input, 1000);

        assert_eq!(out.len(), input.len());
        for (a, b) in input.iter().zip(&out) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_double_speed_halves_length() {
        let input = sine(440.0, 2.0, 1);
        let mut stretcher = TimeStretcher::new(RATE, 1, speed(2.0)).unwrap();

        let out = stretch(&mut stretcher, &input, 4096);

        let expected = input.len() / 2;
        let diff = (out.len() as i64 - expected as i64).abs();
        assert!(diff <= 1, "expected ~{expected} samples, got {}", out.len());
    }

    #[test]
    fn test_partial_frames_are_carried_over() {
        let mut stretcher = TimeStretcher::new(RATE, 2, PlaybackSpeed::NORMAL).unwrap();
        let input = sine(440.0, 0.2, 2);

        let mut out = Vec::new();
        // Odd-sized blocks split frames between calls
        for block in input.chunks(333) {
            out.extend(stretcher.process(block));
        }
        out.extend(stretcher.flush());

        assert_eq!(out.len(), input.len());
    }

    #[test]
    fn test_clear_discards_buffered_input() {
        let mut stretcher = TimeStretcher::new(RATE, 1, speed(1.5)).unwrap();
        stretcher.process(&sine(440.0, 0.01, 1));

        stretcher.clear();

        assert!(stretcher.flush().is_empty());
    }

    #[test]
    fn test_set_speed_keeps_stream_running() {
        let mut stretcher = TimeStretcher::new(RATE, 1, PlaybackSpeed::NORMAL).unwrap();
        let input = sine(220.0, 1.0, 1);
        let (first, second) = input.split_at(input.len() / 2);

        let mut out = stretcher.process(first);
        stretcher.set_speed(speed(2.0));
        out.extend(stretcher.process(second));
        out.extend(stretcher.flush());

        assert_eq!(stretcher.speed(), speed(2.0));
        let expected = first.len() as f64 + second.len() as f64 / 2.0;
        let ratio = out.len() as f64 / expected;
        assert!((ratio - 1.0).abs() < 0.02, "ratio {ratio}");
    }
}
