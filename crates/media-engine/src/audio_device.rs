//! Output device enumeration and stream layout negotiation

use crate::error::{EngineError, EngineResult};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};
use serde::{Deserialize, Serialize};

/// Widest channel layout the sink accepts
pub const MAX_CHANNELS: u16 = 8;

const COMMON_RATES: [u32; 9] = [8000, 11025, 16000, 22050, 44100, 48000, 88200, 96000, 192000];

/// Information about an audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    /// Human-readable name
    pub name: String,
    /// Whether this is the system default device
    pub is_default: bool,
    /// Common sample rates the device accepts as 32-bit float
    pub sample_rates: Vec<u32>,
    pub min_channels: u16,
    pub max_channels: u16,
    pub default_sample_rate: Option<u32>,
}

/// One supported float output range of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConfigRange {
    pub channels: u16,
    pub min_rate: u32,
    pub max_rate: u32,
}

impl ConfigRange {
    fn accepts(&self, rate: u32) -> bool {
        (self.min_rate..=self.max_rate).contains(&rate)
    }
}

/// Layout the device stream will actually run at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub channels: u16,
    pub sample_rate: u32,
}

impl Negotiated {
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            channels: self.channels,
            sample_rate: SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

/// Lists every output device of the default host
pub fn list_output_devices() -> EngineResult<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| EngineError::DeviceBusy(format!("failed to enumerate devices: {e}")))?;

    let mut infos = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else { continue };
        let ranges = match float_ranges(&device) {
            Ok(ranges) => ranges,
            Err(e) => {
                log::warn!("Skipping device '{}': {}", name, e);
                continue;
            }
        };

        let mut sample_rates: Vec<u32> = COMMON_RATES
            .iter()
            .copied()
            .filter(|&rate| ranges.iter().any(|r| r.accepts(rate)))
            .collect();
        sample_rates.dedup();

        infos.push(AudioDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            sample_rates,
            min_channels: ranges.iter().map(|r| r.channels).min().unwrap_or(0),
            max_channels: ranges.iter().map(|r| r.channels).max().unwrap_or(0),
            default_sample_rate: device.default_output_config().ok().map(|c| c.sample_rate().0),
            name,
        });
    }
    Ok(infos)
}

pub(crate) fn default_device() -> EngineResult<Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| EngineError::DeviceBusy("no output device available".to_string()))
}

/// Float output ranges `device` supports
pub(crate) fn float_ranges(device: &Device) -> EngineResult<Vec<ConfigRange>> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| EngineError::DeviceBusy(format!("failed to query device configs: {e}")))?;

    Ok(configs
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .map(|c| ConfigRange {
            channels: c.channels(),
            min_rate: c.min_sample_rate().0,
            max_rate: c.max_sample_rate().0,
        })
        .collect())
}

/// Picks the device layout for a stream of `sample_rate` x `channels`.
///
/// Mono may be widened to stereo; any other mismatch in channel count is a
/// [`EngineError::DeviceError`]. An unsupported rate falls back to
/// `default_rate` (or the highest rate on offer) and the caller resamples.
pub(crate) fn negotiate(
    ranges: &[ConfigRange],
    default_rate: Option<u32>,
    sample_rate: u32,
    channels: u16,
) -> EngineResult<Negotiated> {
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(EngineError::DeviceError(format!(
            "unsupported channel layout: {channels} channels"
        )));
    }

    let layouts: &[u16] = if channels == 1 { &[1, 2] } else { &[channels] };

    for &device_channels in layouts {
        let candidates: Vec<&ConfigRange> = ranges
            .iter()
            .filter(|r| r.channels == device_channels)
            .collect();
        if candidates.is_empty() {
            continue;
        }

        if candidates.iter().any(|r| r.accepts(sample_rate)) {
            return Ok(Negotiated {
                channels: device_channels,
                sample_rate,
            });
        }

        let fallback = default_rate
            .filter(|&rate| candidates.iter().any(|r| r.accepts(rate)))
            .unwrap_or_else(|| candidates.iter().map(|r| r.max_rate).max().unwrap_or(sample_rate));
        return Ok(Negotiated {
            channels: device_channels,
            sample_rate: fallback,
        });
    }

    Err(EngineError::DeviceError(format!(
        "device cannot play {channels} channels"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(channels: u16, min_rate: u32, max_rate: u32) -> ConfigRange {
        ConfigRange {
            channels,
            min_rate,
            max_rate,
        }
    }

    #[test]
    fn test_exact_match() {
        let ranges = [range(2, 8000, 192000)];
        let negotiated = negotiate(&ranges, Some(48000), 44100, 2).unwrap();
        assert_eq!(negotiated, Negotiated { channels: 2, sample_rate: 44100 });
    }

    #[test]
    fn test_mono_widened_to_stereo() {
        let ranges = [range(2, 44100, 48000)];
        let negotiated = negotiate(&ranges, None, 44100, 1).unwrap();
        assert_eq!(negotiated.channels, 2);
    }

    #[test]
    fn test_unsupported_rate_falls_back_to_default() {
        let ranges = [range(2, 48000, 48000)];
        let negotiated = negotiate(&ranges, Some(48000), 22050, 2).unwrap();
        assert_eq!(negotiated.sample_rate, 48000);
    }

    #[test]
    fn test_unsupported_layouts_are_device_errors() {
        let ranges = [range(2, 8000, 48000)];
        assert!(matches!(
            negotiate(&ranges, None, 44100, 6),
            Err(EngineError::DeviceError(_))
        ));
        assert!(matches!(
            negotiate(&ranges, None, 44100, 0),
            Err(EngineError::DeviceError(_))
        ));
        assert!(matches!(
            negotiate(&[range(12, 8000, 48000)], None, 44100, 12),
            Err(EngineError::DeviceError(_))
        ));
    }
}
