//! Playback speed and volume gain

use crate::error::{CoreError, Result};
use crate::types::Validator;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Playback speed factor; pitch is always preserved by the engine
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct PlaybackSpeed(f32);

impl PlaybackSpeed {
    /// Slowest supported speed
    pub const MIN: f32 = 0.5;
    /// Fastest supported speed
    pub const MAX: f32 = 3.0;
    /// Normal speed
    pub const NORMAL: Self = Self(1.0);

    /// Creates a new playback speed (0.5x - 3.0x)
    pub fn new(speed: f32) -> Result<Self> {
        if speed.is_finite() && (Self::MIN..=Self::MAX).contains(&speed) {
            Ok(Self(speed))
        } else {
            Err(CoreError::InvalidSpeed {
                speed,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }

    /// Returns the speed value
    pub fn value(&self) -> f32 {
        self.0
    }

    /// Returns true if this is normal (1.0x) speed
    pub fn is_normal(&self) -> bool {
        (self.0 - 1.0).abs() < f32::EPSILON
    }

    /// Returns the speed moved by `delta`, clamped to the supported range
    pub fn step(&self, delta: f32) -> Self {
        let stepped = (self.0 + delta).clamp(Self::MIN, Self::MAX);
        Self((stepped * 100.0).round() / 100.0)
    }
}

impl Default for PlaybackSpeed {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<f32> for PlaybackSpeed {
    type Error = CoreError;

    fn try_from(value: f32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PlaybackSpeed> for f32 {
    fn from(speed: PlaybackSpeed) -> Self {
        speed.0
    }
}

impl fmt::Display for PlaybackSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}x", self.0)
    }
}

impl Validator for PlaybackSpeed {
    fn validate(&self) -> std::result::Result<(), Vec<String>> {
        if self.0.is_finite() && (Self::MIN..=Self::MAX).contains(&self.0) {
            Ok(())
        } else {
            Err(vec![format!(
                "Speed must be between {} and {}",
                Self::MIN,
                Self::MAX
            )])
        }
    }
}

/// Loudness boost in decibels applied on top of the decoded audio
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct VolumeGain(f32);

impl VolumeGain {
    /// Largest supported boost in dB
    pub const MAX_DB: f32 = 9.0;
    /// No boost
    pub const NONE: Self = Self(0.0);

    /// Creates a gain of `db` decibels (0 - 9 dB)
    pub fn new(db: f32) -> Result<Self> {
        if db.is_finite() && (0.0..=Self::MAX_DB).contains(&db) {
            Ok(Self(db))
        } else {
            Err(CoreError::InvalidGain {
                db,
                max: Self::MAX_DB,
            })
        }
    }

    pub fn db(&self) -> f32 {
        self.0
    }

    /// Linear amplitude factor
    pub fn factor(&self) -> f32 {
        10f32.powf(self.0 / 20.0)
    }

    /// Returns the gain moved by `delta` dB, clamped to the supported range
    pub fn step(&self, delta: f32) -> Self {
        let stepped = (self.0 + delta).clamp(0.0, Self::MAX_DB);
        Self((stepped * 10.0).round() / 10.0)
    }
}

impl TryFrom<f32> for VolumeGain {
    type Error = CoreError;

    fn try_from(value: f32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<VolumeGain> for f32 {
    fn from(gain: VolumeGain) -> Self {
        gain.0
    }
}

impl fmt::Display for VolumeGain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:.1} dB", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_bounds() {
        assert!(PlaybackSpeed::new(0.5).is_ok());
        assert!(PlaybackSpeed::new(3.0).is_ok());
        assert!(PlaybackSpeed::new(0.49).is_err());
        assert!(PlaybackSpeed::new(3.01).is_err());
        assert!(PlaybackSpeed::new(f32::NAN).is_err());
        assert!(PlaybackSpeed::new(f32::INFINITY).is_err());
    }

    #[test]
    fn test_speed_default_is_normal() {
        let speed = PlaybackSpeed::default();
        assert!(speed.is_normal());
        assert_eq!(speed.value(), 1.0);
    }

    #[test]
    fn test_speed_step_clamps() {
        let fast = PlaybackSpeed::new(2.9).unwrap().step(0.25);
        assert_eq!(fast.value(), 3.0);
        let slow = PlaybackSpeed::new(0.6).unwrap().step(-0.25);
        assert_eq!(slow.value(), 0.5);
        let mid = PlaybackSpeed::NORMAL.step(0.25);
        assert_eq!(mid.value(), 1.25);
    }

    #[test]
    fn test_speed_display() {
        assert_eq!(PlaybackSpeed::new(1.5).unwrap().to_string(), "1.50x");
    }

    #[test]
    fn test_speed_deserialize_rejects_out_of_range() {
        let ok: PlaybackSpeed = serde_json::from_str("1.25").unwrap();
        assert_eq!(ok.value(), 1.25);
        assert!(serde_json::from_str::<PlaybackSpeed>("7.0").is_err());
    }

    #[test]
    fn test_gain_bounds() {
        assert!(VolumeGain::new(0.0).is_ok());
        assert!(VolumeGain::new(9.0).is_ok());
        assert!(VolumeGain::new(-1.0).is_err());
        assert!(VolumeGain::new(9.5).is_err());
        assert!(VolumeGain::new(f32::NAN).is_err());
    }

    #[test]
    fn test_gain_factor() {
        assert_eq!(VolumeGain::NONE.factor(), 1.0);
        let six = VolumeGain::new(6.0).unwrap().factor();
        assert!((six - 1.995).abs() < 0.01);
    }

    #[test]
    fn test_gain_step_clamps() {
        assert_eq!(VolumeGain::new(8.5).unwrap().step(1.0).db(), 9.0);
        assert_eq!(VolumeGain::NONE.step(-1.0).db(), 0.0);
        assert_eq!(VolumeGain::NONE.step(1.0).to_string(), "+1.0 dB");
    }

    #[test]
    fn test_gain_deserialize_rejects_out_of_range() {
        let ok: VolumeGain = serde_json::from_str("3.0").unwrap();
        assert_eq!(ok.db(), 3.0);
        assert!(serde_json::from_str::<VolumeGain>("12.0").is_err());
    }
}
