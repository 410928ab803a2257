//! Sleep timer countdown

use std::time::Duration;

const INACTIVE: i64 = -1;

/// Result of advancing the timer by one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepTimerTick {
    Inactive,
    Running(i64),
    /// Reached zero on this tick
    Expired,
}

/// Remaining time in milliseconds: `-1` inactive, `0` just expired,
/// positive while counting down.
///
/// The timer has no clock of its own; the controller advances it only
/// while playback is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SleepTimer {
    remaining_ms: i64,
    default: Duration,
}

impl SleepTimer {
    pub fn new(default: Duration) -> Self {
        Self {
            remaining_ms: INACTIVE,
            default,
        }
    }

    /// Starts counting down from the configured default
    pub fn activate(&mut self) {
        self.activate_for(self.default);
    }

    /// Starts counting down from `duration`
    pub fn activate_for(&mut self, duration: Duration) {
        self.remaining_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1);
    }

    pub fn deactivate(&mut self) {
        self.remaining_ms = INACTIVE;
    }

    pub fn remaining_ms(&self) -> i64 {
        self.remaining_ms
    }

    pub fn is_active(&self) -> bool {
        self.remaining_ms > 0
    }

    /// Volume factor over the last `fade_out` of the countdown: 1 until the
    /// fade starts, then easing down towards 0
    pub fn fade_level(&self, fade_out: Duration) -> f32 {
        let fade_ms = i64::try_from(fade_out.as_millis()).unwrap_or(i64::MAX);
        if !self.is_active() || fade_ms == 0 || self.remaining_ms >= fade_ms {
            return 1.0;
        }
        let left = (self.remaining_ms as f64 / fade_ms as f64) as f32;
        left * left * (3.0 - 2.0 * left)
    }

    pub fn tick(&mut self, elapsed: Duration) -> SleepTimerTick {
        if !self.is_active() {
            return SleepTimerTick::Inactive;
        }
        let elapsed = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        self.remaining_ms = (self.remaining_ms - elapsed).max(0);
        if self.remaining_ms == 0 {
            SleepTimerTick::Expired
        } else {
            SleepTimerTick::Running(self.remaining_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_inactive() {
        let timer = SleepTimer::new(Duration::from_secs(20 * 60));
        assert_eq!(timer.remaining_ms(), -1);
        assert!(!timer.is_active());
    }

    #[test]
    fn test_activate_uses_default() {
        let mut timer = SleepTimer::new(Duration::from_secs(20 * 60));
        timer.activate();
        assert_eq!(timer.remaining_ms(), 1_200_000);
        assert!(timer.is_active());
    }

    #[test]
    fn test_counts_down_and_expires_once() {
        let mut timer = SleepTimer::new(Duration::from_secs(60));
        timer.activate_for(Duration::from_secs(2));

        assert_eq!(timer.tick(Duration::from_secs(1)), SleepTimerTick::Running(1_000));
        assert_eq!(timer.tick(Duration::from_secs(1)), SleepTimerTick::Expired);
        assert_eq!(timer.remaining_ms(), 0);
        assert_eq!(timer.tick(Duration::from_secs(1)), SleepTimerTick::Inactive);
    }

    #[test]
    fn test_fade_level_eases_out() {
        let fade = Duration::from_secs(10);
        let mut timer = SleepTimer::new(Duration::from_secs(60));
        assert_eq!(timer.fade_level(fade), 1.0);

        timer.activate_for(Duration::from_secs(30));
        assert_eq!(timer.fade_level(fade), 1.0);

        timer.tick(Duration::from_secs(25));
        assert_eq!(timer.fade_level(fade), 0.5);

        timer.tick(Duration::from_secs(4));
        let near_end = timer.fade_level(fade);
        assert!(near_end > 0.0 && near_end < 0.05, "level {near_end}");
        assert_eq!(timer.fade_level(Duration::ZERO), 1.0);
    }

    #[test]
    fn test_deactivate_cancels() {
        let mut timer = SleepTimer::new(Duration::from_secs(60));
        timer.activate();
        timer.deactivate();
        assert_eq!(timer.tick(Duration::from_secs(1)), SleepTimerTick::Inactive);
        assert_eq!(timer.remaining_ms(), -1);
    }
}
