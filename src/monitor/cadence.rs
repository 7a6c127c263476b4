use std::time::Duration;

/// Polling interval that tightens on activity and relaxes while idle.
///
/// After N consecutive idle ticks the interval is `min(min * factor^N, max)`;
/// any accepted transfer snaps it back to `min`.
#[derive(Debug, Clone)]
pub struct AdaptiveCadence {
    min: Duration,
    max: Duration,
    factor: f64,
    idle_streak: u32,
    current: Duration,
    /// Interval the timer was last armed with
    armed: Duration,
    rearm_threshold: Duration,
}

impl AdaptiveCadence {
    pub fn new(min: Duration, max: Duration, factor: f64, rearm_threshold: Duration) -> Self {
        let max = max.max(min);
        let factor = if factor.is_finite() && factor >= 1.0 { factor } else { 1.0 };
        Self {
            min,
            max,
            factor,
            idle_streak: 0,
            current: min,
            armed: min,
            rearm_threshold,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn armed(&self) -> Duration {
        self.armed
    }

    pub fn idle_streak(&self) -> u32 {
        self.idle_streak
    }

    pub fn record_activity(&mut self) {
        self.idle_streak = 0;
        self.current = self.min;
    }

    pub fn record_idle(&mut self) {
        self.idle_streak = self.idle_streak.saturating_add(1);
        self.current = self.interval_after(self.idle_streak);
    }

    fn interval_after(&self, idle_ticks: u32) -> Duration {
        let exponent = idle_ticks.min(i32::MAX as u32) as i32;
        let secs = self.min.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Returns the new timer period when it moved by more than the threshold
    pub fn rearm(&mut self) -> Option<Duration> {
        let delta = if self.current > self.armed {
            self.current - self.armed
        } else {
            self.armed - self.current
        };

        if delta > self.rearm_threshold {
            self.armed = self.current;
            Some(self.armed)
        } else {
            None
        }
    }
}
