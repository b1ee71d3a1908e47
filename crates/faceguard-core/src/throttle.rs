use std::time::{Duration, Instant};

/// Admits at most `fps` calls per second.
///
/// The first call is always admitted; afterwards a call is admitted only
/// once a full interval has elapsed since the last admitted one. Rejected
/// calls do not move the window.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_admitted: Option<Instant>,
}

impl Throttle {
    /// Build a throttle for a target rate. `0` is treated as 1 fps.
    pub fn new(fps: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / fps.max(1),
            last_admitted: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true and records the call if it may run at `now`.
    pub fn ready(&mut self, now: Instant) -> bool {
        if self.delay_until_ready(now).is_zero() {
            self.last_admitted = Some(now);
            true
        } else {
            false
        }
    }

    /// Time left before the next call would be admitted.
    pub fn delay_until_ready(&self, now: Instant) -> Duration {
        match self.last_admitted {
            None => Duration::ZERO,
            Some(last) => self.interval.saturating_sub(now.saturating_duration_since(last)),
        }
    }
}
