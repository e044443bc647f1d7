//! Time sources.
//!
//! Every duration in the core is computed from [`Clock::monotonic`]. The wall
//! clock is only used for timestamps that get shown to a person or sent to
//! the backend.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary, fixed origin. Never goes backwards.
    fn monotonic(&self) -> Duration;
    fn wall(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and simulations.
///
/// `advance` moves both time sources together, `jump_wall` only moves the wall
/// clock, the way a time-zone change or NTP correction would.
pub struct ManualClock {
    inner: Mutex<ManualState>,
}

struct ManualState {
    monotonic: Duration,
    wall: DateTime<Utc>,
}

impl ManualClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ManualState {
                monotonic: Duration::ZERO,
                wall,
            }),
        }
    }

    pub fn starting_now() -> Arc<Self> {
        Arc::new(Self::new(Utc::now()))
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.monotonic += by;
        if let Ok(delta) = chrono::Duration::from_std(by) {
            state.wall += delta;
        }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    pub fn jump_wall(&self, delta: chrono::Duration) {
        self.lock().wall += delta;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        self.lock().monotonic
    }

    fn wall(&self) -> DateTime<Utc> {
        self.lock().wall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_jump_leaves_monotonic_untouched() {
        let clock = ManualClock::starting_now();
        clock.advance_secs(5);
        let before = clock.monotonic();
        clock.jump_wall(chrono::Duration::hours(-3));
        assert_eq!(clock.monotonic(), before);
        clock.jump_wall(chrono::Duration::days(2));
        assert_eq!(clock.monotonic(), Duration::from_secs(5));
    }

    #[test]
    fn system_clock_is_non_decreasing() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }
}
