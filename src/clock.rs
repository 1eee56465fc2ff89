//! Time source for the session and telemetry loop
//!
//! Everything that waits or measures elapsed time goes through [`Clock`], so
//! token refresh and reconnect backoff can be driven deterministically in
//! tests with [`ManualClock`].
//!
//! Author: Moroya Sakamoto

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Monotonic time, wall time and blocking sleep
pub trait Clock {
    /// Monotonic instant used for elapsed-time checks
    fn now(&self) -> Instant;
    /// Wall-clock time used for message timestamps
    fn wall_time(&self) -> SystemTime;
    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// The real clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to
///
/// `sleep` advances the clock instantly and records the requested duration.
/// Clones share the same timeline, so a test can keep a handle while the
/// session owns another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    origin: Instant,
    wall_origin: SystemTime,
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a clock starting at the current instant
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Create a clock whose wall time starts at `wall_origin`
    pub fn starting_at(wall_origin: SystemTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                origin: Instant::now(),
                wall_origin,
                elapsed: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Move time forward without recording a sleep
    pub fn advance(&self, by: Duration) {
        self.state().elapsed += by;
    }

    /// Total time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        self.state().elapsed
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state().sleeps.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.state();
        state.origin + state.elapsed
    }

    fn wall_time(&self) -> SystemTime {
        let state = self.state();
        state.wall_origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state();
        state.elapsed += duration;
        state.sleeps.push(duration);
    }
}
