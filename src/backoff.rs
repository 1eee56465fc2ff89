//! Bounded exponential reconnect backoff
//!
//! After a disconnect the controller hands out delays of
//! `current + jitter`, doubling `current` each time, until `current` passes
//! the configured maximum. The next request after that is answered with
//! [`GiveUp`] and the controller stays exhausted.
//!
//! ```text
//! Idle ──on_disconnect──▶ BackingOff ──next_delay (current > max)──▶ Exhausted
//!  ▲                          │
//!  └────on_connect_success────┘
//! ```
//!
//! Author: Moroya Sakamoto

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Backoff tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay handed out first after a disconnect
    pub initial: Duration,
    /// Largest base delay that is still attempted
    pub max: Duration,
    /// Upper bound (exclusive) of the random jitter added to every delay
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(32),
            jitter: Duration::from_secs(1),
        }
    }
}

/// Backoff exceeded its maximum delay; reconnecting is abandoned
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("exceeded maximum backoff of {max:?} after {attempts} reconnect delays, giving up")]
pub struct GiveUp {
    /// Configured maximum delay
    pub max: Duration,
    /// Delays handed out before giving up
    pub attempts: u32,
}

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPhase {
    /// Connected, or never disconnected
    Idle,
    /// Waiting to reconnect
    BackingOff,
    /// Give-up was signaled
    Exhausted,
}

/// Snapshot of the backoff bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    /// Base delay of the next request
    pub current_delay: Duration,
    /// Configured maximum
    pub max_delay: Duration,
    /// Whether a reconnect is pending
    pub active: bool,
}

/// Source of the random component added to each delay
pub trait JitterSource {
    /// Return a duration in `[0, span)`
    fn sample(&mut self, span: Duration) -> Duration;
}

/// Uniform jitter at millisecond granularity
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&mut self, span: Duration) -> Duration {
        let span_ms = u64::try_from(span.as_millis()).unwrap_or(u64::MAX);
        if span_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..span_ms))
    }
}

/// Constant jitter, clamped below the span
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub Duration);

impl JitterSource for FixedJitter {
    fn sample(&mut self, span: Duration) -> Duration {
        if span.is_zero() {
            Duration::ZERO
        } else {
            self.0.min(span - Duration::from_nanos(1))
        }
    }
}

/// Reconnect delay state machine
pub struct BackoffController {
    config: BackoffConfig,
    current: Duration,
    phase: BackoffPhase,
    attempts: u32,
    jitter: Box<dyn JitterSource>,
}

impl BackoffController {
    /// Controller with random jitter
    pub fn new(config: BackoffConfig) -> Self {
        Self::with_jitter(config, RandomJitter)
    }

    /// Controller with a custom jitter source
    pub fn with_jitter(config: BackoffConfig, jitter: impl JitterSource + 'static) -> Self {
        Self {
            current: config.initial,
            config,
            phase: BackoffPhase::Idle,
            attempts: 0,
            jitter: Box::new(jitter),
        }
    }

    /// A connection was established: back to idle with the initial delay
    pub fn on_connect_success(&mut self) {
        if self.phase != BackoffPhase::Idle {
            debug!("connection restored, backoff reset");
        }
        self.phase = BackoffPhase::Idle;
        self.current = self.config.initial;
        self.attempts = 0;
    }

    /// The connection was lost or could not be established
    pub fn on_disconnect(&mut self) {
        if self.phase == BackoffPhase::Idle {
            self.phase = BackoffPhase::BackingOff;
        }
    }

    /// Delay to wait before the next reconnect attempt
    ///
    /// Returns `Duration::ZERO` when idle. Once the base delay has grown past
    /// the maximum the controller is exhausted and every call returns
    /// [`GiveUp`].
    pub fn next_delay(&mut self) -> Result<Duration, GiveUp> {
        match self.phase {
            BackoffPhase::Idle => Ok(Duration::ZERO),
            BackoffPhase::Exhausted => Err(self.give_up()),
            BackoffPhase::BackingOff => {
                if self.current > self.config.max {
                    self.phase = BackoffPhase::Exhausted;
                    warn!(
                        max = ?self.config.max,
                        attempts = self.attempts,
                        "exceeded maximum backoff time, giving up"
                    );
                    return Err(self.give_up());
                }

                let delay = self.current + self.jitter.sample(self.config.jitter);
                self.current = self.current.saturating_mul(2);
                self.attempts += 1;
                debug!(?delay, attempt = self.attempts, "backing off before reconnect");
                Ok(delay)
            }
        }
    }

    pub fn phase(&self) -> BackoffPhase {
        self.phase
    }

    /// True while a reconnect is pending
    pub fn is_backing_off(&self) -> bool {
        self.phase == BackoffPhase::BackingOff
    }

    pub fn state(&self) -> BackoffState {
        BackoffState {
            current_delay: self.current,
            max_delay: self.config.max,
            active: self.phase != BackoffPhase::Idle,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    fn give_up(&self) -> GiveUp {
        GiveUp {
            max: self.config.max,
            attempts: self.attempts,
        }
    }
}

impl std::fmt::Debug for BackoffController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffController")
            .field("config", &self.config)
            .field("current", &self.current)
            .field("phase", &self.phase)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}
