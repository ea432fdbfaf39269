//! Time sources for measuring setpoint motion

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since some fixed, clock-specific epoch.
    fn now(&self) -> Duration;
}

/// Wall-clock monotonic time, measured from when the clock was created.
#[derive(Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Clock that only moves when told to.
///
/// Used for simulation and for deterministic tests of the
/// setpoint-rate feed-forward term.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward.
    pub fn advance(&self, dt: Duration) {
        self.nanos
            .fetch_add(dt.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, t: Duration) {
        self.nanos.store(t.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Stopwatch over a shared clock.
pub(crate) struct Stopwatch {
    clock: Arc<dyn Clock>,
    started: Duration,
}

impl Stopwatch {
    /// Start timing immediately.
    pub(crate) fn start(clock: Arc<dyn Clock>) -> Self {
        let started = clock.now();
        Self { clock, started }
    }

    /// Seconds since the last start or reset.
    pub(crate) fn elapsed_s(&self) -> f64 {
        self.clock.now().saturating_sub(self.started).as_secs_f64()
    }

    pub(crate) fn reset(&mut self) {
        self.started = self.clock.now();
    }
}
