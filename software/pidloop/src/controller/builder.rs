//! Construction of controllers and registration of their periodic activity

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use pidloop_shared::{InputSource, OutputSink};

use super::controller_state::{ControllerState, Gains};
use super::output::OutputGate;
use super::{Inner, PidController};
use crate::PidError;
use crate::clock::{Clock, MonotonicClock};
use crate::config::PidConfig;
use crate::scheduler::{Scheduler, ThreadScheduler};

/// Period used when none is given.
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(50);

/// Called once at construction with the number of controllers created so far.
pub type UsageHook = Box<dyn FnOnce(usize) + Send>;

/// Next instance number to hand out
static NEXT_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Number of controllers successfully created in this process
static INSTANCES: AtomicUsize = AtomicUsize::new(0);

const EXPECTED_SHAPES: &str = "expected (kp, ki, kd, source, sink[, period]) \
     or (kp, ki, kd, kf, source, sink[, period])";

/// Staged construction of a [`PidController`].
///
/// Gains are given up front. A source and a sink are required;
/// everything else has a default.
pub struct PidBuilder {
    gains: Gains,
    period: Duration,
    source: Option<Box<dyn InputSource>>,
    sink: Option<Box<dyn OutputSink>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    clock: Option<Arc<dyn Clock>>,
    usage_hook: Option<UsageHook>,
    config: Option<PidConfig>,
}

impl PidBuilder {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            gains: Gains {
                p: kp,
                i: ki,
                d: kd,
                f: 0.0,
            },
            period: DEFAULT_PERIOD,
            source: None,
            sink: None,
            scheduler: None,
            clock: None,
            usage_hook: None,
            config: None,
        }
    }

    /// Start from a stored configuration, which is applied in full once built.
    pub fn from_config(cfg: &PidConfig) -> Result<Self, PidError> {
        cfg.validate()?;
        let mut builder = Self::new(cfg.kp, cfg.ki, cfg.kd)
            .feed_forward(cfg.kf)
            .period(cfg.period()?);
        builder.config = Some(cfg.clone());
        Ok(builder)
    }

    pub fn feed_forward(mut self, kf: f64) -> Self {
        self.gains.f = kf;
        self
    }

    pub fn source(mut self, source: impl InputSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn sink(mut self, sink: impl OutputSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Loop period. This affects the integral and derivative terms, which are
    /// computed in discrete time without scaling by the period.
    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Run the compute step on something other than a dedicated thread.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Measure setpoint motion with something other than the monotonic clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Report construction to an external usage tracker.
    pub fn usage_hook(mut self, hook: impl FnOnce(usize) + Send + 'static) -> Self {
        self.usage_hook = Some(Box::new(hook));
        self
    }

    /// Create the controller and register its periodic activity.
    ///
    /// The controller starts disabled.
    pub fn build(self) -> Result<PidController, PidError> {
        let (Some(mut source), Some(sink)) = (self.source, self.sink) else {
            return Err(PidError::config(format!(
                "PidController needs both a source and a sink; {EXPECTED_SHAPES}"
            )));
        };

        self.gains.check_finite()?;
        let Gains { p, i, d, f } = self.gains;
        if self.period.is_zero() {
            return Err(PidError::config(format!(
                "Period must be > 0; {EXPECTED_SHAPES}"
            )));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(ThreadScheduler::new()));

        if let Some(kind) = self.config.as_ref().and_then(|cfg| cfg.source_kind) {
            source.set_kind(kind);
        }
        let mut state = ControllerState::new(self.gains, source.kind(), clock);
        if let Some(cfg) = &self.config {
            cfg.apply_to(&mut state)?;
        }

        let index = NEXT_INDEX.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::new(Inner {
            index,
            period: self.period,
            state: Mutex::new(state),
            source: Mutex::new(Some(source)),
            output: OutputGate::new(sink),
            task: Mutex::new(None),
            mirror: Mutex::new(None),
        });

        // The scheduler only holds a weak reference so that dropping
        // the last handle frees the controller
        let weak = Arc::downgrade(&inner);
        let task = scheduler.schedule(
            &format!("pid-task-{index}"),
            self.period,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.calculate();
                }
            }),
        )?;
        *inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        let created = INSTANCES.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            "Created controller {index} with p={p} i={i} d={d} f={f}, period {:?}",
            self.period
        );
        if let Some(hook) = self.usage_hook {
            hook(created);
        }

        Ok(PidController { inner })
    }
}
