//! Thread-safe PIDF controller driven by a periodic scheduler.
//!
//! A [`PidController`] is a cheap, cloneable handle. Every clone refers to the
//! same controller, so configuration may be changed from any thread while the
//! scheduler's thread runs the compute step. The controller is freed when
//! [`PidController::free`] is called or the last handle is dropped.

mod builder;
pub(crate) mod controller_state;
mod output;

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use pidloop_shared::{InputSource, OutputSink, SourceKind};

use crate::PidError;
use crate::config::PidConfig;
use crate::mirror::{ListenerId, ParamValue, Parameter, ParameterTable};
use crate::scheduler::ScheduledTask;
use crate::tolerance::Tolerance;

pub use builder::{DEFAULT_PERIOD, PidBuilder, UsageHook};
pub use controller_state::{Bounds, Gains, continuous_error};
use controller_state::ControllerState;
use output::OutputGate;

/// Handle to a running controller.
#[derive(Clone)]
pub struct PidController {
    inner: Arc<Inner>,
}

/// Subscriptions held on an attached parameter table
struct MirrorLink {
    table: Arc<dyn ParameterTable>,
    listeners: Vec<ListenerId>,
}

struct Inner {
    /// Process-wide instance number
    index: usize,
    period: Duration,

    /// Never held while the source or the sink is called
    state: Mutex<ControllerState>,
    source: Mutex<Option<Box<dyn InputSource>>>,
    output: OutputGate,

    task: Mutex<Option<Box<dyn ScheduledTask>>>,
    mirror: Mutex<Option<MirrorLink>>,
}

/// Recover the guard from a poisoned lock.
/// The guarded data is plain numeric state that stays usable after a panic.
fn lock_or_recover<'a, T>(m: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e: PoisonError<_>| {
        warn!("Controller {what} lock poisoned; recovering");
        e.into_inner()
    })
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ControllerState> {
        lock_or_recover(&self.state, "state")
    }

    fn source(&self) -> MutexGuard<'_, Option<Box<dyn InputSource>>> {
        lock_or_recover(&self.source, "source")
    }

    /// Read the input source, if still attached.
    fn sample(&self) -> Option<(SourceKind, f64)> {
        self.source()
            .as_mut()
            .map(|source| (source.kind(), source.read()))
    }

    /// One compute cycle: sample, calculate, then write.
    /// The source and the sink are each called with no state lock held.
    fn calculate(&self) {
        if !self.state().is_live() {
            return;
        }
        let Some((kind, input)) = self.sample() else {
            return;
        };

        let (generation, result) = {
            let mut state = self.state();
            // Disabled or freed while sampling
            if !state.is_live() {
                return;
            }
            let Some(result) = state.step(input, kind) else {
                return;
            };
            trace!(
                "Controller {} error {} output {result}",
                self.index, state.error
            );
            (state.next_output(), result)
        };

        self.output.deliver(generation, result);
    }

    /// Clear the enabled flag, then write a zero that supersedes
    /// any output still in flight.
    fn disable(&self) {
        let generation = {
            let mut state = self.state();
            state.enabled = false;
            state.next_output()
        };
        self.output.deliver(generation, 0.0);
    }

    fn publish(&self, key: Parameter, value: ParamValue) {
        let table = lock_or_recover(&self.mirror, "mirror")
            .as_ref()
            .map(|link| link.table.clone());
        if let Some(table) = table {
            table.publish(key, value);
        }
    }

    fn remove_listeners(&self) {
        let link = lock_or_recover(&self.mirror, "mirror").take();
        if let Some(link) = link {
            for id in link.listeners {
                link.table.unsubscribe(id);
            }
            debug!("Controller {} detached from parameter table", self.index);
        }
    }

    fn free(&self) {
        let task = lock_or_recover(&self.task, "task").take();
        let Some(mut task) = task else {
            // Already freed
            return;
        };
        task.cancel();

        self.state().source_kind = None;
        *self.source() = None;
        self.output.detach();
        self.remove_listeners();
        info!("Freed controller {}", self.index);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.free();
    }
}

impl PidController {
    /// Set up a controller without feed-forward, running every `period`
    /// on a dedicated thread.
    pub fn new(
        kp: f64,
        ki: f64,
        kd: f64,
        source: impl InputSource + 'static,
        sink: impl OutputSink + 'static,
        period: Duration,
    ) -> Result<Self, PidError> {
        Self::builder(kp, ki, kd)
            .source(source)
            .sink(sink)
            .period(period)
            .build()
    }

    /// Set up a controller with a feed-forward gain, running every `period`
    /// on a dedicated thread.
    pub fn with_feed_forward(
        kp: f64,
        ki: f64,
        kd: f64,
        kf: f64,
        source: impl InputSource + 'static,
        sink: impl OutputSink + 'static,
        period: Duration,
    ) -> Result<Self, PidError> {
        Self::builder(kp, ki, kd)
            .feed_forward(kf)
            .source(source)
            .sink(sink)
            .period(period)
            .build()
    }

    /// Start building a controller with the given gains.
    pub fn builder(kp: f64, ki: f64, kd: f64) -> PidBuilder {
        PidBuilder::new(kp, ki, kd)
    }

    /// Build a controller from a stored configuration.
    pub fn from_config(
        cfg: &PidConfig,
        source: impl InputSource + 'static,
        sink: impl OutputSink + 'static,
    ) -> Result<Self, PidError> {
        PidBuilder::from_config(cfg)?.source(source).sink(sink).build()
    }

    /// Run one compute cycle now.
    ///
    /// This is what the scheduler calls every period. Does nothing while the
    /// controller is disabled or after it has been freed.
    pub fn calculate(&self) {
        self.inner.calculate();
    }

    /// Stop the periodic activity, detach the input and output,
    /// and drop any parameter table subscriptions.
    ///
    /// The controller must not be used afterward. Repeated calls do nothing.
    pub fn free(&self) {
        self.inner.free();
    }

    /// Process-wide instance number of this controller.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Period at which the compute step is scheduled.
    pub fn period(&self) -> Duration {
        self.inner.period
    }

    //
    // Gains

    /// Set all gains at once. Non-finite gains are rejected and nothing changes.
    pub fn set_pid(&self, p: f64, i: f64, d: f64, f: f64) -> Result<(), PidError> {
        let gains = Gains { p, i, d, f };
        gains.check_finite()?;
        self.inner.state().gains = gains;
        debug!(
            "Controller {} gains set to p={p} i={i} d={d} f={f}",
            self.inner.index
        );

        self.inner.publish(Parameter::P, ParamValue::Number(p));
        self.inner.publish(Parameter::I, ParamValue::Number(i));
        self.inner.publish(Parameter::D, ParamValue::Number(d));
        self.inner.publish(Parameter::F, ParamValue::Number(f));
        Ok(())
    }

    pub fn gains(&self) -> Gains {
        self.inner.state().gains
    }

    pub fn p(&self) -> f64 {
        self.inner.state().gains.p
    }

    pub fn i(&self) -> f64 {
        self.inner.state().gains.i
    }

    pub fn d(&self) -> f64 {
        self.inner.state().gains.d
    }

    pub fn f(&self) -> f64 {
        self.inner.state().gains.f
    }

    /// Latest clamped output.
    pub fn get(&self) -> f64 {
        self.inner.state().result
    }

    //
    // Bounds

    /// Treat the input range as wrapping around, so that the error is
    /// always taken the short way around.
    pub fn set_continuous(&self, continuous: bool) {
        self.inner.state().bounds.continuous = continuous;
    }

    pub fn is_continuous(&self) -> bool {
        self.inner.state().bounds.continuous
    }

    /// Set the expected input limits. The setpoint is re-clamped into the new range.
    pub fn set_input_range(&self, min: f64, max: f64) -> Result<(), PidError> {
        let setpoint = self.inner.state().set_input_range(min, max)?;
        debug!(
            "Controller {} input range set to [{min}, {max}]",
            self.inner.index
        );
        self.inner
            .publish(Parameter::Setpoint, ParamValue::Number(setpoint));
        Ok(())
    }

    /// Set the limits of the written output.
    pub fn set_output_range(&self, min: f64, max: f64) -> Result<(), PidError> {
        self.inner.state().set_output_range(min, max)?;
        debug!(
            "Controller {} output range set to [{min}, {max}]",
            self.inner.index
        );
        Ok(())
    }

    pub fn input_range(&self) -> (f64, f64) {
        let b = self.inner.state().bounds;
        (b.input_min, b.input_max)
    }

    pub fn output_range(&self) -> (f64, f64) {
        let b = self.inner.state().bounds;
        (b.output_min, b.output_max)
    }

    pub fn bounds(&self) -> Bounds {
        self.inner.state().bounds
    }

    //
    // Setpoint and error

    /// Set the target. Clears the error history and the integral.
    pub fn set_setpoint(&self, setpoint: f64) {
        let setpoint = self.inner.state().apply_setpoint(setpoint);
        self.inner
            .publish(Parameter::Setpoint, ParamValue::Number(setpoint));
    }

    pub fn setpoint(&self) -> f64 {
        self.inner.state().setpoint
    }

    /// Rate of setpoint change since the feed-forward term was last evaluated.
    pub fn delta_setpoint(&self) -> f64 {
        self.inner.state().delta_setpoint()
    }

    /// Evaluate the feed-forward term.
    ///
    /// For displacement inputs this advances the stored previous setpoint and
    /// restarts the setpoint timer, so calling it between cycles changes what
    /// the next cycle computes. Returns 0 once the controller has been freed.
    pub fn calculate_feed_forward(&self) -> f64 {
        let mut state = self.inner.state();
        let kind = state.source_kind;
        match kind {
            Some(kind) => state.calculate_feed_forward(kind),
            None => 0.0,
        }
    }

    /// Current difference of the input from the setpoint, read live.
    /// Once freed, the last computed error is returned instead.
    ///
    /// Must not be called from the controller's own input source.
    pub fn error(&self) -> f64 {
        let input = self.inner.sample();
        let state = self.inner.state();
        match input {
            Some((_, input)) => state.continuous_error(state.setpoint - input),
            None => state.error,
        }
    }

    //
    // Input kind

    /// Select which kind of quantity the input source reports.
    ///
    /// Must not be called from the controller's own input source.
    pub fn set_source_kind(&self, kind: SourceKind) {
        let mut source = self.inner.source();
        if let Some(source) = source.as_mut() {
            source.set_kind(kind);
            // Updated under the source lock so the two cannot disagree
            let mut state = self.inner.state();
            if state.source_kind.is_some() {
                state.source_kind = Some(source.kind());
            }
        }
    }

    /// Kind of quantity the input source reports, if still attached.
    pub fn source_kind(&self) -> Option<SourceKind> {
        self.inner.state().source_kind
    }

    //
    // Tolerance

    /// Consider the controller on target when the average error
    /// magnitude is below `value`, in input units.
    pub fn set_absolute_tolerance(&self, value: f64) {
        self.inner.state().tolerance = Some(Tolerance::Absolute(value));
    }

    /// Consider the controller on target when the average error magnitude is
    /// below `percent` of the input range. An input of 15.0 is 15 percent.
    pub fn set_percent_tolerance(&self, percent: f64) {
        self.inner.state().tolerance = Some(Tolerance::Percentage(percent));
    }

    pub fn tolerance(&self) -> Option<Tolerance> {
        self.inner.state().tolerance
    }

    /// Set the number of recent errors averaged for [`PidController::on_target`].
    ///
    /// Averaging helps with noisy sensors, but the controller will not report
    /// on target for at least `len` cycles after a setpoint change.
    pub fn set_tolerance_buffer(&self, len: NonZeroUsize) {
        self.inner.state().history.resize(len);
    }

    /// Average of the recent errors, or 0 if there are none yet.
    pub fn avg_error(&self) -> f64 {
        self.inner.state().history.average().unwrap_or(0.0)
    }

    /// Whether any errors have been collected since the last setpoint change.
    pub fn is_avg_error_valid(&self) -> bool {
        !self.inner.state().history.is_empty()
    }

    /// Whether the average error is within the configured tolerance.
    ///
    /// Fails with [`PidError::Usage`] if no tolerance has been set.
    pub fn on_target(&self) -> Result<bool, PidError> {
        self.inner.state().on_target()
    }

    //
    // Enable / disable

    /// Begin running the control loop.
    pub fn enable(&self) {
        self.inner.state().enabled = true;
        info!("Enabled controller {}", self.inner.index);
        self.inner.publish(Parameter::Enabled, ParamValue::Flag(true));
    }

    /// Stop running the control loop, then write a zero output.
    ///
    /// The flag is cleared first, so no compute cycle starts after this call.
    /// A cycle that was already under way may still finish, but its output
    /// is dropped if the zero has been written by then, and is followed by
    /// the zero otherwise. The zero is always the last value written.
    pub fn disable(&self) {
        self.inner.disable();
        info!("Disabled controller {}", self.inner.index);
        self.inner
            .publish(Parameter::Enabled, ParamValue::Flag(false));
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state().enabled
    }

    /// Disable, then clear the previous error, the integral, and the last output.
    /// The error history is kept.
    pub fn reset(&self) {
        self.disable();
        self.inner.state().reset_loop();
        debug!("Reset controller {}", self.inner.index);
    }

    /// Entering live tuning stops the loop so that parameters can be edited safely.
    pub fn start_live_tuning(&self) {
        self.disable();
    }

    /// Leaving live tuning does not restart the loop.
    pub fn stop_live_tuning(&self) {}

    //
    // Configuration

    /// Snapshot of the current tunables.
    pub fn config(&self) -> PidConfig {
        let state = self.inner.state();
        PidConfig::snapshot(
            state.gains,
            state.bounds,
            state.setpoint,
            state.tolerance,
            state.history.capacity(),
            state.source_kind,
            self.inner.period,
        )
    }

    /// Apply a stored configuration to the running controller.
    ///
    /// The configuration is validated in full first, so an invalid one leaves
    /// the controller untouched. The period of a running controller is fixed
    /// at construction and is not changed.
    pub fn apply_config(&self, cfg: &PidConfig) -> Result<(), PidError> {
        cfg.validate()?;

        if let Some(kind) = cfg.source_kind {
            self.set_source_kind(kind);
        }
        let (gains, setpoint) = {
            let mut state = self.inner.state();
            cfg.apply_to(&mut state)?;
            (state.gains, state.setpoint)
        };
        debug!("Applied configuration to controller {}", self.inner.index);

        self.inner.publish(Parameter::P, ParamValue::Number(gains.p));
        self.inner.publish(Parameter::I, ParamValue::Number(gains.i));
        self.inner.publish(Parameter::D, ParamValue::Number(gains.d));
        self.inner.publish(Parameter::F, ParamValue::Number(gains.f));
        self.inner
            .publish(Parameter::Setpoint, ParamValue::Number(setpoint));
        Ok(())
    }

    //
    // Parameter table mirroring

    /// Mirror gains, setpoint, and enabled state to `table` and apply changes
    /// pushed from it. Any previously attached table is detached first.
    /// Passing `None` only detaches.
    pub fn init_table(&self, table: Option<Arc<dyn ParameterTable>>) {
        self.inner.remove_listeners();
        let Some(table) = table else {
            return;
        };

        let (gains, setpoint, enabled) = {
            let state = self.inner.state();
            (state.gains, state.setpoint, state.enabled)
        };
        table.publish(Parameter::P, ParamValue::Number(gains.p));
        table.publish(Parameter::I, ParamValue::Number(gains.i));
        table.publish(Parameter::D, ParamValue::Number(gains.d));
        table.publish(Parameter::F, ParamValue::Number(gains.f));
        table.publish(Parameter::Setpoint, ParamValue::Number(setpoint));
        table.publish(Parameter::Enabled, ParamValue::Flag(enabled));

        let listeners = Parameter::ALL
            .into_iter()
            .map(|key| {
                let weak = Arc::downgrade(&self.inner);
                table.subscribe(key, Arc::new(move |value| on_table_change(&weak, key, value)))
            })
            .collect();

        *lock_or_recover(&self.inner.mirror, "mirror") = Some(MirrorLink { table, listeners });
        info!("Controller {} attached to parameter table", self.inner.index);
    }

    /// Detach from the parameter table, if any.
    pub fn remove_listeners(&self) {
        self.inner.remove_listeners();
    }
}

/// Apply a change pushed from the parameter table.
fn on_table_change(weak: &Weak<Inner>, key: Parameter, value: ParamValue) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let controller = PidController { inner };

    match (key, value) {
        (Parameter::P | Parameter::I | Parameter::D | Parameter::F, ParamValue::Number(x))
            if !x.is_finite() =>
        {
            warn!(
                "Controller {} ignored non-finite table value {x} for `{key}`",
                controller.inner.index
            )
        }
        (Parameter::P, ParamValue::Number(x)) => controller.inner.state().gains.p = x,
        (Parameter::I, ParamValue::Number(x)) => controller.inner.state().gains.i = x,
        (Parameter::D, ParamValue::Number(x)) => controller.inner.state().gains.d = x,
        (Parameter::F, ParamValue::Number(x)) => controller.inner.state().gains.f = x,
        (Parameter::Setpoint, ParamValue::Number(x)) => {
            if controller.setpoint() != x {
                controller.set_setpoint(x);
            }
        }
        (Parameter::Enabled, ParamValue::Flag(enabled)) => {
            if controller.is_enabled() != enabled {
                if enabled {
                    controller.enable();
                } else {
                    controller.disable();
                }
            }
        }
        (key, value) => warn!(
            "Controller {} ignored mistyped table value {value:?} for `{key}`",
            controller.inner.index
        ),
    }
}
