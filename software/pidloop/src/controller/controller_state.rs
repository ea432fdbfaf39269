//! Mutable controller state and the per-cycle calculation.
//!
//! Nothing here is synchronized. The controller keeps a single
//! `ControllerState` behind its state lock and calls into it from there.
//! The input source is sampled by the caller, outside that lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use pidloop_shared::SourceKind;

use crate::PidError;
use crate::clock::{Clock, Stopwatch};
use crate::tolerance::{ErrorHistory, Tolerance};

/// Proportional, integral, derivative and feed-forward coefficients.
/// Any finite value is legal, including negative values.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct Gains {
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub f: f64,
}

impl Gains {
    pub fn check_finite(&self) -> Result<(), PidError> {
        let Gains { p, i, d, f } = *self;
        if [p, i, d, f].iter().all(|g| g.is_finite()) {
            Ok(())
        } else {
            Err(PidError::config(format!(
                "Gains must be finite, got p={p} i={i} d={d} f={f}"
            )))
        }
    }
}

/// Input and output limits.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    /// Setpoints are limited to `[input_min, input_max]` when `input_max > input_min`
    pub input_min: f64,
    pub input_max: f64,
    pub output_min: f64,
    pub output_max: f64,
    /// Whether `input_min` and `input_max` are the same point, as on an absolute encoder
    pub continuous: bool,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            input_min: 0.0,
            input_max: 0.0,
            output_min: -1.0,
            output_max: 1.0,
            continuous: false,
        }
    }
}

/// Fail unless `min <= max`. NaN on either side fails too.
pub(crate) fn check_range(what: &str, min: f64, max: f64) -> Result<(), PidError> {
    if min <= max {
        Ok(())
    } else {
        Err(PidError::config(format!(
            "Lower {what} bound {min} is not <= upper bound {max}"
        )))
    }
}

/// Wrap an error onto the shorter path around a continuous input range.
///
/// Returns `error` unchanged when `continuous` is false or when the error
/// is already no more than half the range.
pub fn continuous_error(error: f64, continuous: bool, input_min: f64, input_max: f64) -> f64 {
    let span = input_max - input_min;
    if continuous && error.abs() > span / 2.0 {
        if error > 0.0 {
            return error - span;
        } else {
            return error + span;
        }
    }
    error
}

/// Limit `value` to the interval spanned by `a` and `b`, in either order.
/// Never panics, unlike `f64::clamp`.
fn clamp(value: f64, a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    value.max(lo).min(hi)
}

pub(crate) struct ControllerState {
    pub gains: Gains,
    pub bounds: Bounds,

    // Setpoint tracking
    pub setpoint: f64,
    pub prev_setpoint: f64,
    setpoint_timer: Stopwatch,

    // Loop state
    pub error: f64,
    pub prev_error: f64,
    pub total_error: f64,
    pub result: f64,
    pub enabled: bool,

    // On-target detection
    pub history: ErrorHistory,
    pub tolerance: Option<Tolerance>,

    /// Kind last reported by the input source; `None` once it is detached
    pub source_kind: Option<SourceKind>,

    /// Generation of the most recent value handed to the output
    output_gen: u64,
}

impl ControllerState {
    pub fn new(gains: Gains, kind: SourceKind, clock: Arc<dyn Clock>) -> Self {
        Self {
            gains,
            bounds: Bounds::default(),

            setpoint: 0.0,
            prev_setpoint: 0.0,
            setpoint_timer: Stopwatch::start(clock),

            error: 0.0,
            prev_error: 0.0,
            total_error: 0.0,
            result: 0.0,
            enabled: false,

            history: ErrorHistory::default(),
            tolerance: None,

            source_kind: Some(kind),
            output_gen: 0,
        }
    }

    /// Whether the loop should run: enabled and not yet freed.
    pub fn is_live(&self) -> bool {
        self.enabled && self.source_kind.is_some()
    }

    /// Number the next value sent to the output. Later numbers supersede earlier ones.
    pub fn next_output(&mut self) -> u64 {
        self.output_gen += 1;
        self.output_gen
    }

    /// Set the input range and re-clamp the setpoint into it.
    /// Returns the resulting setpoint.
    pub fn set_input_range(&mut self, min: f64, max: f64) -> Result<f64, PidError> {
        check_range("input", min, max)?;
        self.bounds.input_min = min;
        self.bounds.input_max = max;
        Ok(self.apply_setpoint(self.setpoint))
    }

    pub fn set_output_range(&mut self, min: f64, max: f64) -> Result<(), PidError> {
        check_range("output", min, max)?;
        self.bounds.output_min = min;
        self.bounds.output_max = max;
        Ok(())
    }

    /// Store a new setpoint, clamped into a non-degenerate input range,
    /// and drop the integral and averaging state that belonged to the old one.
    pub fn apply_setpoint(&mut self, setpoint: f64) -> f64 {
        let Bounds {
            input_min,
            input_max,
            ..
        } = self.bounds;
        self.setpoint = if input_max > input_min {
            clamp(setpoint, input_min, input_max)
        } else {
            setpoint
        };

        self.history.clear();
        self.total_error = 0.0;

        self.setpoint
    }

    pub fn continuous_error(&self, error: f64) -> f64 {
        continuous_error(
            error,
            self.bounds.continuous,
            self.bounds.input_min,
            self.bounds.input_max,
        )
    }

    /// Rate of setpoint change since the last feed-forward evaluation.
    /// Zero elapsed time yields 0.
    pub fn delta_setpoint(&self) -> f64 {
        let t = self.setpoint_timer.elapsed_s();
        if t > 0.0 {
            (self.setpoint - self.prev_setpoint) / t
        } else {
            0.0
        }
    }

    /// Velocity feed-forward term.
    ///
    /// For displacement inputs this consumes the setpoint motion: the previous
    /// setpoint and the setpoint timer are advanced, so it must be evaluated
    /// exactly once per cycle.
    pub fn calculate_feed_forward(&mut self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Rate => self.gains.f * self.setpoint,
            SourceKind::Displacement => {
                let ff = self.gains.f * self.delta_setpoint();
                self.prev_setpoint = self.setpoint;
                self.setpoint_timer.reset();
                ff
            }
        }
    }

    /// Run one calculation cycle on a sampled `input` of the given kind.
    ///
    /// Returns the clamped output, or `None` if the source has been detached
    /// since it was sampled.
    pub fn step(&mut self, input: f64, kind: SourceKind) -> Option<f64> {
        self.source_kind.as_ref()?;
        self.source_kind = Some(kind);

        self.error = self.continuous_error(self.setpoint - input);
        let Gains { p, i, d, .. } = self.gains;
        let Bounds {
            output_min,
            output_max,
            ..
        } = self.bounds;

        let result = match kind {
            SourceKind::Rate => {
                // Integrate into the proportional term
                self.total_error += self.error;
                if p != 0.0 {
                    self.total_error =
                        clamp(self.total_error, output_min / p, output_max / p);
                }
                p * self.total_error + d * self.error + self.calculate_feed_forward(kind)
            }
            SourceKind::Displacement => {
                if i != 0.0 {
                    self.total_error = clamp(
                        self.total_error + self.error,
                        output_min / i,
                        output_max / i,
                    );
                }
                p * self.error
                    + i * self.total_error
                    + d * (self.error - self.prev_error)
                    + self.calculate_feed_forward(kind)
            }
        };

        self.prev_error = self.error;
        self.result = clamp(result, output_min, output_max);
        self.history.push(self.error);

        Some(self.result)
    }

    /// Zero the loop memory. The error history is kept.
    pub fn reset_loop(&mut self) {
        self.prev_error = 0.0;
        self.total_error = 0.0;
        self.result = 0.0;
    }

    pub fn on_target(&self) -> Result<bool, PidError> {
        let tolerance = self.tolerance.ok_or_else(|| {
            PidError::usage("No tolerance value set when using PidController::on_target()")
        })?;

        let input_range = self.bounds.input_max - self.bounds.input_min;
        Ok(self
            .history
            .average()
            .is_some_and(|avg| tolerance.on_target(avg, input_range)))
    }
}
