//! Stored controller configuration

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pidloop_shared::SourceKind;

use crate::PidError;
use crate::controller::controller_state::{ControllerState, check_range};
use crate::controller::{Bounds, Gains};
use crate::tolerance::Tolerance;

/// Every tunable of a controller, in a form that can be saved and reloaded.
///
/// Fields missing from a stored file take their defaults.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub kf: f64,

    /// Loop period in seconds
    pub period_s: f64,

    /// Expected input limits. `None` leaves the setpoint unclamped.
    pub input_range: Option<(f64, f64)>,
    pub output_range: (f64, f64),
    pub continuous: bool,
    pub setpoint: f64,

    pub tolerance: Option<Tolerance>,
    /// Number of recent errors averaged for on-target detection
    pub tolerance_buffer: NonZeroUsize,

    /// Override the kind reported by the input source
    pub source_kind: Option<SourceKind>,
}

impl Default for PidConfig {
    fn default() -> Self {
        let bounds = Bounds::default();
        Self {
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            kf: 0.0,
            period_s: 0.05,
            input_range: None,
            output_range: (bounds.output_min, bounds.output_max),
            continuous: false,
            setpoint: 0.0,
            tolerance: None,
            tolerance_buffer: NonZeroUsize::MIN,
            source_kind: None,
        }
    }
}

impl PidConfig {
    /// Capture the tunables of a running controller.
    pub(crate) fn snapshot(
        gains: Gains,
        bounds: Bounds,
        setpoint: f64,
        tolerance: Option<Tolerance>,
        tolerance_buffer: NonZeroUsize,
        source_kind: Option<SourceKind>,
        period: Duration,
    ) -> Self {
        let input_range = if bounds.input_min == 0.0 && bounds.input_max == 0.0 {
            None
        } else {
            Some((bounds.input_min, bounds.input_max))
        };

        Self {
            kp: gains.p,
            ki: gains.i,
            kd: gains.d,
            kf: gains.f,
            period_s: period.as_secs_f64(),
            input_range,
            output_range: (bounds.output_min, bounds.output_max),
            continuous: bounds.continuous,
            setpoint,
            tolerance,
            tolerance_buffer,
            source_kind,
        }
    }

    /// Loop period as a duration. Fails unless `period_s` is a positive
    /// number of seconds that a [`Duration`] can hold.
    pub fn period(&self) -> Result<Duration, PidError> {
        match Duration::try_from_secs_f64(self.period_s) {
            Ok(period) if !period.is_zero() => Ok(period),
            _ => Err(PidError::config(format!(
                "`period_s` must be a positive, representable number of seconds, got {}",
                self.period_s
            ))),
        }
    }

    /// Check every field with the same rules the controller's setters apply.
    pub fn validate(&self) -> Result<(), PidError> {
        for (name, v) in [
            ("kp", self.kp),
            ("ki", self.ki),
            ("kd", self.kd),
            ("kf", self.kf),
            ("setpoint", self.setpoint),
        ] {
            if !v.is_finite() {
                return Err(PidError::config(format!("`{name}` must be finite, got {v}")));
            }
        }

        self.period()?;

        if let Some((min, max)) = self.input_range {
            check_range("input", min, max)?;
        }
        let (min, max) = self.output_range;
        check_range("output", min, max)
    }

    /// Write every field into live controller state.
    ///
    /// `source_kind` is left to the caller, which owns the input source.
    pub(crate) fn apply_to(&self, state: &mut ControllerState) -> Result<(), PidError> {
        self.validate()?;

        let (in_min, in_max) = self.input_range.unwrap_or((0.0, 0.0));
        let (out_min, out_max) = self.output_range;
        state.set_output_range(out_min, out_max)?;
        state.set_input_range(in_min, in_max)?;
        state.bounds.continuous = self.continuous;

        state.gains = Gains {
            p: self.kp,
            i: self.ki,
            d: self.kd,
            f: self.kf,
        };
        state.apply_setpoint(self.setpoint);

        state.tolerance = self.tolerance;
        state.history.resize(self.tolerance_buffer);

        Ok(())
    }

    pub fn from_json(s: &str) -> Result<Self, PidError> {
        let cfg: Self = serde_json::from_str(s)
            .map_err(|e| PidError::config(format!("Unable to parse PidConfig: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String, PidError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PidError::config(format!("Unable to serialize PidConfig: {e}")))
    }

    /// Read and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, PidError> {
        let s = std::fs::read_to_string(path).map_err(|e| PidError::Io {
            msg: format!("Unable to read {path:?}: {e}"),
        })?;
        Self::from_json(&s)
    }

    /// Write a JSON configuration file.
    pub fn save(&self, path: &Path) -> Result<(), PidError> {
        std::fs::write(path, self.to_json()?).map_err(|e| PidError::Io {
            msg: format!("Unable to write {path:?}: {e}"),
        })
    }
}
