//! On-target detection from a rolling average of recent errors

use std::collections::VecDeque;
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Rule deciding whether the controller is close enough to its setpoint.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum Tolerance {
    /// Average error magnitude must be below this value, in input units.
    Absolute(f64),

    /// Average error magnitude must be below this percentage of the input range.
    /// An input of 15.0 is 15 percent.
    Percentage(f64),
}

impl Tolerance {
    /// Check an average error against the rule.
    ///
    /// `input_range` is `max - min` of the controller's input range and is
    /// only used by [`Tolerance::Percentage`].
    pub fn on_target(&self, avg_error: f64, input_range: f64) -> bool {
        match *self {
            Tolerance::Absolute(threshold) => avg_error.abs() < threshold,
            Tolerance::Percentage(percent) => avg_error.abs() < percent / 100.0 * input_range,
        }
    }
}

/// Fixed-capacity window of the most recent error samples.
#[derive(Clone, Debug)]
pub struct ErrorHistory {
    buf: VecDeque<f64>,
    capacity: NonZeroUsize,
}

impl Default for ErrorHistory {
    fn default() -> Self {
        Self::new(NonZeroUsize::MIN)
    }
}

impl ErrorHistory {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.get()),
            capacity,
        }
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append the newest sample, evicting the oldest if full.
    pub fn push(&mut self, error: f64) {
        if self.buf.len() == self.capacity.get() {
            self.buf.pop_front();
        }
        self.buf.push_back(error);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Change the capacity, keeping only the newest samples that fit.
    pub fn resize(&mut self, capacity: NonZeroUsize) {
        let excess = self.buf.len().saturating_sub(capacity.get());
        self.buf.drain(..excess);
        self.capacity = capacity;
    }

    /// Mean of the stored samples, or `None` if there are none.
    pub fn average(&self) -> Option<f64> {
        if self.buf.is_empty() {
            return None;
        }
        Some(self.buf.iter().sum::<f64>() / self.buf.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn absolute_tolerance() {
        let tol = Tolerance::Absolute(0.5);
        assert!(tol.on_target(0.3, 0.0));
        assert!(tol.on_target(-0.3, 0.0));
        assert!(!tol.on_target(0.7, 0.0));
        assert!(!tol.on_target(0.5, 0.0));
    }

    #[test]
    fn percentage_tolerance_scales_with_input_range() {
        let tol = Tolerance::Percentage(10.0);
        assert!(tol.on_target(35.0, 360.0));
        assert!(!tol.on_target(37.0, 360.0));
        // Degenerate range never reports on target
        assert!(!tol.on_target(0.0, 0.0));
    }

    #[test]
    fn default_history_holds_one_sample() {
        let mut h = ErrorHistory::default();
        assert_eq!(h.average(), None);

        h.push(1.0);
        h.push(3.0);
        assert_eq!(h.len(), 1);
        assert_eq!(h.average(), Some(3.0));
    }

    #[test]
    fn rolling_average_evicts_oldest() {
        let mut h = ErrorHistory::new(nz(3));
        for e in [1.0, 2.0, 3.0, 4.0] {
            h.push(e);
        }
        assert_eq!(h.average(), Some(3.0));
    }

    #[test]
    fn shrinking_keeps_newest() {
        let mut h = ErrorHistory::new(nz(4));
        for e in [1.0, 2.0, 3.0, 4.0] {
            h.push(e);
        }

        h.resize(nz(2));
        assert_eq!(h.len(), 2);
        assert_eq!(h.average(), Some(3.5));

        // Growing does not bring anything back
        h.resize(nz(5));
        assert_eq!(h.len(), 2);
        h.push(5.0);
        assert_eq!(h.average(), Some(4.0));
    }

    #[test]
    fn tolerance_serializes_as_tagged_variant() {
        let s = serde_json::to_string(&Tolerance::Absolute(0.5)).unwrap();
        assert_eq!(s, r#"{"Absolute":0.5}"#);
        let t: Tolerance = serde_json::from_str(r#"{"Percentage":5.0}"#).unwrap();
        assert_eq!(t, Tolerance::Percentage(5.0));
    }
}
