//! Capability interfaces shared between the pidloop controller and the
//! sensor and actuator drivers that feed it.
//!
//! Drivers implement [`InputSource`] and [`OutputSink`] here without taking a
//! dependency on the controller itself. Bare closures can be adapted with
//! [`FnSource`] and [`FnSink`].

pub mod sink;
pub mod source;

pub use sink::{FnSink, OutputSink};
pub use source::{FnSource, InputSource, SourceKind};
