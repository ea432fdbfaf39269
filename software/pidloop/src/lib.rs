//! Periodic, thread-safe PIDF control with continuous inputs,
//! integral anti-windup, tolerance-based on-target detection,
//! and live parameter tuning through an external table.

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod logging;
pub mod mirror;
pub mod scheduler;
pub mod tolerance;

pub use config::PidConfig;
pub use controller::{PidBuilder, PidController};
pub use error::PidError;
pub use tolerance::Tolerance;

pub use pidloop_shared::{FnSink, FnSource, InputSource, OutputSink, SourceKind};
