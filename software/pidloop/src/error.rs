//! Error taxonomy for controller configuration and use

use thiserror::Error;

/// Errors raised synchronously to the caller.
///
/// The compute step itself never fails; degenerate arithmetic
/// is absorbed there with defined fallback values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PidError {
    /// Invalid bounds, constructor shape, period, or configuration contents.
    /// The controller state is left unchanged.
    #[error("configuration error: {msg}")]
    Configuration { msg: String },

    /// An operation was called before the controller was set up for it.
    #[error("usage error: {msg}")]
    Usage { msg: String },

    /// A configuration or log file could not be read or written.
    #[error("i/o error: {msg}")]
    Io { msg: String },

    /// The periodic activity could not be started.
    #[error("scheduler error: {msg}")]
    Scheduler { msg: String },
}

impl PidError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration { msg: msg.into() }
    }

    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Self::Usage { msg: msg.into() }
    }
}
