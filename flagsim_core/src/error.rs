//! Error types for the simulation engine.

use thiserror::Error;

/// Errors that can occur while configuring or running a simulation.
///
/// Only the first two variants are fatal, and only to `start`: everything
/// that happens per tick is absorbed into the session's `last_error` and log
/// stream so a running simulation survives transient upstream failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad configuration - fatal to `start`, never retried
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Cannot determine the baseline variation - fatal to `start`
    #[error("Cannot resolve baseline variation: {0}")]
    Resolution(String),

    /// Outcome synthesis failed - logged, tick skipped, loop continues
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Upstream platform call failed (network, 4xx, 5xx) - retried with
    /// bounded backoff, then recorded as the session's `last_error`
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Live-channel send failed - the connection is dropped and
    /// deregistered, never surfaced to the simulation run itself
    #[error("Transport error: {0}")]
    Transport(String),
}

impl EngineError {
    /// Creates a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Creates a resolution error.
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Creates an upstream error.
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}
