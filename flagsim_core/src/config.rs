//! Simulation configuration and validation.
//!
//! A [`SimulationConfig`] is an immutable snapshot captured at `start` time.
//! Validation rejects missing identifiers and inconsistent channel
//! parameters; the evaluation rate is clamped rather than rejected.

use crate::assigner::Group;
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lower clamp for the evaluation rate (evaluations per second).
pub const MIN_EVALS_PER_SECOND: f64 = 0.1;

/// Upper clamp for the evaluation rate (evaluations per second).
pub const MAX_EVALS_PER_SECOND: f64 = 100.0;

/// Connection parameters for the external flag platform.
///
/// The credentials are write-only: they deserialize from the start request
/// but are never serialized back out in status snapshots, and the `Debug`
/// impl redacts them so they cannot leak through logging.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// SDK credential used for evaluation and event submission
    #[serde(skip_serializing)]
    pub sdk_key: String,

    /// REST API credential used for flag/experiment lookups
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Project identifier on the platform
    pub project_key: String,

    /// Flag under test
    pub flag_key: String,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("sdk_key", &"<redacted>")
            .field("api_key", &"<redacted>")
            .field("project_key", &self.project_key)
            .field("flag_key", &self.flag_key)
            .finish()
    }
}

/// An occurrence-style metric channel (error, business conversion).
///
/// Each evaluation in a group fires the event with the group's configured
/// probability, expressed as a percentage in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateChannelConfig {
    /// A channel that is present in the request is on unless explicitly
    /// toggled off; an absent channel is off entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Event key reported to the platform when the channel fires
    #[serde(default)]
    pub event_key: String,

    /// Fire probability for the control group, percent
    #[serde(default)]
    pub control_rate: f64,

    /// Fire probability for the treatment group, percent
    #[serde(default)]
    pub treatment_rate: f64,
}

impl Default for RateChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            event_key: String::new(),
            control_rate: 0.0,
            treatment_rate: 0.0,
        }
    }
}

impl RateChannelConfig {
    /// Fire probability (percent) for the given group.
    pub fn rate(&self, group: Group) -> f64 {
        match group {
            Group::Control => self.control_rate,
            Group::Treatment => self.treatment_rate,
        }
    }
}

/// A value-style metric channel (latency).
///
/// When enabled, every evaluation draws a value uniformly from the group's
/// inclusive `[min, max]` millisecond range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeChannelConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Event key reported to the platform with the drawn value
    #[serde(default)]
    pub event_key: String,

    /// `[min, max]` milliseconds for the control group
    #[serde(default)]
    pub control_range: [u64; 2],

    /// `[min, max]` milliseconds for the treatment group
    #[serde(default)]
    pub treatment_range: [u64; 2],
}

impl Default for RangeChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            event_key: String::new(),
            control_range: [0, 0],
            treatment_range: [0, 0],
        }
    }
}

impl RangeChannelConfig {
    /// `[min, max]` range for the given group.
    pub fn range(&self, group: Group) -> [u64; 2] {
        match group {
            Group::Control => self.control_range,
            Group::Treatment => self.treatment_range,
        }
    }
}

/// Immutable simulation configuration captured at `start` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Platform connection parameters
    pub connection: ConnectionConfig,

    /// Target evaluation rate, clamped to `[0.1, 100]` per second
    pub evaluations_per_second: f64,

    /// Error-occurrence channel
    #[serde(default)]
    pub error: RateChannelConfig,

    /// Latency-value channel
    #[serde(default)]
    pub latency: RangeChannelConfig,

    /// Business-conversion channel
    #[serde(default)]
    pub business: RateChannelConfig,
}

impl SimulationConfig {
    /// Validates the configuration.
    ///
    /// Required identifiers must be non-empty, the rate must be a positive
    /// finite number, and every enabled channel must carry consistent
    /// parameters for both groups.
    pub fn validate(&self) -> Result<(), EngineError> {
        let conn = &self.connection;
        for (label, value) in [
            ("sdk_key", &conn.sdk_key),
            ("api_key", &conn.api_key),
            ("project_key", &conn.project_key),
            ("flag_key", &conn.flag_key),
        ] {
            if value.trim().is_empty() {
                return Err(EngineError::validation(format!(
                    "missing required field: {label}"
                )));
            }
        }

        if !self.evaluations_per_second.is_finite() || self.evaluations_per_second <= 0.0 {
            return Err(EngineError::validation(
                "evaluations_per_second must be a positive number",
            ));
        }

        if self.error.enabled {
            check_rate_channel("error", &self.error)?;
        }
        if self.business.enabled {
            check_rate_channel("business", &self.business)?;
        }
        if self.latency.enabled {
            check_range_channel("latency", &self.latency)?;
        }

        Ok(())
    }

    /// Evaluation rate clamped to the supported interval.
    pub fn clamped_rate(&self) -> f64 {
        self.evaluations_per_second
            .clamp(MIN_EVALS_PER_SECOND, MAX_EVALS_PER_SECOND)
    }
}

fn check_rate_channel(name: &str, channel: &RateChannelConfig) -> Result<(), EngineError> {
    if channel.event_key.trim().is_empty() {
        return Err(EngineError::validation(format!(
            "{name} channel is enabled but has no event key"
        )));
    }
    for (group, rate) in [
        ("control", channel.control_rate),
        ("treatment", channel.treatment_rate),
    ] {
        if !(0.0..=100.0).contains(&rate) {
            return Err(EngineError::validation(format!(
                "{name} {group} rate must be between 0 and 100, got {rate}"
            )));
        }
    }
    Ok(())
}

fn check_range_channel(name: &str, channel: &RangeChannelConfig) -> Result<(), EngineError> {
    if channel.event_key.trim().is_empty() {
        return Err(EngineError::validation(format!(
            "{name} channel is enabled but has no event key"
        )));
    }
    for (group, range) in [
        ("control", channel.control_range),
        ("treatment", channel.treatment_range),
    ] {
        if range[0] > range[1] {
            return Err(EngineError::validation(format!(
                "{name} {group} range must satisfy min <= max, got [{}, {}]",
                range[0], range[1]
            )));
        }
    }
    Ok(())
}

fn default_enabled() -> bool {
    true
}
