//! Upstream flag-platform client.
//!
//! The engine consumes three operations from the external platform:
//! evaluate a flag for a synthetic user, resolve the experiment baseline
//! for a flag, and submit a metric event. [`FlagPlatform`] is the seam the
//! controller talks through; [`RestFlagPlatform`] is the production
//! implementation. Credentials travel with each call (they are part of the
//! per-session configuration), so one client instance serves every session.
//!
//! The platform's API signals success ambiguously in places (error-shaped
//! bodies under 2xx, 409 for already-existing resources). That ambiguity is
//! decided exactly once here, at the transport boundary, into a tagged
//! [`UpstreamOutcome`] - call sites never re-interpret responses.

use crate::assigner::BaselineRule;
use crate::config::ConnectionConfig;
use crate::error::EngineError;
use crate::users::SyntheticUser;
use async_trait::async_trait;
use flagsim_env::RunnerContext;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Bound on any single upstream request.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Total attempts for one metric event (first try + retries).
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Base backoff between event retries, multiplied by the attempt number.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Result of one upstream transmission, decided at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamOutcome {
    /// 2xx - accepted
    Success,

    /// 409 - the platform already holds an equivalent resource; treated as
    /// delivered, not an error
    Conflict,

    /// Network failure or error status
    Error {
        status: Option<u16>,
        message: String,
    },
}

impl UpstreamOutcome {
    /// Whether the platform ended up holding the data.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Success | Self::Conflict)
    }

    /// Maps an HTTP status to an outcome.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            409 => Self::Conflict,
            _ => Self::Error {
                status: Some(status),
                message: format!("upstream returned status {status}"),
            },
        }
    }
}

/// One metric event to submit upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub event_key: String,
    pub user_key: String,
    /// Numeric payload for value-style metrics (latency); occurrence
    /// metrics carry no value
    pub value: Option<f64>,
}

/// Operations the engine consumes from the external flag platform.
#[async_trait]
pub trait FlagPlatform: Send + Sync + 'static {
    /// Evaluates the flag for a synthetic user, returning the variation
    /// value the user received.
    async fn evaluate_flag(
        &self,
        connection: &ConnectionConfig,
        user: &SyntheticUser,
    ) -> Result<Value, EngineError>;

    /// Determines how "control" is resolved for this flag: the boolean
    /// convention, or the experiment's marked baseline variation. Fails
    /// rather than guessing when the baseline cannot be determined.
    async fn resolve_baseline(
        &self,
        connection: &ConnectionConfig,
    ) -> Result<BaselineRule, EngineError>;

    /// Submits one metric event. Transport-level interpretation happens
    /// inside; callers see only the tagged outcome.
    async fn send_event(
        &self,
        connection: &ConnectionConfig,
        event: &MetricEvent,
    ) -> UpstreamOutcome;
}

/// Submits an event with bounded retry, backing off through the context
/// clock. Returns the final outcome; callers record undelivered events as
/// the session's `last_error`.
pub async fn send_with_retry<C: RunnerContext>(
    ctx: &C,
    platform: &dyn FlagPlatform,
    connection: &ConnectionConfig,
    event: &MetricEvent,
) -> UpstreamOutcome {
    let mut outcome = platform.send_event(connection, event).await;
    let mut attempt = 1;
    while !outcome.is_delivered() && attempt < MAX_SEND_ATTEMPTS {
        debug!(
            event_key = %event.event_key,
            attempt,
            "event not delivered, retrying"
        );
        ctx.sleep(RETRY_BACKOFF * attempt).await;
        outcome = platform.send_event(connection, event).await;
        attempt += 1;
    }
    outcome
}

/// Production platform client over the platform's REST surface.
pub struct RestFlagPlatform {
    http: reqwest::Client,
    base_url: String,
}

impl RestFlagPlatform {
    pub fn new(base_url: impl Into<String>) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .map_err(|e| EngineError::upstream(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FlagPlatform for RestFlagPlatform {
    async fn evaluate_flag(
        &self,
        connection: &ConnectionConfig,
        user: &SyntheticUser,
    ) -> Result<Value, EngineError> {
        let flag_key = &connection.flag_key;
        let url = format!("{}/sdk/eval/flags/{flag_key}", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", &connection.sdk_key)
            .json(&user.context_json())
            .send()
            .await
            .map_err(|e| EngineError::upstream(format!("evaluate {flag_key}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::upstream(format!(
                "evaluate {flag_key}: status {status}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| EngineError::upstream(format!("evaluate {flag_key}: bad body: {e}")))?;
        // evaluation endpoints wrap the variation as {"value": ...}
        Ok(body.get("value").cloned().unwrap_or(body))
    }

    async fn resolve_baseline(
        &self,
        connection: &ConnectionConfig,
    ) -> Result<BaselineRule, EngineError> {
        let flag_key = &connection.flag_key;
        let url = format!(
            "{}/api/v2/flags/{}/{flag_key}",
            self.base_url, connection.project_key
        );
        let response = self
            .http
            .get(&url)
            .header("Authorization", &connection.api_key)
            .send()
            .await
            .map_err(|e| EngineError::resolution(format!("fetch flag {flag_key}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::resolution(format!(
                "fetch flag {flag_key}: status {status}"
            )));
        }
        let flag: Value = response
            .json()
            .await
            .map_err(|e| EngineError::resolution(format!("fetch flag {flag_key}: bad body: {e}")))?;

        baseline_from_flag(&flag)
    }

    async fn send_event(
        &self,
        connection: &ConnectionConfig,
        event: &MetricEvent,
    ) -> UpstreamOutcome {
        let url = format!("{}/events/bulk", self.base_url);
        let mut payload = json!({
            "kind": "custom",
            "key": event.event_key,
            "contextKeys": { "user": event.user_key },
        });
        if let Some(value) = event.value {
            payload["metricValue"] = json!(value);
        }

        match self
            .http
            .post(&url)
            .header("Authorization", &connection.sdk_key)
            .json(&json!([payload]))
            .send()
            .await
        {
            Ok(response) => UpstreamOutcome::from_status(response.status().as_u16()),
            Err(e) => UpstreamOutcome::Error {
                status: None,
                message: e.to_string(),
            },
        }
    }
}

/// Resolves the baseline rule from a flag resource.
///
/// Boolean flags without an experiment rollout follow the boolean-false
/// convention. Flags carrying an experiment rollout must name a baseline
/// variation index; a missing or dangling index is a resolution failure,
/// never a guess.
fn baseline_from_flag(flag: &Value) -> Result<BaselineRule, EngineError> {
    let kind = flag.get("kind").and_then(Value::as_str).unwrap_or("boolean");
    let rollout = flag.pointer("/environments/production/fallthrough/rollout");

    let Some(rollout) = rollout else {
        if kind == "boolean" {
            return Ok(BaselineRule::BooleanFalse);
        }
        return Err(EngineError::resolution(format!(
            "flag kind {kind} has no experiment rollout to mark a baseline"
        )));
    };

    let baseline_idx = rollout
        .get("baselineIdx")
        .and_then(Value::as_u64)
        .ok_or_else(|| EngineError::resolution("experiment rollout has no baseline index"))?;

    let variations = flag
        .get("variations")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::resolution("flag resource has no variations"))?;

    let baseline = variations
        .get(baseline_idx as usize)
        .and_then(|v| v.get("value"))
        .cloned()
        .ok_or_else(|| {
            EngineError::resolution(format!(
                "baseline index {baseline_idx} does not match any variation"
            ))
        })?;

    Ok(BaselineRule::Experiment { baseline })
}
