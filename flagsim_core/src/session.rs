//! Session & aggregation store.
//!
//! Process-wide state keyed by session identifier. Each entry carries the
//! cumulative counters for one simulation run plus a bounded log ring. All
//! mutations for a given session go through that session's mutex, which
//! gives the single-writer-per-session discipline the tick loop relies on;
//! concurrent sessions are fully independent.

use crate::assigner::Group;
use crate::config::SimulationConfig;
use crate::synth::EvaluationOutcome;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// Default cap on retained log entries per session.
pub const DEFAULT_LOG_CAP: usize = 500;

/// Running `{sum, count, avg}` aggregate for one metric in one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricStats {
    pub sum: f64,
    pub count: u64,
    pub avg: f64,
}

impl MetricStats {
    fn record(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.avg = self.sum / self.count as f64;
    }
}

/// Per-group aggregates.
///
/// Occurrence channels (error, business) record a 0/1 sample per evaluation
/// while enabled, so `sum` is the fired count and `avg` the observed rate.
/// The latency channel records each drawn value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStats {
    /// Evaluations classified into this group
    pub evaluations: u64,

    /// Evaluations that contributed at least one metric event
    pub in_experiment: u64,

    pub error: MetricStats,
    pub latency: MetricStats,
    pub business: MetricStats,
}

/// One human-readable log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Epoch milliseconds
    pub timestamp: u64,

    /// `HH:MM:SS.mmm` rendering of `timestamp` (UTC)
    pub formatted_time: String,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
}

impl LogEntry {
    fn new(timestamp: u64, message: String, user_key: Option<String>) -> Self {
        Self {
            timestamp,
            formatted_time: format_time(timestamp),
            message,
            user_key,
        }
    }
}

fn format_time(ts_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms as i64)
        .map(|dt| dt.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_default()
}

/// Per-group stats keyed the way status consumers expect.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub control: GroupStats,
    pub treatment: GroupStats,
}

/// Immutable view of one session, pushed to live subscribers and returned
/// from status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub running: bool,
    pub events_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    pub stats: StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub total_logs_generated: u64,
    /// Config echo; credentials are stripped by its serializer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<SimulationConfig>,
}

/// One page of retained log entries, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    /// Total lines ever generated, including evicted ones
    pub total_count: u64,
    pub has_more: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    config: Option<SimulationConfig>,
    running: bool,
    events_sent: u64,
    first_event_time: Option<u64>,
    end_time: Option<u64>,
    control: GroupStats,
    treatment: GroupStats,
    last_error: Option<String>,
    logs: VecDeque<LogEntry>,
    total_logs_generated: u64,
}

impl SessionState {
    fn push_log(&mut self, cap: usize, entry: LogEntry) {
        self.total_logs_generated += 1;
        self.logs.push_back(entry);
        while self.logs.len() > cap {
            self.logs.pop_front();
        }
    }

    fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: session_id.to_string(),
            running: self.running,
            events_sent: self.events_sent,
            first_event_time: self.first_event_time,
            end_time: self.end_time,
            stats: StatsSnapshot {
                control: self.control.clone(),
                treatment: self.treatment.clone(),
            },
            last_error: self.last_error.clone(),
            total_logs_generated: self.total_logs_generated,
            config: self.config.clone(),
        }
    }
}

/// Process-wide session map.
///
/// Entries are created lazily (on `reset` or the first status query) and
/// never deleted automatically; reaping abandoned sessions is an operator
/// concern.
pub struct SessionStore {
    log_cap: usize,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_log_cap(DEFAULT_LOG_CAP)
    }

    pub fn with_log_cap(log_cap: usize) -> Self {
        Self {
            log_cap,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        if let Some(state) = self.sessions.read().unwrap().get(session_id) {
            return Arc::clone(state);
        }
        let mut map = self.sessions.write().unwrap();
        Arc::clone(
            map.entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SessionState::default()))),
        )
    }

    /// Re-arms a session for a fresh run: zeroes every counter, clears the
    /// log ring and timestamps, installs the new config, and marks the
    /// session running.
    pub fn reset(&self, session_id: &str, config: SimulationConfig, _now_ms: u64) {
        let entry = self.entry(session_id);
        let mut state = entry.lock().unwrap();
        *state = SessionState {
            config: Some(config),
            running: true,
            ..SessionState::default()
        };
    }

    /// Marks a session stopped and freezes its end time. Idempotent:
    /// returns `false` if the session was not running.
    pub fn mark_stopped(&self, session_id: &str, now_ms: u64) -> bool {
        let entry = self.entry(session_id);
        let mut state = entry.lock().unwrap();
        if !state.running {
            return false;
        }
        state.running = false;
        state.end_time = Some(now_ms);
        true
    }

    /// Whether the session is currently running.
    pub fn running(&self, session_id: &str) -> bool {
        self.entry(session_id).lock().unwrap().running
    }

    /// Folds one evaluation outcome into the session's aggregates.
    pub fn record_evaluation(
        &self,
        session_id: &str,
        outcome: &EvaluationOutcome,
        now_ms: u64,
    ) {
        let entry = self.entry(session_id);
        let mut state = entry.lock().unwrap();

        let (error_enabled, business_enabled) = state
            .config
            .as_ref()
            .map(|c| (c.error.enabled, c.business.enabled))
            .unwrap_or((false, false));

        state.events_sent += 1;
        if state.first_event_time.is_none() {
            state.first_event_time = Some(now_ms);
        }

        let group = match outcome.group {
            Group::Control => &mut state.control,
            Group::Treatment => &mut state.treatment,
        };
        group.evaluations += 1;
        if outcome.produced_events() {
            group.in_experiment += 1;
        }
        if error_enabled {
            group.error.record(if outcome.error_fired { 1.0 } else { 0.0 });
        }
        if let Some(latency) = outcome.latency_ms {
            group.latency.record(latency as f64);
        }
        if business_enabled {
            group
                .business
                .record(if outcome.business_fired { 1.0 } else { 0.0 });
        }
    }

    /// Records an error: sets `last_error` and appends a log line.
    pub fn record_error(&self, session_id: &str, message: &str, now_ms: u64) -> LogEntry {
        let entry = self.entry(session_id);
        let mut state = entry.lock().unwrap();
        state.last_error = Some(message.to_string());
        let log = LogEntry::new(now_ms, message.to_string(), None);
        state.push_log(self.log_cap, log.clone());
        log
    }

    /// Appends a log line to the bounded ring.
    pub fn push_log(
        &self,
        session_id: &str,
        message: String,
        user_key: Option<String>,
        now_ms: u64,
    ) -> LogEntry {
        let entry = self.entry(session_id);
        let mut state = entry.lock().unwrap();
        let log = LogEntry::new(now_ms, message, user_key);
        state.push_log(self.log_cap, log.clone());
        log
    }

    /// Immutable snapshot of the session (created lazily if unknown).
    pub fn status(&self, session_id: &str) -> SessionSnapshot {
        self.entry(session_id).lock().unwrap().snapshot(session_id)
    }

    /// One page of retained log entries, oldest first.
    pub fn logs(&self, session_id: &str, limit: usize, skip: usize) -> LogPage {
        let entry = self.entry(session_id);
        let state = entry.lock().unwrap();
        let retained = state.logs.len();
        let logs: Vec<LogEntry> = state.logs.iter().skip(skip).take(limit).cloned().collect();
        let has_more = skip + logs.len() < retained;
        LogPage {
            logs,
            total_count: state.total_logs_generated,
            has_more,
        }
    }
}
