//! Simulation controller - wires scheduler, assigner, synthesizer, store,
//! publisher, and upstream client together.
//!
//! State machine per session: STOPPED → (start) → RUNNING → (stop) →
//! STOPPED. Configuration and resolution failures propagate synchronously
//! to the `start` caller; everything that happens per tick is absorbed into
//! the session's `last_error` and log stream so the run keeps going.

use crate::assigner::BaselineRule;
use crate::config::SimulationConfig;
use crate::error::EngineError;
use crate::publisher::{SessionSubscription, StatusPublisher};
use crate::scheduler::{RateScheduler, TickHandler};
use crate::session::{LogPage, SessionSnapshot, SessionStore};
use crate::synth;
use crate::upstream::{send_with_retry, FlagPlatform, MetricEvent, UpstreamOutcome};
use crate::users::SyntheticUser;
use async_trait::async_trait;
use flagsim_env::RunnerContext;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;
use tracing::{info, warn};

/// The only component exposed to external callers (the configuration UI
/// and the live channel).
pub struct SimulationController<C: RunnerContext> {
    ctx: Arc<C>,
    store: Arc<SessionStore>,
    publisher: Arc<StatusPublisher>,
    platform: Arc<dyn FlagPlatform>,
    runs: Mutex<HashMap<String, Arc<RateScheduler>>>,
    run_counter: AtomicU64,
}

impl<C: RunnerContext> SimulationController<C> {
    pub fn new(
        ctx: Arc<C>,
        store: Arc<SessionStore>,
        publisher: Arc<StatusPublisher>,
        platform: Arc<dyn FlagPlatform>,
    ) -> Self {
        Self {
            ctx,
            store,
            publisher,
            platform,
            runs: Mutex::new(HashMap::new()),
            run_counter: AtomicU64::new(1),
        }
    }

    /// Starts (or restarts) a simulation run for the session.
    ///
    /// Validates the configuration and resolves the baseline variation
    /// before any session state is touched; on either failure the session
    /// stays STOPPED and no scheduler exists. A run already in progress for
    /// the session is stopped cleanly first.
    pub async fn start(
        &self,
        session_id: &str,
        config: SimulationConfig,
    ) -> Result<SessionSnapshot, EngineError> {
        config.validate()?;

        let rule = self.platform.resolve_baseline(&config.connection).await?;

        let previous = self.runs.lock().unwrap().remove(session_id);
        if let Some(previous) = previous {
            previous.stop().await;
        }

        let now = self.now_ms();
        let rate = config.clamped_rate();
        self.store.reset(session_id, config.clone(), now);

        let stream = self.run_counter.fetch_add(1, Ordering::Relaxed);
        let runner = Arc::new(TickRunner {
            session_id: session_id.to_string(),
            config,
            rule,
            rng: Mutex::new(self.ctx.derive_rng(stream)),
            ctx: Arc::clone(&self.ctx),
            store: Arc::clone(&self.store),
            publisher: Arc::clone(&self.publisher),
            platform: Arc::clone(&self.platform),
        });
        let scheduler = Arc::new(RateScheduler::start(Arc::clone(&self.ctx), rate, runner));
        self.runs
            .lock()
            .unwrap()
            .insert(session_id.to_string(), scheduler);

        let entry = self
            .store
            .push_log(session_id, "Simulation started".into(), None, now);
        self.publisher.publish_log(session_id, entry);
        let snapshot = self.store.status(session_id);
        self.publisher.publish_status(session_id, snapshot.clone());
        info!(session_id, rate, "simulation started");
        Ok(snapshot)
    }

    /// Stops the session's run. Idempotent; a no-op for sessions that are
    /// not running. Safe to call from a different task than the one that
    /// started the run.
    pub async fn stop(&self, session_id: &str) -> SessionSnapshot {
        let previous = self.runs.lock().unwrap().remove(session_id);
        if let Some(previous) = previous {
            previous.stop().await;
        }

        let now = self.now_ms();
        if self.store.mark_stopped(session_id, now) {
            let entry = self
                .store
                .push_log(session_id, "Simulation stopped".into(), None, now);
            self.publisher.publish_log(session_id, entry);
            info!(session_id, "simulation stopped");
        }
        let snapshot = self.store.status(session_id);
        self.publisher.publish_status(session_id, snapshot.clone());
        snapshot
    }

    /// Current session snapshot (lazily materialized for unknown ids).
    pub fn status(&self, session_id: &str) -> SessionSnapshot {
        self.store.status(session_id)
    }

    /// One page of the session's retained log lines.
    pub fn logs(&self, session_id: &str, limit: usize, skip: usize) -> LogPage {
        self.store.logs(session_id, limit, skip)
    }

    /// Subscribes a live connection to the session's status and log
    /// streams.
    pub fn subscribe(&self, session_id: &str) -> SessionSubscription {
        self.publisher.subscribe(session_id)
    }

    fn now_ms(&self) -> u64 {
        self.ctx
            .system_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Per-run tick callback: assign → synthesize → record → dispatch → push.
struct TickRunner<C: RunnerContext> {
    session_id: String,
    config: SimulationConfig,
    rule: BaselineRule,
    rng: Mutex<ChaCha8Rng>,
    ctx: Arc<C>,
    store: Arc<SessionStore>,
    publisher: Arc<StatusPublisher>,
    platform: Arc<dyn FlagPlatform>,
}

impl<C: RunnerContext> TickRunner<C> {
    fn now_ms(&self) -> u64 {
        self.ctx
            .system_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn log(&self, message: String, user_key: Option<String>, now_ms: u64) {
        let entry = self
            .store
            .push_log(&self.session_id, message, user_key, now_ms);
        self.publisher.publish_log(&self.session_id, entry);
    }

    /// Dispatches the tick's metric events out-of-band so a slow or hung
    /// upstream cannot stall the scheduler. Delivery failures are funneled
    /// back into the session asynchronously.
    fn dispatch_events(&self, events: Vec<MetricEvent>) {
        let ctx = Arc::clone(&self.ctx);
        let platform = Arc::clone(&self.platform);
        let store = Arc::clone(&self.store);
        let publisher = Arc::clone(&self.publisher);
        let session_id = self.session_id.clone();
        let connection = self.config.connection.clone();

        self.ctx.spawn("metric-dispatch", async move {
            for event in events {
                let outcome =
                    send_with_retry(ctx.as_ref(), platform.as_ref(), &connection, &event).await;
                if let UpstreamOutcome::Error { message, .. } = outcome {
                    let now_ms = ctx
                        .system_time()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64;
                    let entry = store.record_error(
                        &session_id,
                        &format!("Failed to deliver {}: {message}", event.event_key),
                        now_ms,
                    );
                    publisher.publish_log(&session_id, entry);
                    publisher.publish_status(&session_id, store.status(&session_id));
                }
            }
        });
    }
}

#[async_trait]
impl<C: RunnerContext> TickHandler for TickRunner<C> {
    async fn on_tick(&self, _tick: u64) -> Result<(), EngineError> {
        let user = {
            let mut rng = self.rng.lock().unwrap();
            SyntheticUser::generate(&mut *rng)
        };

        let variation = self
            .platform
            .evaluate_flag(&self.config.connection, &user)
            .await?;
        let group = self.rule.classify(&variation);

        let outcome = {
            let mut rng = self.rng.lock().unwrap();
            synth::synthesize(group, &self.config, &mut *rng)
        };

        let now = self.now_ms();
        self.store.record_evaluation(&self.session_id, &outcome, now);
        self.log(
            format!("Executing {}", group.label()),
            Some(user.key.clone()),
            now,
        );

        let events = build_events(&self.config, &outcome, &user.key);
        for event in &events {
            let message = match event.value {
                Some(value) => format!(
                    "Tracking {} with value {} for {}",
                    event.event_key,
                    value,
                    group.label()
                ),
                None => format!("Tracking {} for {}", event.event_key, group.label()),
            };
            self.log(message, Some(user.key.clone()), now);
        }
        if !events.is_empty() {
            self.dispatch_events(events);
        }

        self.publisher
            .publish_status(&self.session_id, self.store.status(&self.session_id));
        Ok(())
    }

    fn on_tick_error(&self, tick: u64, err: EngineError) {
        warn!(session_id = %self.session_id, tick, %err, "tick failed");
        let now = self.now_ms();
        let entry = self
            .store
            .record_error(&self.session_id, &err.to_string(), now);
        self.publisher.publish_log(&self.session_id, entry);
        self.publisher
            .publish_status(&self.session_id, self.store.status(&self.session_id));
    }
}

/// Materializes the upstream events for one outcome.
fn build_events(
    config: &SimulationConfig,
    outcome: &crate::synth::EvaluationOutcome,
    user_key: &str,
) -> Vec<MetricEvent> {
    let mut events = Vec::new();
    if outcome.error_fired {
        events.push(MetricEvent {
            event_key: config.error.event_key.clone(),
            user_key: user_key.to_string(),
            value: None,
        });
    }
    if let Some(latency) = outcome.latency_ms {
        events.push(MetricEvent {
            event_key: config.latency.event_key.clone(),
            user_key: user_key.to_string(),
            value: Some(latency as f64),
        });
    }
    if outcome.business_fired {
        events.push(MetricEvent {
            event_key: config.business.event_key.clone(),
            user_key: user_key.to_string(),
            value: None,
        });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use flagsim_env::SimContext;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;

    /// In-memory platform: evaluations alternate control/treatment, events
    /// are collected, baseline resolution is configurable.
    struct MockPlatform {
        eval_calls: AtomicU32,
        baseline_calls: AtomicU32,
        fail_baseline: bool,
        delivered: Mutex<Vec<MetricEvent>>,
    }

    impl MockPlatform {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                eval_calls: AtomicU32::new(0),
                baseline_calls: AtomicU32::new(0),
                fail_baseline: false,
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn failing_baseline() -> Arc<Self> {
            Arc::new(Self {
                eval_calls: AtomicU32::new(0),
                baseline_calls: AtomicU32::new(0),
                fail_baseline: true,
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FlagPlatform for MockPlatform {
        async fn evaluate_flag(
            &self,
            _connection: &crate::config::ConnectionConfig,
            _user: &SyntheticUser,
        ) -> Result<Value, EngineError> {
            let n = self.eval_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(n % 2 == 1))
        }

        async fn resolve_baseline(
            &self,
            _connection: &crate::config::ConnectionConfig,
        ) -> Result<BaselineRule, EngineError> {
            self.baseline_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_baseline {
                return Err(EngineError::resolution("experiment not found"));
            }
            Ok(BaselineRule::BooleanFalse)
        }

        async fn send_event(
            &self,
            _connection: &crate::config::ConnectionConfig,
            event: &MetricEvent,
        ) -> UpstreamOutcome {
            self.delivered.lock().unwrap().push(event.clone());
            UpstreamOutcome::Success
        }
    }

    fn controller(
        platform: Arc<MockPlatform>,
    ) -> (Arc<SimContext>, SimulationController<SimContext>) {
        let ctx = SimContext::shared(42);
        let controller = SimulationController::new(
            Arc::clone(&ctx),
            Arc::new(SessionStore::new()),
            Arc::new(StatusPublisher::new()),
            platform,
        );
        (ctx, controller)
    }

    /// Config from the scenario in the testable-properties list: 10/s,
    /// error control 0% / treatment 100%, other channels disabled.
    fn scenario_config() -> SimulationConfig {
        let mut config = test_config();
        config.error.control_rate = 0.0;
        config.error.treatment_rate = 100.0;
        config.latency.enabled = false;
        config.business.enabled = false;
        config
    }

    // All controller tests run on the current-thread runtime: spawned
    // loops advance only while the test awaits, so every observation
    // below is deterministic.

    async fn drive_until(
        controller: &SimulationController<SimContext>,
        session_id: &str,
        events: u64,
    ) {
        while controller.status(session_id).events_sent < events {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_validation_error_leaves_session_stopped() {
        let platform = MockPlatform::new();
        let (_ctx, controller) = controller(Arc::clone(&platform));

        let mut config = scenario_config();
        config.connection.api_key = String::new();
        let err = controller.start("s1", config).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // no scheduler was created and resolution was never attempted
        assert!(controller.runs.lock().unwrap().is_empty());
        assert_eq!(platform.baseline_calls.load(Ordering::SeqCst), 0);
        assert!(!controller.status("s1").running);
    }

    #[tokio::test]
    async fn test_resolution_failure_leaves_session_stopped() {
        let platform = MockPlatform::failing_baseline();
        let (_ctx, controller) = controller(platform);

        let err = controller.start("s1", scenario_config()).await.unwrap_err();
        assert!(matches!(err, EngineError::Resolution(_)));
        assert!(controller.runs.lock().unwrap().is_empty());
        assert!(!controller.status("s1").running);
    }

    #[tokio::test]
    async fn test_scenario_control_never_fires_treatment_always_fires() {
        let platform = MockPlatform::new();
        let (_ctx, controller) = controller(Arc::clone(&platform));

        controller.start("s1", scenario_config()).await.unwrap();
        drive_until(&controller, "s1", 40).await;
        let status = controller.stop("s1").await;

        let control = &status.stats.control;
        let treatment = &status.stats.treatment;
        assert!(control.evaluations > 0);
        assert!(treatment.evaluations > 0);
        assert_eq!(control.error.sum, 0.0);
        assert_eq!(treatment.error.sum, treatment.evaluations as f64);
        assert_eq!(
            status.events_sent,
            control.evaluations + treatment.evaluations
        );

        // every fired error reached the platform exactly once
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        let delivered = platform.delivered.lock().unwrap();
        assert_eq!(delivered.len(), treatment.error.sum as usize);
        assert!(delivered.iter().all(|e| e.event_key == "checkout-errors"));
    }

    #[tokio::test]
    async fn test_stop_freezes_counters_and_end_time() {
        let platform = MockPlatform::new();
        let (_ctx, controller) = controller(platform);

        controller.start("s1", scenario_config()).await.unwrap();
        drive_until(&controller, "s1", 10).await;
        let stopped = controller.stop("s1").await;

        assert!(!stopped.running);
        assert!(stopped.end_time.is_some());
        assert!(stopped.first_event_time.is_some());

        let frozen = stopped.events_sent;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(controller.status("s1").events_sent, frozen);

        // stop again: no-op, end time unchanged
        let again = controller.stop("s1").await;
        assert_eq!(again.end_time, stopped.end_time);
    }

    #[tokio::test]
    async fn test_restart_resets_counters() {
        let platform = MockPlatform::new();
        let (_ctx, controller) = controller(platform);

        controller.start("s1", scenario_config()).await.unwrap();
        drive_until(&controller, "s1", 15).await;
        let first_run = controller.stop("s1").await;
        assert!(first_run.events_sent >= 15);

        let restarted = controller.start("s1", scenario_config()).await.unwrap();
        assert!(restarted.running);
        assert_eq!(restarted.events_sent, 0);
        assert_eq!(restarted.first_event_time, None);
        assert_eq!(restarted.end_time, None);

        drive_until(&controller, "s1", 1).await;
        assert!(controller.status("s1").first_event_time.is_some());
        controller.stop("s1").await;
    }

    #[tokio::test]
    async fn test_restart_while_running_replaces_the_scheduler() {
        let platform = MockPlatform::new();
        let (_ctx, controller) = controller(platform);

        controller.start("s1", scenario_config()).await.unwrap();
        drive_until(&controller, "s1", 5).await;

        // second start while RUNNING: prior scheduler stops first
        controller.start("s1", scenario_config()).await.unwrap();
        assert_eq!(controller.runs.lock().unwrap().len(), 1);
        drive_until(&controller, "s1", 5).await;
        controller.stop("s1").await;
    }

    #[tokio::test]
    async fn test_reconnect_receives_snapshot_consistent_with_counters() {
        let platform = MockPlatform::new();
        let (_ctx, controller) = controller(platform);

        controller.start("s1", scenario_config()).await.unwrap();
        let sub = controller.subscribe("s1");
        drive_until(&controller, "s1", 8).await;
        drop(sub); // client goes away mid-run

        controller.stop("s1").await;

        // reconnect with the same session token: the latest snapshot is
        // immediately visible and matches the store exactly
        let sub = controller.subscribe("s1");
        let pushed = sub.status.borrow().clone().unwrap();
        assert_eq!(pushed, controller.status("s1"));
    }

    #[tokio::test]
    async fn test_sessions_run_independently() {
        let platform = MockPlatform::new();
        let (_ctx, controller) = controller(platform);

        controller.start("a", scenario_config()).await.unwrap();
        controller.start("b", scenario_config()).await.unwrap();
        drive_until(&controller, "a", 5).await;
        drive_until(&controller, "b", 5).await;

        controller.stop("a").await;
        let frozen = controller.status("a").events_sent;
        drive_until(&controller, "b", 20).await;

        assert_eq!(controller.status("a").events_sent, frozen);
        assert!(controller.status("b").events_sent >= 20);
        controller.stop("b").await;
    }

    #[tokio::test]
    async fn test_log_lines_flow_during_the_run() {
        let platform = MockPlatform::new();
        let (_ctx, controller) = controller(platform);

        controller.start("s1", scenario_config()).await.unwrap();
        drive_until(&controller, "s1", 3).await;
        controller.stop("s1").await;

        let page = controller.logs("s1", 10, 0);
        assert!(page.total_count > 0);
        assert_eq!(page.logs[0].message, "Simulation started");
        assert!(page
            .logs
            .iter()
            .any(|l| l.message.starts_with("Executing ")));
    }
}
