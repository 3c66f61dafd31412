//! Rate scheduler - drives the evaluation loop at a configurable rate.
//!
//! Deadlines are anchored to the loop's start time (`start + n * interval`)
//! instead of chaining fixed delays, so long runs do not accumulate skew.
//! A tick that overruns its slot is followed by immediate catch-up ticks.

use crate::config::{MAX_EVALS_PER_SECOND, MIN_EVALS_PER_SECOND};
use crate::error::EngineError;
use async_trait::async_trait;
use flagsim_env::RunnerContext;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Minimum tick granularity. The interval for the maximum supported rate
/// (100/s) lands exactly on this floor.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Computes the tick interval for a requested rate, clamped and floored.
pub fn tick_interval(rate_per_second: f64) -> Duration {
    let rate = rate_per_second.clamp(MIN_EVALS_PER_SECOND, MAX_EVALS_PER_SECOND);
    Duration::from_secs_f64(1.0 / rate).max(MIN_TICK_INTERVAL)
}

/// Receives scheduler ticks.
///
/// `on_tick` errors do not stop the loop: the scheduler reports them
/// through `on_tick_error` and keeps ticking. The failed tick is not
/// retried.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self, tick: u64) -> Result<(), EngineError>;

    fn on_tick_error(&self, tick: u64, err: EngineError);
}

/// A running tick loop. Reconfiguring the rate requires stop + start.
pub struct RateScheduler {
    cancel: watch::Sender<bool>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RateScheduler {
    /// Starts ticking `handler` at the requested average rate.
    pub fn start<C: RunnerContext>(
        ctx: Arc<C>,
        rate_per_second: f64,
        handler: Arc<dyn TickHandler>,
    ) -> Self {
        let interval = tick_interval(rate_per_second);
        let (cancel, mut cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let loop_ctx = Arc::clone(&ctx);
        ctx.spawn("rate-scheduler", async move {
            let started = loop_ctx.now();
            let mut tick: u64 = 0;
            loop {
                tick += 1;
                let deadline = started + interval * (tick as u32);
                let now = loop_ctx.now();
                if deadline > now {
                    tokio::select! {
                        _ = loop_ctx.sleep(deadline - now) => {}
                        changed = cancel_rx.changed() => {
                            // sender dropped counts as cancellation
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                if *cancel_rx.borrow() {
                    break;
                }
                if let Err(err) = handler.on_tick(tick).await {
                    handler.on_tick_error(tick, err);
                }
            }
            debug!(ticks = tick, "scheduler loop exited");
            let _ = done_tx.send(());
        });

        Self {
            cancel,
            done: Mutex::new(Some(done_rx)),
        }
    }

    /// Stops the loop. No tick begins after this returns; a tick already in
    /// flight is allowed to finish and record its result. Safe to call from
    /// any task, and more than once.
    pub async fn stop(&self) {
        let _ = self.cancel.send(true);
        let done = self.done.lock().unwrap().take();
        if let Some(done) = done {
            let _ = done.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagsim_env::SimContext;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingHandler {
        ctx: Arc<SimContext>,
        ticks: AtomicU64,
        errors: AtomicU64,
        fail_every: u64,
        /// Virtual timestamp observed inside the most recent tick
        last_tick_time: Mutex<Duration>,
    }

    impl CountingHandler {
        fn new(ctx: Arc<SimContext>, fail_every: u64) -> Arc<Self> {
            Arc::new(Self {
                ctx,
                ticks: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                fail_every,
                last_tick_time: Mutex::new(Duration::ZERO),
            })
        }
    }

    #[async_trait]
    impl TickHandler for CountingHandler {
        async fn on_tick(&self, tick: u64) -> Result<(), EngineError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            *self.last_tick_time.lock().unwrap() = self.ctx.now();
            if self.fail_every != 0 && tick % self.fail_every == 0 {
                return Err(EngineError::Synthesis("injected".into()));
            }
            Ok(())
        }

        fn on_tick_error(&self, _tick: u64, _err: EngineError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_tick_interval_clamps_and_floors() {
        assert_eq!(tick_interval(10.0), Duration::from_millis(100));
        assert_eq!(tick_interval(0.01), Duration::from_secs(10)); // clamped to 0.1/s
        assert_eq!(tick_interval(100.0), MIN_TICK_INTERVAL);
        assert_eq!(tick_interval(10_000.0), MIN_TICK_INTERVAL); // clamped to 100/s
    }

    // current_thread runtime: the loop only advances while the test awaits,
    // which makes every assertion below deterministic.
    #[tokio::test]
    async fn test_ticks_track_virtual_time_without_drift() {
        let ctx = SimContext::shared(42);
        let handler = CountingHandler::new(ctx.clone(), 0);
        let scheduler = RateScheduler::start(ctx.clone(), 10.0, handler.clone());

        while handler.ticks.load(Ordering::SeqCst) < 20 {
            tokio::task::yield_now().await;
        }
        scheduler.stop().await;

        // tick n fired at exactly n * interval of virtual time: 10
        // evaluations per virtual second with no cumulative skew
        let ticks = handler.ticks.load(Ordering::SeqCst);
        let last = *handler.last_tick_time.lock().unwrap();
        assert_eq!(last, Duration::from_millis(100) * (ticks as u32));
    }

    #[tokio::test]
    async fn test_no_tick_after_stop_returns() {
        let ctx = SimContext::shared(1);
        let handler = CountingHandler::new(ctx.clone(), 0);
        let scheduler = RateScheduler::start(ctx.clone(), 50.0, handler.clone());

        while handler.ticks.load(Ordering::SeqCst) < 5 {
            tokio::task::yield_now().await;
        }
        scheduler.stop().await;
        let after_stop = handler.ticks.load(Ordering::SeqCst);

        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handler.ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let ctx = SimContext::shared(2);
        let handler = CountingHandler::new(ctx.clone(), 0);
        let scheduler = RateScheduler::start(ctx, 10.0, handler.clone());

        while handler.ticks.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        scheduler.stop().await;
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_tick_errors_do_not_kill_the_loop() {
        let ctx = SimContext::shared(3);
        let handler = CountingHandler::new(ctx.clone(), 3);
        let scheduler = RateScheduler::start(ctx, 100.0, handler.clone());

        while handler.ticks.load(Ordering::SeqCst) < 30 {
            tokio::task::yield_now().await;
        }
        scheduler.stop().await;

        let ticks = handler.ticks.load(Ordering::SeqCst);
        let errors = handler.errors.load(Ordering::SeqCst);
        assert!(ticks >= 30);
        assert_eq!(errors, ticks / 3);
    }
}
