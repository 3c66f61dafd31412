//! Simulation context implementing RunnerContext for deterministic testing.

use crate::RunnerContext;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by deterministic time and RNG.
///
/// This implements [`RunnerContext`] using:
/// - A virtual clock that advances when tasks sleep
/// - Seeded ChaCha8 RNG streams for deterministic draws
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap();
        *time += duration.as_nanos() as u64;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl RunnerContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(*self.virtual_time_ns.lock().unwrap())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // In simulation, sleep advances virtual time and yields so that
        // concurrently spawned tasks get a chance to run.
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let _name = name.to_string();
        tokio::spawn(async move {
            future.await;
        });
    }

    fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        // Combine master seed with stream id for a reproducible sequence
        let combined_seed = self.seed.wrapping_mul(0x517cc1b727220a95) ^ stream;
        ChaCha8Rng::seed_from_u64(combined_seed)
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
