//! Core environment context trait for the Flagsim engine.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that the simulation engine can
/// run in both production (tokio) and deterministic test environments.
///
/// # Implementations
///
/// - **Production**: [`crate::TokioContext`] - wraps `tokio::time`, OS entropy
/// - **Simulation**: [`crate::SimContext`] - virtual clock, seeded ChaCha8 RNG
///
/// # Determinism
///
/// Everything that would normally introduce non-determinism (time, random
/// draws) is routed through this trait so tests can pin it down with a seed.
#[async_trait]
pub trait RunnerContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used by the rate scheduler for drift-free deadline arithmetic.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time for event timestamps and log lines.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`.
    /// In simulation: advances the virtual clock.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives a random source from a stream identifier.
    ///
    /// In production the stream is seeded from OS entropy; in simulation the
    /// master seed is combined with `stream` so each consumer gets a unique
    /// but reproducible sequence.
    fn derive_rng(&self, stream: u64) -> ChaCha8Rng;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
