//! Production implementation of RunnerContext using Tokio.

use crate::RunnerContext;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Production context backed by Tokio and OS entropy.
///
/// This is the "real" implementation used in deployments. Time comes from
/// the system clock, randomness from OS entropy.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let _name = name.to_string(); // Would be used for tracing
        tokio::spawn(async move {
            future.await;
        });
    }

    fn derive_rng(&self, _stream: u64) -> ChaCha8Rng {
        // In production, seed each stream from OS entropy
        ChaCha8Rng::from_entropy()
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_tokio_context_rng_streams_differ() {
        let ctx = TokioContext::new();
        let mut rng1 = ctx.derive_rng(1);
        let mut rng2 = ctx.derive_rng(1);

        // In production, streams should be independent (entropy-seeded)
        assert_ne!(rng1.next_u64(), rng2.next_u64());
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }
}
