//! Metric outcome synthesis.
//!
//! For each evaluation, draws the synthetic error/latency/business outcomes
//! for the assigned group from the configured distributions. The random
//! source is injected so tests can assert exact outcomes for fixed seeds.

use crate::assigner::Group;
use crate::config::SimulationConfig;
use rand::Rng;

/// The result of one scheduler tick. Ephemeral - aggregated into the
/// session store, never persisted itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    /// Population the synthetic user landed in
    pub group: Group,

    /// Whether the error channel fired (always false when disabled)
    pub error_fired: bool,

    /// Drawn latency in milliseconds, `None` when the channel is disabled
    pub latency_ms: Option<u64>,

    /// Whether the business channel fired (always false when disabled)
    pub business_fired: bool,
}

impl EvaluationOutcome {
    /// True if this evaluation produced at least one upstream metric event.
    pub fn produced_events(&self) -> bool {
        self.error_fired || self.business_fired || self.latency_ms.is_some()
    }
}

/// Synthesizes the outcome for one evaluation.
///
/// - error/business: independent uniform draws in `[0, 100)`; the channel
///   fires if the draw lands below the group's configured rate.
/// - latency: a uniform integer in the group's inclusive `[min, max]`
///   range, produced on every evaluation while the channel is enabled.
///
/// Disabled channels are skipped entirely - no draw, no event, no
/// aggregation contribution.
pub fn synthesize<R: Rng + ?Sized>(
    group: Group,
    config: &SimulationConfig,
    rng: &mut R,
) -> EvaluationOutcome {
    let error_fired = config.error.enabled && chance(rng, config.error.rate(group));

    let latency_ms = if config.latency.enabled {
        let [min, max] = config.latency.range(group);
        Some(rng.gen_range(min..=max))
    } else {
        None
    };

    let business_fired = config.business.enabled && chance(rng, config.business.rate(group));

    EvaluationOutcome {
        group,
        error_fired,
        latency_ms,
        business_fired,
    }
}

/// One uniform draw in `[0, 100)` against a percentage rate.
fn chance<R: Rng + ?Sized>(rng: &mut R, rate_percent: f64) -> bool {
    rng.gen_range(0.0..100.0) < rate_percent
}
