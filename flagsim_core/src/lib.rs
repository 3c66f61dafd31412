//! Flagsim Simulation Engine
//!
//! This crate drives a demo/test workflow against a third-party feature-flag
//! platform: it evaluates a flag at a configurable rate, synthesizes metric
//! events (error, latency, conversion) split between control and treatment
//! populations, aggregates running per-group statistics, and pushes live
//! status to subscribed clients.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    SimulationController                      │
//! │   start / stop / status / logs                               │
//! │       │                                                      │
//! │  ┌────▼──────────┐   tick    ┌──────────────────────────┐    │
//! │  │ RateScheduler │──────────►│ assign → synthesize      │    │
//! │  └───────────────┘           │ → record → dispatch      │    │
//! │                              └────┬───────────┬─────────┘    │
//! │                                   │           │              │
//! │                        ┌──────────▼───┐  ┌────▼───────────┐  │
//! │                        │ SessionStore │  │ FlagPlatform   │  │
//! │                        └──────┬───────┘  │ (upstream)     │  │
//! │                               │          └────────────────┘  │
//! │                     ┌─────────▼────────┐                     │
//! │                     │ StatusPublisher  │──► live subscribers │
//! │                     └──────────────────┘                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All time, task spawning, and randomness go through
//! [`flagsim_env::RunnerContext`], so the whole engine runs deterministically
//! under a seeded virtual clock in tests.

pub mod assigner;
pub mod config;
pub mod controller;
pub mod error;
pub mod publisher;
pub mod scheduler;
pub mod session;
pub mod synth;
pub mod upstream;
pub mod users;

pub use assigner::{BaselineRule, Group};
pub use config::{ConnectionConfig, RangeChannelConfig, RateChannelConfig, SimulationConfig};
pub use controller::SimulationController;
pub use error::EngineError;
pub use publisher::{SessionSubscription, StatusPublisher};
pub use scheduler::{RateScheduler, TickHandler};
pub use session::{LogEntry, LogPage, SessionSnapshot, SessionStore};
pub use synth::EvaluationOutcome;
pub use upstream::{FlagPlatform, MetricEvent, RestFlagPlatform, UpstreamOutcome};
pub use users::SyntheticUser;
