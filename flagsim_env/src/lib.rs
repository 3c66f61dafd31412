//! Flagsim Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the Flagsim engine
//! to run in both **Production** (tokio) and **Simulation** (virtual clock)
//! environments.
//!
//! # Core Concept
//!
//! The simulation engine must be testable without real time or OS entropy:
//! - Time (`now()`, `sleep()`)
//! - Task spawning (`spawn()`)
//! - Randomness (`derive_rng()`)
//!
//! By deriving all entropy from a single 64-bit seed, any synthesized outcome
//! becomes reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use flagsim_env::{RunnerContext, TokioContext};
//!
//! async fn tick_loop<Ctx: RunnerContext>(ctx: &Ctx) {
//!     loop {
//!         ctx.sleep(Duration::from_millis(100)).await;
//!         tick();
//!     }
//! }
//! ```

mod context;
mod sim;
mod tokio_impl;

pub use context::RunnerContext;
pub use sim::SimContext;
pub use tokio_impl::TokioContext;
