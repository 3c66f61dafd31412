//! Flagsim service edge.
//!
//! Hosts the simulation engine behind an HTTP API (start / stop / status /
//! logs) and a live push channel that streams status and log frames to
//! subscribed dashboard connections.

mod http;
mod live;

use clap::Parser;
use flagsim_core::{RestFlagPlatform, SessionStore, SimulationController, StatusPublisher};
use flagsim_env::TokioContext;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Flagsim guarded-rollout traffic simulator
#[derive(Parser, Debug)]
#[command(name = "flagsim-server")]
#[command(about = "Simulate guarded-rollout traffic against a feature-flag platform", long_about = None)]
struct Args {
    /// HTTP API listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Live push channel listen address
    #[arg(long, default_value = "127.0.0.1:8091")]
    live_listen: String,

    /// Base URL of the external flag platform
    #[arg(long, default_value = "https://app.launchdarkly.com")]
    platform_url: String,

    /// Retained log lines per session
    #[arg(long, default_value = "500")]
    log_cap: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the verbosity flag
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let platform = match RestFlagPlatform::new(&args.platform_url) {
        Ok(platform) => Arc::new(platform),
        Err(err) => {
            error!(%err, "failed to construct platform client");
            std::process::exit(1);
        }
    };

    let controller = Arc::new(SimulationController::new(
        TokioContext::shared(),
        Arc::new(SessionStore::with_log_cap(args.log_cap)),
        Arc::new(StatusPublisher::new()),
        platform,
    ));

    info!(listen = %args.listen, live = %args.live_listen, platform = %args.platform_url, "flagsim-server starting");

    let live_controller = Arc::clone(&controller);
    let live_listen = args.live_listen.clone();
    tokio::spawn(async move {
        if let Err(err) = live::serve(&live_listen, live_controller).await {
            error!(%err, "live channel listener failed");
        }
    });

    tokio::select! {
        result = http::serve(&args.listen, controller) => {
            if let Err(err) = result {
                error!(%err, "http listener failed");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
