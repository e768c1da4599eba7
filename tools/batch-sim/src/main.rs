//! Inferbatch Sim - drive the request batcher with synthetic traffic
//!
//! Runs a workload against the in-process mock capability and prints the
//! batcher metrics as JSON, which makes it easy to see how tier settings
//! trade latency for fewer backend calls.
//!
//! # Usage
//!
//! ```bash
//! # 200 Normal requests over 20 distinct prompts
//! inferbatch-sim --requests 200 --unique 20
//!
//! # Background tier with a custom config and the drainer running
//! inferbatch-sim --config ./batcher.toml --priority batch --background
//! ```

mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use inferbatch_core::{BatcherConfig, MockCapability, Priority, RequestBatcher};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::workload::Workload;

/// Inferbatch Sim - measure batching, caching and coalescing under load
#[derive(Parser, Debug)]
#[command(name = "inferbatch-sim")]
#[command(author, version)]
#[command(about = "Drive the request batcher with a synthetic workload and report metrics")]
struct Args {
    /// Batcher configuration file (TOML); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Total submissions
    #[arg(short = 'n', long, default_value_t = 100)]
    requests: usize,

    /// Distinct prompts the submissions cycle through
    #[arg(short, long, default_value_t = 10)]
    unique: usize,

    /// Priority tier for every submission
    #[arg(short, long, default_value = "normal")]
    priority: Priority,

    /// Model identifier
    #[arg(long, default_value = "sim-model")]
    model: String,

    /// Simulated backend latency in milliseconds
    #[arg(long, default_value_t = 100)]
    latency_ms: u64,

    /// Milliseconds between consecutive submissions
    #[arg(long, default_value_t = 5)]
    arrival_ms: u64,

    /// Per-caller timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Make the first N backend calls fail
    #[arg(long, default_value_t = 0)]
    fail: u64,

    /// Run the background drainer during the workload
    #[arg(long)]
    background: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = match &args.config {
        Some(path) => BatcherConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BatcherConfig::default(),
    };

    let capability = Arc::new(MockCapability::with_latency(Duration::from_millis(args.latency_ms)));
    capability.fail_next(args.fail);
    let batcher = RequestBatcher::new(config, capability.clone())?;

    if args.background {
        batcher.start_background_processor();
    }

    let workload = Workload {
        requests: args.requests,
        unique_prompts: args.unique,
        priority: args.priority,
        model: args.model,
        arrival_interval: Duration::from_millis(args.arrival_ms),
        timeout: args.timeout_ms.map(Duration::from_millis),
    };
    tracing::info!(
        requests = workload.requests,
        unique = workload.unique_prompts,
        priority = %workload.priority,
        "Starting workload"
    );

    let summary = workload::run(&batcher, &workload).await;

    if args.background {
        batcher.stop_background_processor().await;
    }

    let report = serde_json::json!({
        "summary": summary.to_json(),
        "backend_calls": capability.call_count(),
        "peak_backend_concurrency": capability.peak_concurrency(),
        "metrics": batcher.get_metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
