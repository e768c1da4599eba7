//! Synthetic submission workload

use std::time::Duration;

use futures::future::join_all;
use inferbatch_core::{BatcherError, Priority, PromptSpec, RequestBatcher, SubmitOptions};
use tokio::time::Instant;

/// Shape of the simulated traffic
#[derive(Debug, Clone)]
pub struct Workload {
    /// Total submissions
    pub requests: usize,
    /// Distinct prompts the submissions cycle through
    pub unique_prompts: usize,
    /// Tier every submission uses
    pub priority: Priority,
    /// Model identifier sent with every prompt
    pub model: String,
    /// Gap between consecutive submissions
    pub arrival_interval: Duration,
    /// Per-caller timeout
    pub timeout: Option<Duration>,
}

/// Outcome counts of a run
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Submissions that returned a response
    pub succeeded: usize,
    /// Submissions that failed for any reason other than a timeout
    pub failed: usize,
    /// Submissions whose caller timeout fired
    pub timed_out: usize,
    /// Successful responses served from cache
    pub from_cache: usize,
    /// Wall time of the whole run
    pub elapsed: Duration,
}

impl RunSummary {
    /// Summary as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "succeeded": self.succeeded,
            "failed": self.failed,
            "timed_out": self.timed_out,
            "from_cache": self.from_cache,
            "elapsed_ms": self.elapsed.as_millis() as u64,
        })
    }
}

/// Submit the workload and wait for every caller
pub async fn run(batcher: &RequestBatcher, workload: &Workload) -> RunSummary {
    let unique = workload.unique_prompts.max(1);
    let options = match workload.timeout {
        Some(timeout) => SubmitOptions::new().with_timeout(timeout),
        None => SubmitOptions::new(),
    };
    let start = Instant::now();

    let tasks = (0..workload.requests).map(|i| {
        let batcher = batcher.clone();
        let prompt = format!("lead {} price check", i % unique);
        let spec = PromptSpec::new(prompt, workload.model.clone());
        let delay = workload.arrival_interval * i as u32;
        let priority = workload.priority;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            batcher.submit_with(spec, priority, options).await
        })
    });

    let mut summary = RunSummary::default();
    for joined in join_all(tasks).await {
        match joined {
            Ok(Ok(response)) => {
                summary.succeeded += 1;
                if response.from_cache {
                    summary.from_cache += 1;
                }
            }
            Ok(Err(BatcherError::Timeout(_))) => summary.timed_out += 1,
            Ok(Err(e)) => {
                tracing::debug!("Submission failed: {}", e);
                summary.failed += 1;
            }
            Err(e) => {
                tracing::error!("Submission task panicked: {}", e);
                summary.failed += 1;
            }
        }
    }
    summary.elapsed = start.elapsed();
    summary
}
