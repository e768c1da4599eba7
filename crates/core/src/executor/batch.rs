//! Concurrent execution of drained batches
//!
//! Every member of a batch is sent to the inference capability at the same
//! time. Results come back in request order; each member's response is
//! cached and its in-flight handle resolved as soon as that member finishes,
//! so waiters on fast members are not held back by slow ones.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::cache::ResponseCache;
use crate::capability::InferenceCapability;
use crate::error::BatcherError;
use crate::in_flight::Outcome;
use crate::metrics::MetricsAggregator;
use crate::queue::QueuedRequest;
use crate::request::{BatchId, Response};

/// Runs batches against the inference capability and fans results out
pub struct BatchExecutor {
    capability: Arc<dyn InferenceCapability>,
    cache: Arc<ResponseCache>,
    metrics: Arc<MetricsAggregator>,

    /// Limits concurrent capability calls across all batches
    semaphore: Option<Arc<Semaphore>>,

    /// TTL for responses whose request carries no override
    default_ttl: Duration,
}

impl BatchExecutor {
    /// Create an executor writing into `cache` and `metrics`
    pub fn new(
        capability: Arc<dyn InferenceCapability>,
        cache: Arc<ResponseCache>,
        metrics: Arc<MetricsAggregator>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            capability,
            cache,
            metrics,
            semaphore: None,
            default_ttl,
        }
    }

    /// Allow at most `limit` capability calls in flight at once
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.semaphore = Some(Arc::new(Semaphore::new(limit)));
        self
    }

    /// Available permits, `None` when unlimited
    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }

    /// Execute every member concurrently
    ///
    /// Returns one outcome per member, in the order given. Every member's
    /// handle is resolved before this returns, including on failure.
    pub async fn execute_batch(
        &self,
        batch: Vec<QueuedRequest>,
        batch_id: Option<BatchId>,
    ) -> Vec<Outcome> {
        if batch.is_empty() {
            return Vec::new();
        }

        let size = batch.len();
        let start = Instant::now();
        tracing::debug!(
            size,
            batch_id = ?batch_id,
            "Executing batch"
        );

        let results = join_all(
            batch
                .into_iter()
                .map(|entry| self.execute_member(entry, batch_id)),
        )
        .await;

        let wall = start.elapsed();
        let member_latency: Duration = results.iter().map(|(_, latency)| *latency).sum();
        self.metrics.record_batch(size, member_latency, wall);

        let failed = results.iter().filter(|(outcome, _)| outcome.is_err()).count();
        if failed > 0 {
            tracing::warn!(size, failed, "Batch finished with failures");
        } else {
            tracing::debug!(size, elapsed_ms = wall.as_millis() as u64, "Batch finished");
        }

        results.into_iter().map(|(outcome, _)| outcome).collect()
    }

    async fn execute_member(
        &self,
        entry: QueuedRequest,
        batch_id: Option<BatchId>,
    ) -> (Outcome, Duration) {
        let QueuedRequest {
            request,
            completion,
            ..
        } = entry;

        let _permit = match &self.semaphore {
            Some(semaphore) => match semaphore.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    let error = BatcherError::execution(anyhow::anyhow!(
                        "Failed to acquire execution permit: {}",
                        e
                    ));
                    completion.complete(Err(error.clone()));
                    return (Err(error), Duration::ZERO);
                }
            },
            None => None,
        };

        let start = Instant::now();
        let result = self.capability.execute(&request).await;
        let latency = start.elapsed();

        let outcome = match result {
            Ok(generation) => {
                self.metrics
                    .record_execution(latency, Some(generation.usage));
                let response = Arc::new(Response {
                    request_id: request.id,
                    content: generation.content,
                    model: request.model.clone(),
                    token_usage: generation.usage,
                    latency_ms: latency.as_millis() as u64,
                    from_cache: false,
                    batch_id,
                });
                // Cache before resolving so a caller arriving after the handle
                // is released finds the response.
                let ttl = request.cache_ttl.unwrap_or(self.default_ttl);
                self.cache
                    .set(request.fingerprint.clone(), Arc::clone(&response), ttl);
                Ok(response)
            }
            Err(err) => {
                self.metrics.record_execution(latency, None);
                tracing::warn!(
                    request_id = %request.id,
                    fingerprint = %request.fingerprint.short(),
                    model = %request.model,
                    "Inference call failed: {:#}",
                    err
                );
                Err(BatcherError::execution(err))
            }
        };

        completion.complete(outcome.clone());
        (outcome, latency)
    }
}
