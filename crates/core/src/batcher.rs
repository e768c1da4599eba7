//! Request batcher façade
//!
//! [`RequestBatcher`] is the only entry point application code calls. A
//! submission is answered, in order of preference, from the response cache,
//! from an identical execution already in flight, or by a new execution
//! scheduled according to its priority tier:
//!
//! - `Critical` runs immediately as a singleton.
//! - `High`/`Normal` wait up to the tier's `max_wait` for a batch to fill,
//!   then re-check the cache and drain whatever has accumulated.
//! - `Low`/`Batch` wait for the background drainer, falling back to a
//!   singleton execution at the tier deadline.
//!
//! A tier whose queue reaches `max_batch_size` is drained at once.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use inferbatch_core::{BatcherConfig, MockCapability, Priority, PromptSpec, RequestBatcher};
//!
//! let batcher = RequestBatcher::new(BatcherConfig::default(), Arc::new(MockCapability::new()))?;
//! batcher.start_background_processor();
//!
//! let response = batcher
//!     .submit(PromptSpec::new("price check for lead 42", "model-a"), Priority::High)
//!     .await?;
//! println!("{}", response.content);
//!
//! batcher.stop_background_processor().await;
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::cache::{CacheStats, ResponseCache};
use crate::capability::InferenceCapability;
use crate::config::BatcherConfig;
use crate::error::{BatcherError, Result};
use crate::executor::{BackgroundDrainer, BatchExecutor};
use crate::fingerprint::Fingerprint;
use crate::in_flight::{Claim, Completion, InFlightRegistry};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::queue::{PriorityQueueSet, QueueDepth, QueuedRequest};
use crate::request::{Priority, PromptSpec, Request, RequestId, Response};

/// Per-call options for [`RequestBatcher::submit_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Give up waiting after this long
    ///
    /// Only this caller stops waiting; the execution it may share with
    /// other callers carries on.
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    /// Options with no timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the caller timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Inner {
    config: BatcherConfig,
    cache: Arc<ResponseCache>,
    in_flight: Arc<InFlightRegistry>,
    queues: Arc<PriorityQueueSet>,
    executor: Arc<BatchExecutor>,
    metrics: Arc<MetricsAggregator>,
    drainer: Mutex<Option<BackgroundDrainer>>,
}

/// Batches, coalesces and caches outbound inference calls
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<Inner>,
}

impl RequestBatcher {
    /// Create a batcher around an inference capability
    pub fn new(config: BatcherConfig, capability: Arc<dyn InferenceCapability>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(ResponseCache::new(
            config.cache_capacity,
            config.eviction_fraction,
        ));
        let metrics = Arc::new(MetricsAggregator::new());
        let mut executor = BatchExecutor::new(
            capability,
            Arc::clone(&cache),
            Arc::clone(&metrics),
            config.cache_ttl(),
        );
        if let Some(limit) = config.max_concurrent_executions {
            executor = executor.with_max_concurrency(limit);
        }

        info!(
            cache_capacity = config.cache_capacity,
            cache_ttl_ms = config.cache_ttl_ms,
            max_concurrent_executions = ?config.max_concurrent_executions,
            "Request batcher created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                queues: Arc::new(PriorityQueueSet::new(&config.tiers)),
                cache,
                in_flight: Arc::new(InFlightRegistry::new()),
                executor: Arc::new(executor),
                metrics,
                drainer: Mutex::new(None),
                config,
            }),
        })
    }

    /// Submit a request and wait for its response
    pub async fn submit(&self, spec: PromptSpec, priority: Priority) -> Result<Response> {
        self.submit_with(spec, priority, SubmitOptions::default()).await
    }

    /// Submit a request with per-call options
    #[instrument(skip_all, fields(priority = %priority))]
    pub async fn submit_with(
        &self,
        spec: PromptSpec,
        priority: Priority,
        options: SubmitOptions,
    ) -> Result<Response> {
        let request = Arc::new(Request::new(spec, priority));
        self.inner.metrics.record_submission();

        let pending = Arc::clone(&self.inner).dispatch(request);
        match options.timeout {
            None => pending.await,
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    self.inner.metrics.record_timeout();
                    debug!(timeout_ms = limit.as_millis() as u64, "Caller stopped waiting");
                    Err(BatcherError::Timeout(limit))
                }
            },
        }
    }

    /// Metrics, cache statistics and queue depths as one JSON document
    pub fn get_metrics(&self) -> serde_json::Value {
        let mut value = self.inner.metrics.snapshot().to_json();
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "cache".into(),
                serde_json::to_value(self.cache_stats()).unwrap_or_default(),
            );
            object.insert(
                "queues".into(),
                serde_json::to_value(self.queue_depth()).unwrap_or_default(),
            );
            object.insert("in_flight".into(), self.inner.in_flight.len().into());
        }
        value
    }

    /// Point-in-time copy of the counters
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Zero all counters
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Start the periodic background drain
    ///
    /// Must be called from within a tokio runtime. Returns `false` if the
    /// drainer was already running.
    pub fn start_background_processor(&self) -> bool {
        let mut slot = self.inner.drainer.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(BackgroundDrainer::start(
            Arc::clone(&self.inner.queues),
            Arc::clone(&self.inner.executor),
            Arc::clone(&self.inner.cache),
            self.inner.config.drain_interval(),
        ));
        true
    }

    /// Stop the background drain, letting an in-progress sweep finish
    ///
    /// Returns `false` if it was not running.
    pub async fn stop_background_processor(&self) -> bool {
        let drainer = self.inner.drainer.lock().take();
        match drainer {
            Some(drainer) => {
                drainer.stop().await;
                true
            }
            None => false,
        }
    }

    /// Whether the background drain is running
    pub fn is_background_processor_running(&self) -> bool {
        self.inner
            .drainer
            .lock()
            .as_ref()
            .is_some_and(BackgroundDrainer::is_running)
    }

    /// Pending requests per tier
    pub fn queue_depth(&self) -> QueueDepth {
        self.inner.queues.depth()
    }

    /// Cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Fingerprints currently executing
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Drop one cached response
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.cache.invalidate(fingerprint)
    }

    /// Drop every cached response
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Active configuration
    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }
}

impl Inner {
    async fn dispatch(self: Arc<Self>, request: Arc<Request>) -> Result<Response> {
        let completion = if request.skip_cache {
            InFlightRegistry::detached(&request.fingerprint)
        } else {
            if let Some(cached) = self.cache.get(&request.fingerprint) {
                self.metrics.record_cache_hit();
                return Ok(cached.personalize(request.id, true));
            }

            match self.in_flight.try_claim(&request.fingerprint) {
                Claim::Joined(handle) => {
                    self.metrics.record_deduplicated();
                    debug!(
                        fingerprint = %request.fingerprint.short(),
                        "Joined in-flight execution"
                    );
                    let shared = handle.wait().await?;
                    return Ok(shared.personalize(request.id, shared.from_cache));
                }
                Claim::Owner(completion) => {
                    // An execution may have finished between the lookup and
                    // the claim.
                    if let Some(cached) = self.cache.get(&request.fingerprint) {
                        return Ok(self.answer_from_cache(completion, &cached, request.id));
                    }
                    completion
                }
            }
        };

        let handle = completion.handle();
        self.schedule(Arc::clone(&request), completion)?;
        let shared = handle.wait().await?;
        Ok(shared.personalize(request.id, shared.from_cache))
    }

    fn schedule(self: &Arc<Self>, request: Arc<Request>, completion: Completion) -> Result<()> {
        let priority = request.priority;
        if priority == Priority::Critical {
            let executor = Arc::clone(&self.executor);
            let entry = QueuedRequest::new(request, completion);
            tokio::spawn(async move {
                executor.execute_batch(vec![entry], None).await;
            });
            return Ok(());
        }

        let policy = *self.queues.policy(priority);
        let id = request.id;
        let depth = self.queues.enqueue(QueuedRequest::new(request, completion))?;

        if depth >= policy.max_batch_size && self.flush(priority, policy.max_batch_size, id) {
            return Ok(());
        }
        // A racing enqueue may have pushed this request past the drained
        // prefix, so the deadline is armed unless the flush took it. The
        // timer holds a weak reference so it never keeps the batcher alive.
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(policy.max_wait()).await;
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.on_deadline(priority, id).await;
            }
        });
        Ok(())
    }

    /// Resolve a claimed handle with a cached response
    ///
    /// Waiters that joined the handle see `from_cache = true` as well.
    fn answer_from_cache(
        &self,
        completion: Completion,
        cached: &Response,
        request_id: RequestId,
    ) -> Response {
        self.metrics.record_cache_hit();
        let shared = cached.personalize(cached.request_id, true);
        completion.complete(Ok(Arc::new(shared)));
        cached.personalize(request_id, true)
    }

    /// Drain a full tier; returns whether the batch included `id`
    fn flush(&self, priority: Priority, max_batch_size: usize, id: RequestId) -> bool {
        let batch = self.queues.drain(priority, max_batch_size);
        if batch.is_empty() {
            return false;
        }
        let took_own = batch.iter().any(|entry| entry.id() == id);
        debug!(%priority, size = batch.len(), "Tier full, draining");
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            executor.execute_batch(batch, Some(Uuid::new_v4())).await;
        });
        took_own
    }

    async fn on_deadline(&self, priority: Priority, id: RequestId) {
        let Some(entry) = self.queues.remove(priority, id) else {
            return;
        };

        // Another path (e.g. a skip-cache call) may have produced the answer
        if !entry.request.skip_cache {
            if let Some(cached) = self.cache.get(&entry.request.fingerprint) {
                self.answer_from_cache(entry.completion, &cached, id);
                return;
            }
        }

        if priority.is_background() {
            self.metrics.record_fallback();
            debug!(%priority, request_id = %id, "Deadline reached, executing alone");
            self.executor.execute_batch(vec![entry], None).await;
            return;
        }

        let max_batch_size = self.queues.policy(priority).max_batch_size;
        let mut batch = Vec::with_capacity(max_batch_size);
        batch.push(entry);
        batch.extend(self.queues.drain(priority, max_batch_size - 1));
        debug!(%priority, size = batch.len(), "Wait elapsed, draining partial batch");
        self.executor.execute_batch(batch, Some(Uuid::new_v4())).await;
    }
}
