//! Running counters for the batcher
//!
//! Counters are plain atomics; execution latency additionally feeds an HDR
//! histogram for percentiles. Ratios are derived from a snapshot, never
//! stored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use crate::request::TokenUsage;

/// Longest latency the histogram tracks precisely (1 hour in ms)
const MAX_TRACKED_LATENCY_MS: u64 = 3_600_000;

/// Point-in-time copy of the batcher counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// `submit` calls
    pub total_submissions: u64,
    /// Submissions answered from the response cache
    pub cache_hits: u64,
    /// Submissions coalesced onto another caller's execution
    pub deduplicated_requests: u64,
    /// Physical calls into the inference capability
    pub api_calls: u64,
    /// Physical calls that failed
    pub failed_executions: u64,
    /// Batches executed (including singletons)
    pub batches_executed: u64,
    /// Requests executed as part of a batch
    pub batched_requests: u64,
    /// Queued requests forced through as singletons at their deadline
    pub fallback_executions: u64,
    /// Callers whose own timeout fired
    pub timeouts: u64,
    /// Prompt tokens across successful calls
    pub input_tokens: u64,
    /// Completion tokens across successful calls
    pub output_tokens: u64,
    /// Mean requests per executed batch
    pub avg_batch_size: f64,
    /// Mean physical call latency
    pub avg_latency_ms: f64,
    /// Median physical call latency
    pub p50_latency_ms: u64,
    /// 95th percentile physical call latency
    pub p95_latency_ms: u64,
    /// 99th percentile physical call latency
    pub p99_latency_ms: u64,
    /// Sum of member latencies minus batch wall time, across batches
    pub estimated_time_saved_ms: u64,
}

impl MetricsSnapshot {
    /// Fraction of submissions served from cache
    pub fn cache_hit_rate(&self) -> f64 {
        ratio(self.cache_hits, self.total_submissions)
    }

    /// Fraction of submissions coalesced onto another execution
    pub fn dedup_rate(&self) -> f64 {
        ratio(self.deduplicated_requests, self.total_submissions)
    }

    /// Logical requests per physical call
    pub fn requests_per_api_call(&self) -> f64 {
        ratio(self.total_submissions, self.api_calls)
    }

    /// JSON document with the counters plus derived ratios
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(object) = value.as_object_mut() {
            object.insert("cache_hit_rate".into(), self.cache_hit_rate().into());
            object.insert("dedup_rate".into(), self.dedup_rate().into());
            object.insert(
                "requests_per_api_call".into(),
                self.requests_per_api_call().into(),
            );
        }
        value
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Thread-safe metrics collector shared by every batcher component
pub struct MetricsAggregator {
    total_submissions: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated_requests: AtomicU64,
    api_calls: AtomicU64,
    failed_executions: AtomicU64,
    batches_executed: AtomicU64,
    batched_requests: AtomicU64,
    fallback_executions: AtomicU64,
    timeouts: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
    time_saved_ms: AtomicU64,
    latency: Mutex<Option<Histogram<u64>>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self {
            total_submissions: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            deduplicated_requests: AtomicU64::new(0),
            api_calls: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            batches_executed: AtomicU64::new(0),
            batched_requests: AtomicU64::new(0),
            fallback_executions: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            time_saved_ms: AtomicU64::new(0),
            latency: Mutex::new(Histogram::new_with_bounds(1, MAX_TRACKED_LATENCY_MS, 3).ok()),
        }
    }

    /// Count one `submit` call
    pub fn record_submission(&self) {
        self.total_submissions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a submission served from cache
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a submission coalesced onto another execution
    pub fn record_deduplicated(&self) {
        self.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a caller whose own timeout fired
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a deadline singleton execution
    pub fn record_fallback(&self) {
        self.fallback_executions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one physical call; `usage` is `None` when it failed
    pub fn record_execution(&self, latency: Duration, usage: Option<TokenUsage>) {
        let latency_ms = latency.as_millis() as u64;
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        match usage {
            Some(usage) => {
                self.input_tokens
                    .fetch_add(usage.input_tokens, Ordering::Relaxed);
                self.output_tokens
                    .fetch_add(usage.output_tokens, Ordering::Relaxed);
            }
            None => {
                self.failed_executions.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(histogram) = self.latency.lock().as_mut() {
            histogram.saturating_record(latency_ms.max(1));
        }
    }

    /// Record a finished batch of `size` members
    ///
    /// `member_latency` is the sum of the members' call latencies, `wall`
    /// the time the whole batch took; the difference is what concurrent
    /// execution saved over running the members one after another.
    pub fn record_batch(&self, size: usize, member_latency: Duration, wall: Duration) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
        self.batched_requests
            .fetch_add(size as u64, Ordering::Relaxed);
        let saved = member_latency.saturating_sub(wall).as_millis() as u64;
        self.time_saved_ms.fetch_add(saved, Ordering::Relaxed);
    }

    /// Read-only copy of the current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        let api_calls = self.api_calls.load(Ordering::Relaxed);
        let batches = self.batches_executed.load(Ordering::Relaxed);
        let batched = self.batched_requests.load(Ordering::Relaxed);
        let (p50, p95, p99) = match self.latency.lock().as_ref() {
            Some(h) if h.len() > 0 => (
                h.value_at_quantile(0.50),
                h.value_at_quantile(0.95),
                h.value_at_quantile(0.99),
            ),
            _ => (0, 0, 0),
        };

        MetricsSnapshot {
            total_submissions: self.total_submissions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
            api_calls,
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            batches_executed: batches,
            batched_requests: batched,
            fallback_executions: self.fallback_executions.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            avg_batch_size: ratio(batched, batches),
            avg_latency_ms: ratio(self.total_latency_ms.load(Ordering::Relaxed), api_calls),
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            estimated_time_saved_ms: self.time_saved_ms.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.total_submissions,
            &self.cache_hits,
            &self.deduplicated_requests,
            &self.api_calls,
            &self.failed_executions,
            &self.batches_executed,
            &self.batched_requests,
            &self.fallback_executions,
            &self.timeouts,
            &self.input_tokens,
            &self.output_tokens,
            &self.total_latency_ms,
            &self.time_saved_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Some(histogram) = self.latency.lock().as_mut() {
            histogram.reset();
        }
    }
}
