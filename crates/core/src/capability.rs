//! Inference backend boundary
//!
//! The batcher treats the backend as an opaque capability that executes
//! one request per call. Parallelism comes from calling it concurrently,
//! never from the backend batching internally.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::request::{Request, TokenUsage};

/// Output of one physical call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// Generated content
    pub content: String,
    /// Token accounting
    pub usage: TokenUsage,
}

/// Something that can execute a single inference request
#[async_trait]
pub trait InferenceCapability: Send + Sync + 'static {
    /// Execute one request
    async fn execute(&self, request: &Request) -> anyhow::Result<Generation>;
}

/// Deterministic in-process capability for tests, demos and running
/// without a configured backend
///
/// Echoes the prompt after a fixed latency, counts calls and can be told
/// to fail the next N calls.
#[derive(Debug, Default)]
pub struct MockCapability {
    latency: Duration,
    calls: AtomicU64,
    fail_remaining: AtomicU64,
    in_progress: AtomicUsize,
    peak_concurrency: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockCapability {
    /// Capability that answers immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Capability that takes `latency` per call
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Fail the next `count` calls
    pub fn fail_next(&self, count: u64) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Physical calls made so far
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_concurrency.load(Ordering::SeqCst)
    }

    /// Prompts in the order calls started
    pub fn executed_prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Content the mock produces for a request
    pub fn content_for(request: &Request) -> String {
        format!("[{}] {}", request.model, request.prompt)
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl InferenceCapability for MockCapability {
    async fn execute(&self, request: &Request) -> anyhow::Result<Generation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.prompt.clone());
        let running = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrency.fetch_max(running, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_progress.fetch_sub(1, Ordering::SeqCst);

        let should_fail = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("mock inference failure for model {}", request.model);
        }

        let content = Self::content_for(request);
        let input = word_count(&request.prompt)
            + request.system_prompt.as_deref().map(word_count).unwrap_or(0);
        let output = word_count(&content);
        Ok(Generation {
            content,
            usage: TokenUsage::new(input, output),
        })
    }
}
