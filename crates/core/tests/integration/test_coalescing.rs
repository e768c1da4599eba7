//! Integration tests for caching, coalescing and failure propagation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use inferbatch_core::{
    BatcherConfig, BatcherError, Generation, InferenceCapability, MockCapability, Priority,
    PromptSpec, Request, RequestBatcher, RetryPolicy, RetryingCapability, TokenUsage,
};

fn batcher(latency: Duration) -> (RequestBatcher, Arc<MockCapability>) {
    let mock = Arc::new(MockCapability::with_latency(latency));
    let batcher =
        RequestBatcher::new(BatcherConfig::default(), mock.clone()).expect("valid config");
    (batcher, mock)
}

/// Capability that always fails with a rate-limit message
struct RateLimited;

#[async_trait]
impl InferenceCapability for RateLimited {
    async fn execute(&self, _request: &Request) -> anyhow::Result<Generation> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        anyhow::bail!("429 rate limited by upstream")
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicates_execute_once() {
    let (batcher, mock) = batcher(Duration::from_millis(80));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                batcher
                    .submit(PromptSpec::new("summarize account 9", "model-a"), Priority::Critical)
                    .await
            })
        })
        .collect();

    let mut responses = Vec::new();
    for task in tasks {
        responses.push(task.await.unwrap().unwrap());
    }

    assert_eq!(mock.call_count(), 1);
    assert!(responses.iter().all(|r| r.content == responses[0].content));
    assert_eq!(batcher.metrics_snapshot().deduplicated_requests, 7);
    assert_eq!(batcher.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_reaches_every_waiter_and_is_not_cached() {
    let (batcher, mock) = batcher(Duration::from_millis(50));
    mock.fail_next(1);

    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                batcher
                    .submit(PromptSpec::new("flaky", "model-a"), Priority::Critical)
                    .await
            })
        })
        .collect();

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, BatcherError::Execution(_)));
        assert!(err.to_string().contains("mock inference failure"));
    }
    assert_eq!(mock.call_count(), 1);
    assert_eq!(batcher.cache_stats().size, 0);
    assert_eq!(batcher.in_flight_count(), 0);

    // The failed handle is gone, so the next submit executes afresh
    let retry = batcher
        .submit(PromptSpec::new("flaky", "model-a"), Priority::Critical)
        .await
        .unwrap();
    assert!(!retry.from_cache);
    assert_eq!(mock.call_count(), 2);

    let snapshot = batcher.metrics_snapshot();
    assert_eq!(snapshot.failed_executions, 1);
    assert_eq!(snapshot.api_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn test_backend_error_is_propagated_verbatim() {
    let batcher = RequestBatcher::new(BatcherConfig::default(), Arc::new(RateLimited)).unwrap();

    let err = batcher
        .submit(PromptSpec::new("anything", "model-a"), Priority::High)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Execution failed: 429 rate limited by upstream");
}

#[tokio::test(start_paused = true)]
async fn test_skip_cache_forces_fresh_execution() {
    let (batcher, mock) = batcher(Duration::from_millis(10));
    let spec = PromptSpec::new("price check for lead 42", "model-a");

    batcher.submit(spec.clone(), Priority::Critical).await.unwrap();
    let cached = batcher.submit(spec.clone(), Priority::Critical).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(mock.call_count(), 1);

    let fresh = batcher
        .submit(spec.with_skip_cache(true), Priority::Critical)
        .await
        .unwrap();
    assert!(!fresh.from_cache);
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_skip_cache_does_not_join_in_flight_execution() {
    let (batcher, mock) = batcher(Duration::from_millis(100));
    let spec = PromptSpec::new("regenerate copy", "model-a");

    let first = tokio::spawn({
        let batcher = batcher.clone();
        let spec = spec.clone();
        async move { batcher.submit(spec, Priority::Critical).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    batcher
        .submit(spec.with_skip_cache(true), Priority::Critical)
        .await
        .unwrap();
    first.await.unwrap().unwrap();

    assert_eq!(mock.call_count(), 2);
    assert_eq!(batcher.metrics_snapshot().deduplicated_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_fingerprint_distinguishes_system_prompt_and_model() {
    let (batcher, mock) = batcher(Duration::ZERO);

    let plain = PromptSpec::new("describe", "model-a");
    let with_system = PromptSpec::new("describe", "model-a").with_system_prompt("be brief");
    let other_model = PromptSpec::new("describe", "model-b");

    for spec in [plain, with_system, other_model] {
        let response = batcher.submit(spec, Priority::Critical).await.unwrap();
        assert!(!response.from_cache);
    }
    assert_eq!(mock.call_count(), 3);
    assert_eq!(batcher.cache_stats().size, 3);
}

#[tokio::test(start_paused = true)]
async fn test_cached_response_expires_after_ttl() {
    let (batcher, mock) = batcher(Duration::ZERO);
    let spec = PromptSpec::new("short lived", "model-a").with_cache_ttl(Duration::from_secs(2));

    batcher.submit(spec.clone(), Priority::Critical).await.unwrap();
    assert!(batcher.submit(spec.clone(), Priority::Critical).await.unwrap().from_cache);

    tokio::time::advance(Duration::from_secs(3)).await;
    let response = batcher.submit(spec, Priority::Critical).await.unwrap();
    assert!(!response.from_cache);
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_envelope_counts_as_one_logical_execution() {
    let mock = MockCapability::new();
    mock.fail_next(2);
    let capability =
        RetryingCapability::new(mock, RetryPolicy::fixed(3, Duration::from_millis(10)));
    let batcher = RequestBatcher::new(BatcherConfig::default(), Arc::new(capability)).unwrap();

    let response = batcher
        .submit(PromptSpec::new("retry me", "model-a"), Priority::Critical)
        .await
        .unwrap();

    assert_eq!(response.content, "[model-a] retry me");
    assert_eq!(response.token_usage, TokenUsage::new(2, 3));
    assert_eq!(batcher.metrics_snapshot().api_calls, 1);
}
