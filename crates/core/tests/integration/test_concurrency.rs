//! Integration tests that hammer the batcher from parallel worker threads

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use inferbatch_core::{BatcherConfig, MockCapability, Priority, PromptSpec, RequestBatcher};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("inferbatch_core=info")
        .with_test_writer()
        .try_init();
}

fn batcher(latency: Duration) -> (RequestBatcher, Arc<MockCapability>) {
    let mock = Arc::new(MockCapability::with_latency(latency));
    let batcher =
        RequestBatcher::new(BatcherConfig::default(), mock.clone()).expect("valid config");
    (batcher, mock)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_duplicates_make_one_call_per_round() {
    init_tracing();
    let (batcher, mock) = batcher(Duration::from_millis(1));
    let barrier = Arc::new(tokio::sync::Barrier::new(32));

    for round in 0..200 {
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let batcher = batcher.clone();
                let barrier = Arc::clone(&barrier);
                let spec = PromptSpec::new(format!("round {} lookup", round), "model-a");
                tokio::spawn(async move {
                    barrier.wait().await;
                    batcher.submit(spec, Priority::Critical).await
                })
            })
            .collect();

        let mut contents = HashSet::new();
        for task in tasks {
            let response = task.await.unwrap().unwrap();
            contents.insert(response.content);
        }
        assert_eq!(contents.len(), 1, "round {} saw diverging content", round);
    }

    assert_eq!(mock.call_count(), 200);
    assert_eq!(batcher.in_flight_count(), 0);

    let snapshot = batcher.metrics_snapshot();
    assert_eq!(snapshot.total_submissions, 200 * 32);
    assert_eq!(snapshot.api_calls, 200);
    assert_eq!(snapshot.cache_hits + snapshot.deduplicated_requests, 200 * 31);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_normal_submits_drain_completely() {
    init_tracing();
    let (batcher, mock) = batcher(Duration::from_millis(5));

    let tasks: Vec<_> = (0..400)
        .map(|i| {
            let batcher = batcher.clone();
            let spec = PromptSpec::new(format!("lead {} score", i % 50), "model-a");
            tokio::spawn(async move { batcher.submit(spec, Priority::Normal).await })
        })
        .collect();

    for task in tasks {
        let response = task.await.unwrap().unwrap();
        assert!(response.content.starts_with("[model-a] lead "));
    }

    assert_eq!(mock.call_count(), 50);
    assert_eq!(batcher.queue_depth().total, 0);
    assert_eq!(batcher.in_flight_count(), 0);
    assert_eq!(batcher.cache_stats().size, 50);
}
