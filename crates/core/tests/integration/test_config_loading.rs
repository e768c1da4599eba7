//! Integration tests for loading batcher configuration from disk

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use inferbatch_core::{
    BatcherConfig, BatcherError, MockCapability, Priority, PromptSpec, RequestBatcher,
};
use tempfile::NamedTempFile;
use tokio::time::Instant;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(contents.as_bytes()).expect("Failed to write config");
    file
}

#[tokio::test(start_paused = true)]
async fn test_file_config_drives_tier_behaviour() {
    let file = write_config(
        r#"
        cache_capacity = 16
        cache_ttl_ms = 60000
        drain_interval_ms = 250

        [tiers.high]
        max_batch_size = 2
        max_wait_ms = 10000
        "#,
    );
    let config = BatcherConfig::from_file(file.path()).unwrap();
    assert_eq!(config.cache_capacity, 16);
    assert_eq!(config.drain_interval(), Duration::from_millis(250));

    let batcher = RequestBatcher::new(config, Arc::new(MockCapability::new())).unwrap();
    let start = Instant::now();

    // Two requests fill the High tier, so neither waits out the 10s window
    let (a, b) = tokio::join!(
        batcher.submit(PromptSpec::new("a", "model-a"), Priority::High),
        batcher.submit(PromptSpec::new("b", "model-a"), Priority::High),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(a.batch_id, b.batch_id);
    assert_eq!(batcher.cache_stats().capacity, 16);
}

#[test]
fn test_missing_file_is_config_error() {
    let err = BatcherConfig::from_file("/nonexistent/inferbatch.toml").unwrap_err();
    assert!(matches!(err, BatcherError::Config(_)));
}

#[test]
fn test_invalid_file_values_are_rejected() {
    let file = write_config(
        r#"
        [tiers.normal]
        max_batch_size = 0
        max_wait_ms = 500
        "#,
    );
    let err = BatcherConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, BatcherError::InvalidConfig(_)));
    assert!(err.to_string().contains("tiers.normal.max_batch_size"));
}
