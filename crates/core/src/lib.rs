//! Inferbatch Core - outbound inference request batcher
//!
//! Sits between application code and a rate- and latency-sensitive
//! inference backend, turning many logical calls into fewer physical ones.
//!
//! # Architecture
//!
//! - [`fingerprint`] derives the key shared by the cache and coalescing
//! - [`cache::ResponseCache`] keeps completed responses with TTL expiry
//! - [`in_flight::InFlightRegistry`] coalesces identical concurrent requests
//! - [`queue::PriorityQueueSet`] holds one queue per priority tier
//! - [`executor::BatchExecutor`] runs drained batches concurrently
//! - [`executor::BackgroundDrainer`] sweeps the low-priority tiers
//! - [`metrics::MetricsAggregator`] tracks hit, dedup and batching counters
//! - [`RequestBatcher`] is the façade that orchestrates all of the above
//!
//! The backend is injected as an [`InferenceCapability`]; there is no global
//! instance. Construct one batcher per process (or tenant) and share clones.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use inferbatch_core::{BatcherConfig, MockCapability, Priority, PromptSpec, RequestBatcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let capability = Arc::new(MockCapability::new());
//!     let batcher = RequestBatcher::new(BatcherConfig::default(), capability)?;
//!     let response = batcher
//!         .submit(PromptSpec::new("score lead 7", "model-a"), Priority::Critical)
//!         .await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batcher;
pub mod cache;
pub mod capability;
pub mod config;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod in_flight;
pub mod metrics;
pub mod queue;
pub mod request;

pub use batcher::{RequestBatcher, SubmitOptions};
pub use cache::{CacheStats, ResponseCache};
pub use capability::{Generation, InferenceCapability, MockCapability};
pub use config::{BatcherConfig, TierPolicies, TierPolicy};
pub use error::{BatcherError, Result};
pub use executor::{BackgroundDrainer, BatchExecutor, RetryPolicy, RetryingCapability};
pub use fingerprint::Fingerprint;
pub use in_flight::{Claim, InFlightHandle, InFlightRegistry};
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use queue::{PriorityQueueSet, QueueDepth};
pub use request::{BatchId, Priority, PromptSpec, Request, RequestId, Response, TokenUsage};
