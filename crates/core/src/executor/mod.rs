//! Batch execution and background draining

pub mod batch;
pub mod drainer;
pub mod retry;

pub use batch::BatchExecutor;
pub use drainer::{sweep_background_tiers, BackgroundDrainer};
pub use retry::{execute_with_retry, RetryPolicy, RetryPredicate, RetryingCapability};
