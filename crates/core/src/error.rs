//! Error types for the request batcher

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::request::Priority;

/// Result type alias for batcher operations
pub type Result<T> = std::result::Result<T, BatcherError>;

/// Errors surfaced by the batcher
///
/// Cloneable so that one execution outcome can be handed to every caller
/// coalesced onto the same in-flight handle.
#[derive(Debug, Clone, Error)]
pub enum BatcherError {
    /// The wrapped inference capability failed
    #[error("Execution failed: {0}")]
    Execution(Arc<anyhow::Error>),

    /// The caller's own deadline fired while waiting
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// A tier queue reached its hard cap
    #[error("Queue for {priority} priority is full ({depth} pending)")]
    Capacity {
        /// Tier that rejected the request
        priority: Priority,
        /// Queue depth at rejection time
        depth: usize,
    },

    /// The executing task went away without resolving the handle
    #[error("In-flight execution was abandoned before completing")]
    Abandoned,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BatcherError {
    /// Wrap a capability failure
    pub fn execution(err: anyhow::Error) -> Self {
        BatcherError::Execution(Arc::new(err))
    }

    /// Whether this error affects only the caller that observed it
    pub fn is_caller_local(&self) -> bool {
        matches!(self, BatcherError::Timeout(_))
    }
}

impl From<toml::de::Error> for BatcherError {
    fn from(err: toml::de::Error) -> Self {
        BatcherError::Config(err.to_string())
    }
}

impl From<std::io::Error> for BatcherError {
    fn from(err: std::io::Error) -> Self {
        BatcherError::Config(err.to_string())
    }
}
