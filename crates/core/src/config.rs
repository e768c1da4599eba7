//! Configuration for the request batcher

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BatcherError, Result};
use crate::request::Priority;

/// Batching policy for one priority tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Maximum requests drained and executed together
    pub max_batch_size: usize,

    /// Maximum time a request may sit queued before it is forced through
    pub max_wait_ms: u64,

    /// Hard cap on queued requests; `None` lets the queue grow until drained
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_depth: Option<usize>,
}

impl TierPolicy {
    /// Create a policy without a queue cap
    pub fn new(max_batch_size: usize, max_wait: Duration) -> Self {
        Self {
            max_batch_size,
            max_wait_ms: max_wait.as_millis() as u64,
            max_queue_depth: None,
        }
    }

    /// Defaults for a tier
    pub fn default_for(priority: Priority) -> Self {
        Self::new(priority.default_max_batch_size(), priority.default_max_wait())
    }

    /// Set a hard queue cap
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Maximum accumulation wait
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Per-tier policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPolicies {
    /// `Critical` tier
    pub critical: TierPolicy,
    /// `High` tier
    pub high: TierPolicy,
    /// `Normal` tier
    pub normal: TierPolicy,
    /// `Low` tier
    pub low: TierPolicy,
    /// `Batch` tier
    pub batch: TierPolicy,
}

impl Default for TierPolicies {
    fn default() -> Self {
        Self {
            critical: TierPolicy::default_for(Priority::Critical),
            high: TierPolicy::default_for(Priority::High),
            normal: TierPolicy::default_for(Priority::Normal),
            low: TierPolicy::default_for(Priority::Low),
            batch: TierPolicy::default_for(Priority::Batch),
        }
    }
}

impl TierPolicies {
    /// Policy for a tier
    pub fn get(&self, priority: Priority) -> &TierPolicy {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
            Priority::Batch => &self.batch,
        }
    }

    fn get_mut(&mut self, priority: Priority) -> &mut TierPolicy {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
            Priority::Batch => &mut self.batch,
        }
    }
}

/// Batcher configuration
///
/// Every field has a default, so a TOML file only needs to name what it
/// overrides. A `[tiers.<name>]` table must give both `max_batch_size`
/// and `max_wait_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Maximum cached responses
    pub cache_capacity: usize,

    /// Default response TTL in milliseconds
    pub cache_ttl_ms: u64,

    /// Fraction of capacity evicted at once when the cache is full
    pub eviction_fraction: f64,

    /// Background drainer period in milliseconds
    pub drain_interval_ms: u64,

    /// Limit on concurrent calls into the inference capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_executions: Option<usize>,

    /// Per-tier batching policies
    pub tiers: TierPolicies,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            cache_ttl_ms: 3_600_000,
            eviction_fraction: 0.1,
            drain_interval_ms: 1000,
            max_concurrent_executions: None,
            tiers: TierPolicies::default(),
        }
    }
}

impl BatcherConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: BatcherConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            BatcherError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }

    /// Set cache capacity
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the default response TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Set the eviction batch fraction
    pub fn with_eviction_fraction(mut self, fraction: f64) -> Self {
        self.eviction_fraction = fraction;
        self
    }

    /// Set the background drainer period
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Limit concurrent capability calls
    pub fn with_max_concurrent_executions(mut self, limit: usize) -> Self {
        self.max_concurrent_executions = Some(limit);
        self
    }

    /// Replace one tier's policy
    pub fn with_tier(mut self, priority: Priority, policy: TierPolicy) -> Self {
        *self.tiers.get_mut(priority) = policy;
        self
    }

    /// Policy for a tier
    pub fn tier(&self, priority: Priority) -> &TierPolicy {
        self.tiers.get(priority)
    }

    /// Default response TTL
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Background drainer period
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Reject values the batcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(BatcherError::InvalidConfig(
                "cache_capacity must be greater than zero".to_string(),
            ));
        }
        if !(self.eviction_fraction > 0.0 && self.eviction_fraction <= 1.0) {
            return Err(BatcherError::InvalidConfig(format!(
                "eviction_fraction must be in (0, 1], got {}",
                self.eviction_fraction
            )));
        }
        if self.drain_interval_ms == 0 {
            return Err(BatcherError::InvalidConfig(
                "drain_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_executions == Some(0) {
            return Err(BatcherError::InvalidConfig(
                "max_concurrent_executions must be greater than zero when set".to_string(),
            ));
        }
        for priority in Priority::ALL {
            let policy = self.tier(priority);
            if policy.max_batch_size == 0 {
                return Err(BatcherError::InvalidConfig(format!(
                    "tiers.{}.max_batch_size must be greater than zero",
                    priority
                )));
            }
            if policy.max_queue_depth == Some(0) {
                return Err(BatcherError::InvalidConfig(format!(
                    "tiers.{}.max_queue_depth must be greater than zero when set",
                    priority
                )));
            }
        }
        Ok(())
    }
}
