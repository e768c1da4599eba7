//! Request, response and priority types

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::BatcherError;
use crate::fingerprint::{fingerprint, Fingerprint};

/// Correlation id of a single `submit` call
pub type RequestId = Uuid;

/// Identifier of a drained batch
pub type BatchId = Uuid;

/// Priority tiers, most urgent first
///
/// Each tier has its own queue, batch-size cap and maximum accumulation
/// wait (see [`crate::config::TierPolicy`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Executed inline, never queued
    Critical,
    /// Short accumulation wait (100ms)
    High,
    /// Default tier (500ms)
    Normal,
    /// Long wait, also swept by the background drainer (5s)
    Low,
    /// Background-drained bulk work (30s)
    Batch,
}

impl Priority {
    /// All tiers in urgency order
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Batch,
    ];

    /// Tiers swept by the background drainer
    pub const BACKGROUND: [Priority; 2] = [Priority::Low, Priority::Batch];

    /// Default maximum time a request may sit queued
    pub fn default_max_wait(self) -> Duration {
        match self {
            Priority::Critical => Duration::ZERO,
            Priority::High => Duration::from_millis(100),
            Priority::Normal => Duration::from_millis(500),
            Priority::Low => Duration::from_millis(5_000),
            Priority::Batch => Duration::from_millis(30_000),
        }
    }

    /// Default maximum number of requests drained together
    pub fn default_max_batch_size(self) -> usize {
        match self {
            Priority::Critical => 1,
            Priority::High => 5,
            Priority::Normal => 10,
            Priority::Low => 20,
            Priority::Batch => 50,
        }
    }

    /// Whether the tier waits on the cache/drainer and falls back to a
    /// singleton execution at its deadline
    pub fn is_background(self) -> bool {
        matches!(self, Priority::Low | Priority::Batch)
    }

    /// Lowercase name used in logs and config files
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Batch => "batch",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = BatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| BatcherError::InvalidConfig(format!("unknown priority '{}'", s)))
    }
}

/// What a caller wants executed
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSpec {
    /// Prompt text
    pub prompt: String,
    /// Model identifier
    pub model: String,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Optional system instructions
    pub system_prompt: Option<String>,
    /// Bypass the cache read and in-flight coalescing
    pub skip_cache: bool,
    /// Override the configured cache TTL for this response
    pub cache_ttl: Option<Duration>,
}

impl PromptSpec {
    /// Create a spec with default generation parameters
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            max_tokens: 1024,
            temperature: 0.7,
            system_prompt: None,
            skip_cache: false,
            cache_ttl: None,
        }
    }

    /// Set system instructions
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the output token limit
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Skip the cache read and force a fresh execution
    pub fn with_skip_cache(mut self, skip_cache: bool) -> Self {
        self.skip_cache = skip_cache;
        self
    }

    /// Cache the response for `ttl` instead of the configured default
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// One logical call, immutable once built
#[derive(Debug, Clone)]
pub struct Request {
    /// Correlation id, unique per call
    pub id: RequestId,
    /// Prompt text
    pub prompt: String,
    /// Model identifier
    pub model: String,
    /// Tier the request was submitted at
    pub priority: Priority,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Optional system instructions
    pub system_prompt: Option<String>,
    /// Cache and coalescing key
    pub fingerprint: Fingerprint,
    /// Whether the cache read and coalescing were bypassed
    pub skip_cache: bool,
    /// TTL override for the cached response
    pub cache_ttl: Option<Duration>,
    /// Submission time
    pub created_at: Instant,
}

impl Request {
    /// Build a request from a caller spec, deriving its fingerprint
    pub fn new(spec: PromptSpec, priority: Priority) -> Self {
        let fingerprint = fingerprint(&spec.prompt, &spec.model, spec.system_prompt.as_deref());
        Self {
            id: Uuid::new_v4(),
            prompt: spec.prompt,
            model: spec.model,
            priority,
            max_tokens: spec.max_tokens,
            temperature: spec.temperature,
            system_prompt: spec.system_prompt,
            fingerprint,
            skip_cache: spec.skip_cache,
            cache_ttl: spec.cache_ttl,
            created_at: Instant::now(),
        }
    }
}

/// Token accounting reported by the inference backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Input plus output tokens
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of a logical call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this copy was handed to
    pub request_id: RequestId,
    /// Generated content
    pub content: String,
    /// Model that produced the content
    pub model: String,
    /// Token accounting for the physical call
    pub token_usage: TokenUsage,
    /// Latency of the physical call in milliseconds
    pub latency_ms: u64,
    /// Served from the response cache
    pub from_cache: bool,
    /// Batch that produced the content, if it was drained from a queue
    pub batch_id: Option<BatchId>,
}

impl Response {
    /// Independent copy carrying the caller's own correlation id
    pub fn personalize(&self, request_id: RequestId, from_cache: bool) -> Response {
        Response {
            request_id,
            from_cache,
            ..self.clone()
        }
    }
}
