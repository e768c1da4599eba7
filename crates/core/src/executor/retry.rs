//! Opt-in retry envelope for inference capabilities
//!
//! The batcher itself never retries: a failed execution is reported to every
//! waiter and the next `submit` starts fresh. Callers that want backoff wrap
//! their capability in [`RetryingCapability`] before handing it to the
//! batcher, so a retried call still counts as one physical execution.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::capability::{Generation, InferenceCapability};
use crate::request::Request;

/// Retry policy for failed capability calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    /// No retries
    None,

    /// Fixed number of retry attempts with constant delay
    Fixed {
        /// Number of retry attempts
        attempts: usize,
        /// Delay between retries
        delay: Duration,
    },

    /// Exponential backoff retries
    Exponential {
        /// Base delay for first retry
        base_delay: Duration,
        /// Maximum delay between retries
        max_delay: Duration,
        /// Maximum number of retry attempts
        max_attempts: usize,
        /// Backoff multiplier (typically 2.0)
        multiplier: f64,
    },
}

impl RetryPolicy {
    /// Create a fixed retry policy
    pub fn fixed(attempts: usize, delay: Duration) -> Self {
        RetryPolicy::Fixed { attempts, delay }
    }

    /// Create an exponential backoff policy starting at 100ms, capped at 30s
    pub fn exponential(max_attempts: usize) -> Self {
        RetryPolicy::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts,
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-indexed), `None` once exhausted
    pub fn delay_for_attempt(&self, attempt: usize) -> Option<Duration> {
        match self {
            RetryPolicy::None => None,
            RetryPolicy::Fixed { attempts, delay } => (attempt < *attempts).then_some(*delay),
            RetryPolicy::Exponential {
                base_delay,
                max_delay,
                max_attempts,
                multiplier,
            } => {
                if attempt >= *max_attempts {
                    return None;
                }
                let delay_ms = (base_delay.as_millis() as f64) * multiplier.powi(attempt as i32);
                Some(Duration::from_millis(delay_ms as u64).min(*max_delay))
            }
        }
    }

    /// Maximum number of retries after the first attempt
    pub fn max_attempts(&self) -> usize {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Fixed { attempts, .. } => *attempts,
            RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }
}

impl Default for RetryPolicy {
    /// 3 retries with exponential backoff (100/200/400ms)
    fn default() -> Self {
        RetryPolicy::Exponential {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: 3,
            multiplier: 2.0,
        }
    }
}

/// Predicate deciding whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Run `operation` until it succeeds, the predicate rejects the error, or
/// the policy is exhausted. The last error is returned unchanged.
pub async fn execute_with_retry<F, Fut, T>(
    policy: RetryPolicy,
    should_retry: impl Fn(&anyhow::Error) -> bool,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !should_retry(&err) {
                    return Err(err);
                }
                match policy.delay_for_attempt(attempt) {
                    Some(delay) => {
                        attempt += 1;
                        tracing::warn!(
                            "Inference call failed (retry {}/{}), retrying in {:?}: {}",
                            attempt,
                            policy.max_attempts(),
                            delay,
                            err
                        );
                        sleep(delay).await;
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

/// Capability decorator that retries failed calls per a [`RetryPolicy`]
pub struct RetryingCapability<C> {
    inner: C,
    policy: RetryPolicy,
    should_retry: Option<RetryPredicate>,
}

impl<C: InferenceCapability> RetryingCapability<C> {
    /// Retry every failure of `inner` according to `policy`
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            should_retry: None,
        }
    }

    /// Only retry errors accepted by `predicate`
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// The wrapped capability
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: InferenceCapability> InferenceCapability for RetryingCapability<C> {
    async fn execute(&self, request: &Request) -> anyhow::Result<Generation> {
        let predicate = self.should_retry.clone();
        execute_with_retry(
            self.policy,
            move |err| predicate.as_ref().map_or(true, |p| p(err)),
            || self.inner.execute(request),
        )
        .await
    }
}
