//! Per-tier request queues
//!
//! One FIFO queue per priority tier, each guarded by its own lock. Draining
//! is atomic per tier: a request is handed to exactly one batch.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{TierPolicies, TierPolicy};
use crate::error::{BatcherError, Result};
use crate::in_flight::Completion;
use crate::request::{Priority, Request, RequestId};

/// A request waiting in a tier queue, together with the right to resolve
/// its in-flight handle
#[derive(Debug)]
pub struct QueuedRequest {
    /// The request, shared read-only with the executor
    pub request: Arc<Request>,
    /// Resolves the handle every waiter for this request is blocked on
    pub completion: Completion,
    /// When the request entered the queue
    pub enqueued_at: Instant,
}

impl QueuedRequest {
    /// Wrap a request and its completion
    pub fn new(request: Arc<Request>, completion: Completion) -> Self {
        Self {
            request,
            completion,
            enqueued_at: Instant::now(),
        }
    }

    /// Correlation id of the queued request
    pub fn id(&self) -> RequestId {
        self.request.id
    }
}

/// Queue depth per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Pending `Critical` requests
    pub critical: usize,
    /// Pending `High` requests
    pub high: usize,
    /// Pending `Normal` requests
    pub normal: usize,
    /// Pending `Low` requests
    pub low: usize,
    /// Pending `Batch` requests
    pub batch: usize,
    /// Sum over all tiers
    pub total: usize,
}

struct TierQueue {
    policy: TierPolicy,
    pending: Mutex<VecDeque<QueuedRequest>>,
}

/// One ordered queue per priority tier
pub struct PriorityQueueSet {
    tiers: [TierQueue; 5],
}

fn index(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
        Priority::Batch => 4,
    }
}

impl PriorityQueueSet {
    /// Create empty queues with the given policies
    pub fn new(policies: &TierPolicies) -> Self {
        let tier = |priority| TierQueue {
            policy: *policies.get(priority),
            pending: Mutex::new(VecDeque::new()),
        };
        Self {
            tiers: Priority::ALL.map(tier),
        }
    }

    fn queue(&self, priority: Priority) -> &TierQueue {
        &self.tiers[index(priority)]
    }

    /// Policy of a tier
    pub fn policy(&self, priority: Priority) -> &TierPolicy {
        &self.queue(priority).policy
    }

    /// Append a request to its tier; returns the new queue length
    ///
    /// If the tier has a hard cap and it is reached, the entry is resolved
    /// with [`BatcherError::Capacity`] (so coalesced waiters fail together)
    /// and the same error is returned.
    pub fn enqueue(&self, entry: QueuedRequest) -> Result<usize> {
        let priority = entry.request.priority;
        let tier = self.queue(priority);
        let mut pending = tier.pending.lock();

        if let Some(cap) = tier.policy.max_queue_depth {
            if pending.len() >= cap {
                let error = BatcherError::Capacity {
                    priority,
                    depth: pending.len(),
                };
                drop(pending);
                tracing::warn!(%priority, cap, "Tier queue full, rejecting request");
                entry.completion.complete(Err(error.clone()));
                return Err(error);
            }
        }

        pending.push_back(entry);
        tracing::trace!(%priority, depth = pending.len(), "Request enqueued");
        Ok(pending.len())
    }

    /// Remove up to `up_to` requests from the front of a tier
    pub fn drain(&self, priority: Priority, up_to: usize) -> Vec<QueuedRequest> {
        let mut pending = self.queue(priority).pending.lock();
        let count = up_to.min(pending.len());
        pending.drain(..count).collect()
    }

    /// Remove a specific request if it is still queued
    pub fn remove(&self, priority: Priority, id: RequestId) -> Option<QueuedRequest> {
        let mut pending = self.queue(priority).pending.lock();
        let position = pending.iter().position(|entry| entry.id() == id)?;
        pending.remove(position)
    }

    /// Whether a request is still waiting in its tier
    pub fn contains(&self, priority: Priority, id: RequestId) -> bool {
        self.queue(priority)
            .pending
            .lock()
            .iter()
            .any(|entry| entry.id() == id)
    }

    /// Pending requests in a tier
    pub fn len(&self, priority: Priority) -> usize {
        self.queue(priority).pending.lock().len()
    }

    /// Whether every tier is empty
    pub fn is_empty(&self) -> bool {
        Priority::ALL.into_iter().all(|p| self.len(p) == 0)
    }

    /// Depth of every tier
    pub fn depth(&self) -> QueueDepth {
        let mut depth = QueueDepth {
            critical: self.len(Priority::Critical),
            high: self.len(Priority::High),
            normal: self.len(Priority::Normal),
            low: self.len(Priority::Low),
            batch: self.len(Priority::Batch),
            total: 0,
        };
        depth.total = depth.critical + depth.high + depth.normal + depth.low + depth.batch;
        depth
    }
}
