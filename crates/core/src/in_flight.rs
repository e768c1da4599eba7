//! In-flight request coalescing
//!
//! Maps fingerprint -> shared completion handle so that concurrent duplicate
//! requests wait on one physical execution instead of issuing N of them.
//!
//! The claim-or-join step is a single atomic map operation. The claimant
//! receives a [`Completion`], which is the only way to resolve the handle;
//! resolving also removes the handle from the registry. A `Completion`
//! dropped without being resolved resolves its handle with
//! [`BatcherError::Abandoned`], so a handle never outlives its execution.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::BatcherError;
use crate::fingerprint::Fingerprint;
use crate::request::Response;

/// Shared outcome broadcast to every waiter
pub type Outcome = std::result::Result<Arc<Response>, BatcherError>;

/// Broadcast-completion slot that any number of waiters can await
#[derive(Debug)]
pub struct InFlightHandle {
    fingerprint: Fingerprint,
    slot: watch::Sender<Option<Outcome>>,
    created_at: Instant,
}

impl InFlightHandle {
    fn new(fingerprint: Fingerprint) -> Arc<Self> {
        let (slot, _) = watch::channel(None);
        Arc::new(Self {
            fingerprint,
            slot,
            created_at: Instant::now(),
        })
    }

    /// Fingerprint this handle coalesces
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// When the handle was claimed
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether an outcome has been published
    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Publish the outcome; only the first call has any effect
    fn resolve(&self, outcome: Outcome) -> bool {
        let mut outcome = Some(outcome);
        self.slot.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = outcome.take();
                true
            } else {
                false
            }
        })
    }

    /// Wait for the outcome
    ///
    /// Cancel-safe: dropping the future only removes this waiter.
    pub async fn wait(&self) -> Outcome {
        let mut receiver = self.slot.subscribe();
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone().unwrap_or(Err(BatcherError::Abandoned)),
            Err(_) => Err(BatcherError::Abandoned),
        };
        outcome
    }
}

/// Result of [`InFlightRegistry::try_claim`]
#[derive(Debug)]
pub enum Claim {
    /// No handle existed; the caller now owns execution for the fingerprint
    Owner(Completion),
    /// Another caller is already executing; wait on its handle
    Joined(Arc<InFlightHandle>),
}

impl Claim {
    /// Whether the fingerprint was already claimed
    pub fn already_claimed(&self) -> bool {
        matches!(self, Claim::Joined(_))
    }

    /// The shared handle, regardless of ownership
    pub fn handle(&self) -> Arc<InFlightHandle> {
        match self {
            Claim::Owner(completion) => completion.handle(),
            Claim::Joined(handle) => Arc::clone(handle),
        }
    }
}

/// Exclusive right to resolve one handle
#[derive(Debug)]
pub struct Completion {
    handle: Arc<InFlightHandle>,
    /// `None` for detached handles that were never registered
    registry: Option<Arc<InFlightRegistry>>,
}

impl Completion {
    /// The handle this completion resolves
    pub fn handle(&self) -> Arc<InFlightHandle> {
        Arc::clone(&self.handle)
    }

    /// Fingerprint being completed
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.handle.fingerprint
    }

    /// Deregister the handle and publish the outcome to all waiters
    pub fn complete(self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn finish(&self, outcome: Outcome) {
        // Deregister before publishing so that a caller arriving after a
        // failure claims a fresh handle instead of joining the failed one.
        if let Some(registry) = &self.registry {
            registry.release(&self.handle);
        }
        self.handle.resolve(outcome);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.handle.is_resolved() {
            tracing::warn!(
                fingerprint = %self.handle.fingerprint.short(),
                "In-flight handle dropped without an outcome"
            );
            self.finish(Err(BatcherError::Abandoned));
        }
    }
}

/// Registry of executing fingerprints
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    handles: DashMap<Fingerprint, Arc<InFlightHandle>>,
}

impl InFlightRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically join the existing handle for `fingerprint` or create one
    pub fn try_claim(self: &Arc<Self>, fingerprint: &Fingerprint) -> Claim {
        match self.handles.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => Claim::Joined(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let handle = InFlightHandle::new(fingerprint.clone());
                entry.insert(Arc::clone(&handle));
                Claim::Owner(Completion {
                    handle,
                    registry: Some(Arc::clone(self)),
                })
            }
        }
    }

    /// A handle that is never registered and so never coalesces
    pub fn detached(fingerprint: &Fingerprint) -> Completion {
        Completion {
            handle: InFlightHandle::new(fingerprint.clone()),
            registry: None,
        }
    }

    /// Resolve the registered handle for `fingerprint` and remove it
    ///
    /// Returns `false` if nothing was registered. Prefer resolving through
    /// the owning [`Completion`]; this is for callers that only hold the key.
    pub fn complete(&self, fingerprint: &Fingerprint, outcome: Outcome) -> bool {
        match self.handles.remove(fingerprint) {
            Some((_, handle)) => handle.resolve(outcome),
            None => false,
        }
    }

    fn release(&self, handle: &Arc<InFlightHandle>) {
        self.handles
            .remove_if(&handle.fingerprint, |_, current| Arc::ptr_eq(current, handle));
    }

    /// Whether `fingerprint` is currently executing
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.handles.contains_key(fingerprint)
    }

    /// Number of executing fingerprints
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether nothing is executing
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
