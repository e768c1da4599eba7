//! Response cache with TTL expiry and batch eviction
//!
//! Entries are keyed by request fingerprint. Expired entries are treated as
//! absent and purged lazily on access (or eagerly by `purge_expired`). When
//! the store is at capacity, the entries closest to expiry are evicted in a
//! batch (a configurable fraction of capacity) before the new entry goes in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::fingerprint::Fingerprint;
use crate::request::Response;

/// A cached response and its expiry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Shared response, personalized per caller on the way out
    pub response: Arc<Response>,
    /// Insert timestamp
    pub inserted_at: Instant,
    /// Lookups at or after this instant miss
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries currently stored (including not-yet-purged expired ones)
    pub size: usize,
    /// Hard cap on entries
    pub capacity: usize,
    /// `size / capacity`
    pub utilization: f64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because their TTL passed
    pub expirations: u64,
}

/// Bounded, thread-safe, TTL-expiring response store
pub struct ResponseCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    capacity: usize,
    /// Fraction of capacity evicted in one pass when full
    eviction_fraction: f64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResponseCache {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize, eviction_fraction: f64) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            eviction_fraction: eviction_fraction.clamp(f64::MIN_POSITIVE, 1.0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Look up a live entry
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<Response>> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(Instant::now()) => {
                    return Some(Arc::clone(&entry.response))
                }
                Some(_) => {}
            }
        }

        // Expired under the read lock; re-check under the write lock since a
        // fresh entry may have been stored in between.
        let mut entries = self.entries.write();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(fingerprint = %key.short(), "Purged expired cache entry");
                None
            }
            Some(entry) => Some(Arc::clone(&entry.response)),
            None => None,
        }
    }

    /// Insert or overwrite an entry, evicting first if at capacity
    ///
    /// A zero TTL stores nothing.
    pub fn set(&self, key: Fingerprint, response: Arc<Response>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        let now = Instant::now();
        let mut entries = self.entries.write();

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            self.evict_locked(&mut entries, now);
        }

        entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    fn evict_locked(&self, entries: &mut HashMap<Fingerprint, CacheEntry>, now: Instant) {
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let expired = before - entries.len();
        if expired > 0 {
            self.expirations.fetch_add(expired as u64, Ordering::Relaxed);
        }
        if entries.len() < self.capacity {
            return;
        }

        let batch = ((self.capacity as f64) * self.eviction_fraction).ceil() as usize;
        let overflow = entries.len() + 1 - self.capacity;
        let count = batch.max(overflow).max(1).min(entries.len());

        let mut by_expiry: Vec<(Instant, Fingerprint)> = entries
            .iter()
            .map(|(key, entry)| (entry.expires_at, key.clone()))
            .collect();
        by_expiry.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in by_expiry.into_iter().take(count) {
            entries.remove(&key);
        }
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        tracing::debug!(
            evicted = count,
            remaining = entries.len(),
            "Cache at capacity, evicted oldest entries"
        );
    }

    /// Remove one entry; returns whether it was present
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Drop all expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        let size = self.len();
        CacheStats {
            size,
            capacity: self.capacity,
            utilization: size as f64 / self.capacity as f64,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
