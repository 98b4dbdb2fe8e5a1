//! TTL hint cache: short-circuits existence checks, never stands in for the truth.
//!
//! An entry here only ever causes *extra* work when it's wrong (stale or
//! missing) — every caller still verifies against an authoritative store
//! before skipping a write or attempting a placement that isn't there. The
//! map itself follows the same `DashMap` + lazily-checked deadline shape the
//! idempotency plugin uses for its completed-response cache.

use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use crate::hash::ContentHash;

struct ElisionEntry {
    size: u64,
    expires_at: Instant,
}

/// A hash → known-size hint map with per-entry expiry.
#[derive(Default)]
pub struct ElisionCache {
    entries: DashMap<ContentHash, ElisionEntry>,
}

impl ElisionCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the known size if present and not yet expired.
    ///
    /// An expired entry is lazily evicted on read rather than left for a
    /// background sweep — there is no sweep, by design: expiry is only ever
    /// observed, never actively enforced.
    pub fn try_get(&self, hash: &ContentHash) -> Option<u64> {
        let now = Instant::now();
        let hit = self.entries.get(hash).and_then(|e| {
            if e.expires_at > now {
                Some(e.size)
            } else {
                None
            }
        });
        if hit.is_none() {
            self.entries.remove_if(hash, |_, e| e.expires_at <= now);
        }
        hit
    }

    /// Inserts or overwrites the entry for `hash` with a fresh deadline.
    pub fn try_add(&self, hash: ContentHash, size: u64, ttl: Duration) {
        self.entries.insert(
            hash,
            ElisionEntry {
                size,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
