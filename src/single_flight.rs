//! Per-key mutual exclusion with wait-free signalling.
//!
//! Modeled on the in-flight coalescing `DashMap<Key, Entry>` + `tokio::sync::Notify`
//! pattern the idempotency plugin uses for request de-duplication: the first caller
//! for a key proceeds immediately and is told it did; every concurrent caller for
//! the same key waits on a `Notify` and is told it didn't, so it knows to re-check
//! shared state before doing the expensive work itself.

use std::collections::hash_map::RandomState;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct Slot {
    lock: Arc<Mutex<()>>,
    waiters: std::sync::atomic::AtomicUsize,
}

/// A keyed mutex. At most one [`Handle`] is live per key at a time.
pub struct SingleFlightGate<K: Eq + Hash + Send + Sync + 'static> {
    slots: DashMap<K, Arc<Slot>, RandomState>,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> Default for SingleFlightGate<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> SingleFlightGate<K> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Blocks until `key` is free or `cancel` fires.
    ///
    /// `handle.wait_free` is `true` iff no other holder was present when this
    /// call started waiting — callers use that to decide whether to re-check
    /// shared state the gate protects before redoing expensive work.
    pub async fn acquire(&self, key: K, cancel: &CancellationToken) -> Result<Handle<K>, Cancelled> {
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    lock: Arc::new(Mutex::new(())),
                    waiters: std::sync::atomic::AtomicUsize::new(0),
                })
            })
            .clone();

        let prior_waiters = slot
            .waiters
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let wait_free = prior_waiters == 0;

        let guard = tokio::select! {
            g = slot.lock.clone().lock_owned() => g,
            () = cancel.cancelled() => {
                slot.waiters.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                return Err(Cancelled);
            }
        };

        Ok(Handle {
            _guard: guard,
            key,
            slot,
            gate: self,
            wait_free,
        })
    }

    fn release(&self, key: &K, slot: &Arc<Slot>) {
        let remaining = slot
            .waiters
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst)
            - 1;
        if remaining == 0 {
            // Best-effort: if someone raced in between the decrement and this
            // removal, their `entry()` call already cloned the Arc, so removing
            // the map entry here only drops the gate's own reference.
            self.slots.remove_if(key, |_, v| Arc::ptr_eq(v, slot));
        }
    }
}

/// Cancellation fired while waiting to acquire a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// RAII handle returned by [`SingleFlightGate::acquire`]. Dropping it releases the key.
pub struct Handle<'g, K: Eq + Hash + Clone + Send + Sync + 'static> {
    _guard: tokio::sync::OwnedMutexGuard<()>,
    key: K,
    slot: Arc<Slot>,
    gate: &'g SingleFlightGate<K>,
    pub wait_free: bool,
}

impl<'g, K: Eq + Hash + Clone + Send + Sync + 'static> Drop for Handle<'g, K> {
    fn drop(&mut self) {
        self.gate.release(&self.key, &self.slot);
    }
}
