//! Bounded pools of reusable physical handles
//!
//! A [`ResourcePool`] is a LIFO free list with a fixed capacity. Pushing into
//! a full pool hands the handle back to the caller instead of retaining it;
//! the caller (which was discarding the handle anyway) closes or drops it.
//! Waiters for a handle park on the pool's [`Notify`] and are woken on every
//! push and whenever a connection attempt against the pool ends.

pub mod registry;

pub use registry::{AttemptId, ResourceRegistry};

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::metrics;

const IN_MEMORY_KEY_PREFIX: &str = "INMEMORY ";

/// Identity of a pool: source identity × cache-mode.
///
/// Handles used to load an in-memory cache live apart from the handles used
/// for direct physical access.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub identity: String,
    pub in_memory: bool,
}

impl PoolKey {
    pub fn new(identity: impl Into<String>, in_memory: bool) -> Self {
        Self {
            identity: identity.into(),
            in_memory,
        }
    }

    pub fn direct(identity: impl Into<String>) -> Self {
        Self::new(identity, false)
    }

    pub fn in_memory(identity: impl Into<String>) -> Self {
        Self::new(identity, true)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_memory {
            write!(f, "{}{}", IN_MEMORY_KEY_PREFIX, self.identity)
        } else {
            f.write_str(&self.identity)
        }
    }
}

struct Slots<H> {
    handles: Vec<H>,
    capacity: usize,
}

/// A bounded LIFO free list of handles of one kind
pub struct ResourcePool<H> {
    key: PoolKey,
    slots: Mutex<Slots<H>>,
    available: Notify,
}

impl<H> ResourcePool<H> {
    pub fn new(key: PoolKey, capacity: usize) -> Self {
        Self {
            key,
            slots: Mutex::new(Slots {
                handles: Vec::with_capacity(capacity.min(64)),
                capacity,
            }),
            available: Notify::new(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Returns a handle to the pool and wakes every waiter.
    ///
    /// When the pool is full the handle is handed back as `Some(handle)` and
    /// nothing is retained.
    pub fn push(&self, handle: H) -> Option<H> {
        let rejected = {
            let mut slots = self.slots.lock();
            if slots.handles.len() >= slots.capacity {
                Some(handle)
            } else {
                slots.handles.push(handle);
                None
            }
        };

        if rejected.is_some() {
            metrics::record_handle_dropped();
        } else {
            metrics::record_handle_pooled();
            self.available.notify_waiters();
        }
        rejected
    }

    /// Takes the most recently pushed handle, if any.
    pub fn pop(&self) -> Option<H> {
        let handle = self.slots.lock().handles.pop();
        if handle.is_some() {
            metrics::record_handle_reused();
        }
        handle
    }

    pub fn len(&self) -> usize {
        self.slots.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().handles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity
    }

    /// Changes the capacity; handles beyond the new capacity are returned for closing.
    pub fn set_capacity(&self, capacity: usize) -> Vec<H> {
        let mut slots = self.slots.lock();
        slots.capacity = capacity;
        let excess = slots.handles.len().saturating_sub(capacity);
        if excess > 0 {
            slots.handles.drain(..excess).collect()
        } else {
            Vec::new()
        }
    }

    /// Empties the pool, returning every held handle for closing.
    pub fn drain(&self) -> Vec<H> {
        std::mem::take(&mut self.slots.lock().handles)
    }

    /// Future resolved by the next [`notify_all`](Self::notify_all) or push.
    ///
    /// Call `enable()` on the pinned future before re-checking the pool so a
    /// push between the check and the wait is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.available.notified()
    }

    /// Wakes every task waiting for this pool.
    pub fn notify_all(&self) {
        self.available.notify_waiters();
    }
}

impl<H> fmt::Debug for ResourcePool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("ResourcePool")
            .field("key", &self.key.to_string())
            .field("len", &slots.handles.len())
            .field("capacity", &slots.capacity)
            .finish()
    }
}
