//! Resource Registry
//!
//! Process-scoped home of every shared adapter resource: the keyed handle
//! pools, the per-endpoint records of in-flight connection attempts, the
//! count of sources sharing each endpoint, and temporarily disabled endpoints. One registry is built at startup and
//! injected into every adapter and source.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use qore_core::{EngineError, EngineResult};
use tracing::{debug, info};
use uuid::Uuid;

use super::{PoolKey, ResourcePool};

/// Identifier of one background connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct AttemptBook {
    in_flight: HashMap<String, HashSet<AttemptId>>,
    ever_attempted: HashSet<String>,
}

/// Shared pools and connection bookkeeping
pub struct ResourceRegistry {
    pools: RwLock<HashMap<PoolKey, Arc<dyn Any + Send + Sync>>>,
    attempts: Mutex<AttemptBook>,
    disabled: Mutex<HashMap<String, Instant>>,
    users: Mutex<HashMap<String, usize>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            attempts: Mutex::new(AttemptBook::default()),
            disabled: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Gets the pool for `key`, creating it with `capacity` on first use.
    ///
    /// An existing pool keeps its capacity; use
    /// [`ResourcePool::set_capacity`] to change it.
    pub fn pool<H: Send + 'static>(
        &self,
        key: &PoolKey,
        capacity: usize,
    ) -> EngineResult<Arc<ResourcePool<H>>> {
        if let Some(existing) = self.pools.read().get(key) {
            return Self::downcast(key, existing.clone());
        }

        let mut pools = self.pools.write();
        let entry = pools
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(pool = %key, capacity, "Creating handle pool");
                Arc::new(ResourcePool::<H>::new(key.clone(), capacity)) as Arc<dyn Any + Send + Sync>
            })
            .clone();
        Self::downcast(key, entry)
    }

    fn downcast<H: Send + 'static>(
        key: &PoolKey,
        pool: Arc<dyn Any + Send + Sync>,
    ) -> EngineResult<Arc<ResourcePool<H>>> {
        pool.downcast::<ResourcePool<H>>().map_err(|_| {
            EngineError::internal(format!(
                "Pool {} already holds handles of a different kind",
                key
            ))
        })
    }

    /// Forgets a pool. Handles still inside it are dropped with it.
    pub fn remove_pool(&self, key: &PoolKey) -> bool {
        let removed = self.pools.write().remove(key).is_some();
        if removed {
            info!(pool = %key, "Removed handle pool");
        }
        removed
    }

    pub fn pool_keys(&self) -> Vec<PoolKey> {
        let mut keys: Vec<PoolKey> = self.pools.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    // ==================== Endpoint users ====================

    /// Records one more source reading `endpoint`. Returns the new count.
    pub fn retain_endpoint(&self, endpoint: &str) -> usize {
        let mut users = self.users.lock();
        let count = users.entry(endpoint.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drops one source from `endpoint`. Returns how many still read it;
    /// its pools may be torn down once this reaches zero.
    pub fn release_endpoint(&self, endpoint: &str) -> usize {
        let mut users = self.users.lock();
        match users.get_mut(endpoint) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                users.remove(endpoint);
                0
            }
            None => 0,
        }
    }

    pub fn endpoint_users(&self, endpoint: &str) -> usize {
        self.users.lock().get(endpoint).copied().unwrap_or(0)
    }

    // ==================== Connection attempts ====================

    /// Registers a new attempt against `endpoint` unless `cap` attempts are already running.
    pub fn try_begin_attempt(&self, endpoint: &str, cap: usize) -> Option<AttemptId> {
        let mut book = self.attempts.lock();
        let running = book.in_flight.entry(endpoint.to_string()).or_default();
        if running.len() >= cap {
            return None;
        }
        let id = AttemptId::new();
        running.insert(id);
        book.ever_attempted.insert(endpoint.to_string());
        Some(id)
    }

    pub fn end_attempt(&self, endpoint: &str, id: AttemptId) {
        let mut book = self.attempts.lock();
        if let Some(running) = book.in_flight.get_mut(endpoint) {
            running.remove(&id);
            if running.is_empty() {
                book.in_flight.remove(endpoint);
            }
        }
    }

    pub fn in_flight(&self, endpoint: &str) -> usize {
        self.attempts
            .lock()
            .in_flight
            .get(endpoint)
            .map(|running| running.len())
            .unwrap_or(0)
    }

    /// True until the first attempt against `endpoint` has been registered.
    pub fn is_first_attempt(&self, endpoint: &str) -> bool {
        !self.attempts.lock().ever_attempted.contains(endpoint)
    }

    // ==================== Endpoint disablement ====================

    pub fn disable_endpoint(&self, endpoint: &str, period: Duration) {
        info!(endpoint, period_ms = period.as_millis() as u64, "Temporarily disabling endpoint");
        self.disabled
            .lock()
            .insert(endpoint.to_string(), Instant::now() + period);
    }

    /// Whether the endpoint is still inside its disablement period.
    pub fn is_endpoint_disabled(&self, endpoint: &str) -> bool {
        let mut disabled = self.disabled.lock();
        match disabled.get(endpoint) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                disabled.remove(endpoint);
                false
            }
            None => false,
        }
    }

    pub fn enable_endpoint(&self, endpoint: &str) {
        self.disabled.lock().remove(endpoint);
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
