//! Adapter Registry
//!
//! Holds every live source adapter by id and drives the periodic cache sweep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::SourceAdapter;

/// Registry of live adapters
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<SourceAdapter>>>,
}

impl AdapterRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an adapter under its id, returning the adapter it replaces.
    ///
    /// The replaced adapter is not closed; that is up to the caller.
    pub fn register(&self, adapter: Arc<SourceAdapter>) -> Option<Arc<SourceAdapter>> {
        let id = adapter.id().to_string();
        self.adapters.write().insert(id, adapter)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SourceAdapter>> {
        self.adapters.read().get(id).cloned()
    }

    /// Removes and closes an adapter.
    pub async fn remove(&self, id: &str) -> Option<Arc<SourceAdapter>> {
        let removed = self.adapters.write().remove(id);
        if let Some(adapter) = &removed {
            adapter.close().await;
            info!(source = id, "Adapter removed");
        }
        removed
    }

    /// Registered adapter ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Adapters reading the given endpoint, table, path or mask.
    pub fn find_based_on(&self, descriptor: &str) -> Vec<Arc<SourceAdapter>> {
        let mut found: Vec<Arc<SourceAdapter>> = self
            .adapters
            .read()
            .values()
            .filter(|adapter| adapter.is_based_on(descriptor))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    /// Queues a cache reload on every adapter whose cache expired or failed.
    ///
    /// Returns the number of reloads queued.
    pub fn sweep_caches(&self) -> usize {
        let now = Utc::now();
        let due: Vec<Arc<SourceAdapter>> = self
            .adapters
            .read()
            .values()
            .filter(|adapter| adapter.needs_cache_reload(now))
            .cloned()
            .collect();

        for adapter in &due {
            debug!(source = adapter.id(), "Sweep reloading cache");
            adapter.spawn_cache_load();
        }
        due.len()
    }

    /// Closes and forgets every adapter.
    pub async fn close_all(&self) {
        let adapters: Vec<Arc<SourceAdapter>> =
            self.adapters.write().drain().map(|(_, a)| a).collect();
        for adapter in adapters {
            adapter.close().await;
        }
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
