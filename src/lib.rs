// QoreDB Adapters - source adapter layer for federated queries
// Core library

pub mod adapter;
pub mod cache;
pub mod config;
pub mod cursor;
pub mod metrics;
pub mod observability;
pub mod pool;
pub mod sources;
pub mod throttle;

pub use adapter::{
    AdapterRegistry, CacheState, ColumnMapping, ExecuteArgs, NodeState, PhysicalSource,
    ReinitOutcome, SourceAdapter, SourceRequest,
};
pub use cache::{CachedRows, IndexBucket, IndexKey, SecondaryIndex};
pub use config::{
    AdapterConfigFile, AdapterSettings, CacheOptions, MappingMode, PhysicalSpec, SourceDefinition,
};
pub use cursor::{ExtractConditions, RawRowStream, RowCursor, VecRowStream};
pub use pool::{PoolKey, ResourcePool, ResourceRegistry};
pub use qore_core::{
    EngineError, EngineResult, LogicalColumn, LogicalType, Operator, PhysicalColumn, Predicates,
    Qualifier, Value,
};
pub use sources::{FileSource, MemorySource, NestedSource, RelationalSource};
pub use throttle::{ConnectionThrottle, Connector, ThrottleSettings};

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Process-wide wiring of settings, shared pools and registered adapters
pub struct AdapterRuntime {
    settings: AdapterSettings,
    throttle: Arc<ConnectionThrottle>,
    adapters: Arc<AdapterRegistry>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterRuntime {
    pub fn new(settings: AdapterSettings) -> Self {
        let resources = Arc::new(ResourceRegistry::new());
        let throttle = Arc::new(ConnectionThrottle::new(
            resources,
            ThrottleSettings::from(&settings),
        ));

        Self {
            settings,
            throttle,
            adapters: Arc::new(AdapterRegistry::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Builds a runtime from a config file and registers every source it declares, in order.
    pub async fn from_config_file(path: &Path) -> EngineResult<Self> {
        let file = AdapterConfigFile::load(path)?;
        let runtime = Self::new(file.settings);
        for definition in file.sources {
            runtime.register_definition(definition).await?;
        }
        Ok(runtime)
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        self.throttle.resources()
    }

    pub fn throttle(&self) -> &Arc<ConnectionThrottle> {
        &self.throttle
    }

    pub fn adapters(&self) -> &Arc<AdapterRegistry> {
        &self.adapters
    }

    pub fn adapter(&self, id: &str) -> EngineResult<Arc<SourceAdapter>> {
        self.adapters
            .get(id)
            .ok_or_else(|| EngineError::source_not_found(id))
    }

    /// Creates the physical source a definition describes.
    pub fn build_source(
        &self,
        definition: &SourceDefinition,
    ) -> EngineResult<Arc<dyn PhysicalSource>> {
        let Some(physical) = &definition.physical else {
            return Err(EngineError::configuration(format!(
                "{}: no physical source defined",
                definition.id
            )));
        };

        let source: Arc<dyn PhysicalSource> = match physical {
            PhysicalSpec::Relational { url, table } => Arc::new(RelationalSource::new(
                url.as_str(),
                table.as_str(),
                self.throttle.clone(),
                &self.settings,
            )?),
            PhysicalSpec::File { path, delimiter } => Arc::new(FileSource::new(
                path.as_str(),
                *delimiter,
                self.resources().clone(),
                &self.settings,
            )?),
            PhysicalSpec::Nested { adapter } => Arc::new(NestedSource::new(self.adapter(adapter)?)),
        };
        Ok(source)
    }

    /// Registers an adapter over `source`, closing any adapter it replaces.
    pub async fn register(
        &self,
        definition: SourceDefinition,
        source: Arc<dyn PhysicalSource>,
    ) -> Arc<SourceAdapter> {
        let adapter = SourceAdapter::new(definition, source, self.settings.clone());
        if let Some(previous) = self.adapters.register(adapter.clone()) {
            info!(source = adapter.id(), "Replacing registered adapter");
            previous.close().await;
        }
        if adapter.needs_cache_reload(Utc::now()) {
            adapter.spawn_cache_load();
        }
        adapter
    }

    /// Validates a definition, builds its source and registers the adapter.
    pub async fn register_definition(
        &self,
        definition: SourceDefinition,
    ) -> EngineResult<Arc<SourceAdapter>> {
        definition.validate()?;
        let source = self.build_source(&definition)?;
        debug!(source = %definition.id, kind = source.kind(), "Registering adapter");
        Ok(self.register(definition, source).await)
    }

    /// Starts the periodic cache sweep. Does nothing when it already runs.
    pub fn start_cache_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let adapters = self.adapters.clone();
        let period = self.settings.cache_sweep_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let queued = adapters.sweep_caches();
                if queued > 0 {
                    debug!(queued, "Cache sweep queued reloads");
                }
            }
        }));
        info!(interval_secs = period.as_secs(), "Cache sweeper started");
    }

    /// Stops the sweeper and closes every adapter.
    pub async fn shutdown(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        self.adapters.close_all().await;
        info!("Adapter runtime shut down");
    }
}

impl Default for AdapterRuntime {
    fn default() -> Self {
        Self::new(AdapterSettings::default())
    }
}

impl Drop for AdapterRuntime {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(id: &str) -> SourceDefinition {
        SourceDefinition::new(id, "LT0", vec![LogicalColumn::new("n", LogicalType::Integer)])
    }

    #[test]
    fn build_source_needs_a_physical_spec() {
        let runtime = AdapterRuntime::default();
        let err = runtime.build_source(&definition("a")).err().unwrap();
        assert!(matches!(err, EngineError::Configuration { .. }));

        let nested = definition("b").with_physical(PhysicalSpec::Nested {
            adapter: "absent".to_string(),
        });
        assert!(matches!(
            runtime.build_source(&nested).err().unwrap(),
            EngineError::SourceNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn register_replaces_and_closes() {
        let runtime = AdapterRuntime::default();
        let source = || {
            Arc::new(MemorySource::new(
                "mem://n",
                vec![PhysicalColumn::new("N", "BIGINT")],
                vec![vec![Value::Int(7)]],
            )) as Arc<dyn PhysicalSource>
        };

        let first = runtime.register(definition("a"), source()).await;
        let second = runtime.register(definition("a"), source()).await;
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(runtime.adapters().len(), 1);

        runtime.start_cache_sweeper();
        runtime.start_cache_sweeper();
        runtime.shutdown().await;
        assert!(second.is_closed());
        assert!(runtime.adapters().is_empty());
    }
}
