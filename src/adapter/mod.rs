//! Source Adapter
//!
//! A [`SourceAdapter`] owns the lifecycle of one physical source backing a
//! logical table: schema reconciliation, the optional in-memory cache,
//! reinitialisation and handle recycling.
//!
//! All writes to the adapter's [`NodeState`] happen while holding the
//! reinit lock. Readers clone the current `Arc<NodeState>` and keep using
//! that generation for the whole life of their cursor.

pub mod node_state;
pub mod registry;
pub mod source;

pub use node_state::{resolve_mapping, ColumnMapping, NodeState};
pub use registry::AdapterRegistry;
pub use source::{PhysicalSource, SourceRequest};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use qore_core::{EngineError, EngineResult, Predicates, Value};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crate::cache::CachedRows;
use crate::config::{AdapterSettings, SourceDefinition};
use crate::cursor::{ExtractConditions, RawRowStream, RowCursor};
use crate::metrics;

/// Per-call arguments of [`SourceAdapter::execute`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteArgs {
    /// Instance (file path) to read from a pluralized source
    pub instance: Option<String>,
    /// Filter fragment the host pushed down to the physical source
    pub pushed_where: Option<String>,
    /// Overrides the default acquire timeout
    pub acquire_timeout_ms: Option<u64>,
}

impl ExecuteArgs {
    pub fn instance(instance: impl Into<String>) -> Self {
        Self {
            instance: Some(instance.into()),
            ..Self::default()
        }
    }

    pub fn with_pushed_where(mut self, fragment: impl Into<String>) -> Self {
        self.pushed_where = Some(fragment.into());
        self
    }

    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = Some(timeout_ms);
        self
    }
}

/// Cache sub-state of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    NoCache,
    Loading,
    Cached { loaded_at: DateTime<Utc> },
    Failed,
}

/// Result of a reinitialisation
#[derive(Debug)]
pub enum ReinitOutcome {
    /// A new generation was published
    NewGeneration { generation: u64 },
    /// The definition was rejected; the previous generation stays published
    KeptPrevious { generation: u64, error: EngineError },
}

impl ReinitOutcome {
    pub fn is_new_generation(&self) -> bool {
        matches!(self, ReinitOutcome::NewGeneration { .. })
    }

    /// Generation published after the call.
    pub fn generation(&self) -> u64 {
        match self {
            ReinitOutcome::NewGeneration { generation }
            | ReinitOutcome::KeptPrevious { generation, .. } => *generation,
        }
    }

    pub fn into_result(self) -> EngineResult<u64> {
        match self {
            ReinitOutcome::NewGeneration { generation } => Ok(generation),
            ReinitOutcome::KeptPrevious { error, .. } => Err(error),
        }
    }
}

/// Held while an execution opens its stream; the modification refresh waits for these to drain.
struct ExecutionMarker<'a> {
    adapter: &'a SourceAdapter,
}

impl<'a> ExecutionMarker<'a> {
    fn enter(adapter: &'a SourceAdapter) -> Self {
        adapter.executing.fetch_add(1, Ordering::SeqCst);
        Self { adapter }
    }
}

impl Drop for ExecutionMarker<'_> {
    fn drop(&mut self) {
        if self.adapter.executing.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.adapter.drained.notify_waiters();
        }
    }
}

pub struct SourceAdapter {
    id: String,
    source: Arc<dyn PhysicalSource>,
    settings: AdapterSettings,
    definition: RwLock<SourceDefinition>,
    state: RwLock<Arc<NodeState>>,
    reinit: tokio::sync::Mutex<()>,
    executing: AtomicUsize,
    drained: Notify,
    cache_state: Mutex<CacheState>,
    load_pending: AtomicBool,
    closed: AtomicBool,
}

impl SourceAdapter {
    /// Creates an uninitialised adapter. The first `execute` or an explicit
    /// [`reinitialise`](Self::reinitialise) reads the physical schema.
    pub fn new(
        definition: SourceDefinition,
        source: Arc<dyn PhysicalSource>,
        settings: AdapterSettings,
    ) -> Arc<Self> {
        let state = NodeState::uninitialised(definition.columns.clone());
        Arc::new(Self {
            id: definition.id.clone(),
            source,
            settings,
            definition: RwLock::new(definition),
            state: RwLock::new(Arc::new(state)),
            reinit: tokio::sync::Mutex::new(()),
            executing: AtomicUsize::new(0),
            drained: Notify::new(),
            cache_state: Mutex::new(CacheState::NoCache),
            load_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &Arc<dyn PhysicalSource> {
        &self.source
    }

    pub fn definition(&self) -> SourceDefinition {
        self.definition.read().clone()
    }

    /// Currently published generation.
    pub fn state(&self) -> Arc<NodeState> {
        self.state.read().clone()
    }

    pub fn cache_state(&self) -> CacheState {
        *self.cache_state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_cache_state(&self, state: CacheState) {
        *self.cache_state.lock() = state;
    }

    /// Swaps in a new generation. Callers hold the reinit lock.
    fn publish(&self, state: NodeState) -> Arc<NodeState> {
        let state = Arc::new(state);
        *self.state.write() = state.clone();
        debug!(source = %self.id, generation = state.generation, "Published node state");
        state
    }

    fn caches(&self, definition: &SourceDefinition) -> bool {
        definition.cache.enabled && !self.source.is_pluralized()
    }

    // ==================== Reinitialisation ====================

    /// Rebuilds the adapter's view of its source from `definition`.
    ///
    /// On failure the previous generation stays published and the error is
    /// returned inside [`ReinitOutcome::KeptPrevious`].
    #[instrument(skip(self, definition), fields(source = %self.id))]
    pub async fn reinitialise(self: &Arc<Self>, definition: SourceDefinition) -> ReinitOutcome {
        let _guard = self.reinit.lock().await;
        let previous = self.state();

        if self.is_closed() {
            return ReinitOutcome::KeptPrevious {
                generation: previous.generation,
                error: EngineError::closed(&self.id),
            };
        }

        match self.build_generation(&definition, &previous).await {
            Ok((next, needs_load)) => {
                let caches = self.caches(&definition);
                *self.definition.write() = definition;
                let published = self.publish(next);

                if !caches {
                    self.set_cache_state(CacheState::NoCache);
                } else if let Some(cache) = &published.cache {
                    self.set_cache_state(CacheState::Cached {
                        loaded_at: cache.loaded_at(),
                    });
                }
                if needs_load {
                    self.spawn_cache_load();
                }

                info!(
                    generation = published.generation,
                    physical_columns = published.physical.len(),
                    cached = published.cache.is_some(),
                    "Adapter reinitialised"
                );
                ReinitOutcome::NewGeneration {
                    generation: published.generation,
                }
            }
            Err(error) => {
                warn!(
                    generation = previous.generation,
                    error = %error,
                    "Reinitialisation failed, keeping previous generation"
                );
                ReinitOutcome::KeptPrevious {
                    generation: previous.generation,
                    error,
                }
            }
        }
    }

    /// Builds the next generation. Returns it with whether a cache load must follow.
    async fn build_generation(
        &self,
        definition: &SourceDefinition,
        previous: &NodeState,
    ) -> EngineResult<(NodeState, bool)> {
        definition.validate()?;
        if definition.id != self.id {
            return Err(EngineError::configuration(format!(
                "Definition {} cannot reinitialise adapter {}",
                definition.id, self.id
            )));
        }
        if definition.physical != self.definition.read().physical {
            return Err(EngineError::configuration(format!(
                "{}: the physical source cannot change in place; register the definition again",
                self.id
            )));
        }

        let instance = if self.source.is_pluralized() {
            let instances = self.source.pluralized_instances().await?;
            match instances.into_iter().next() {
                Some(first) => Some(first),
                None => {
                    return Err(EngineError::configuration(format!(
                        "{}: no instance matches {}",
                        self.id,
                        self.source.describe()
                    )))
                }
            }
        } else {
            None
        };

        let physical = self.source.physical_columns(instance.as_deref()).await?;
        let stamp = self.source.modification_stamp().await;
        let mapping = resolve_mapping(definition, &physical);
        self.source.configure(definition, &self.settings);

        let mut next = NodeState::new(
            previous.generation + 1,
            definition.columns.clone(),
            physical,
            mapping,
            stamp,
        );

        if !self.caches(definition) {
            return Ok((next, false));
        }

        let reusable = previous
            .cache
            .as_ref()
            .filter(|_| previous.same_layout(&next) && previous.resource_stamp == stamp);
        match reusable {
            Some(cache) => {
                let indexed = indexed_positions(definition);
                next.cache = Some(Arc::new(cache.reindexed(&self.id, &next, &indexed)));
                Ok((next, false))
            }
            None => Ok((next, true)),
        }
    }

    /// Reinitialises with the current definition unless a generation exists.
    pub async fn ensure_initialised(self: &Arc<Self>) -> EngineResult<()> {
        if self.state().is_initialised() {
            return Ok(());
        }
        let definition = self.definition();
        let outcome = self.reinitialise(definition).await;
        if !outcome.is_new_generation() && self.state().is_initialised() {
            // Someone else initialised it while we waited
            return Ok(());
        }
        outcome.into_result().map(|_| ())
    }

    // ==================== Execution ====================

    /// Opens a cursor over the rows matching `predicates`, projecting the
    /// logical positions in `projection` (empty for count-only).
    #[instrument(
        skip(self, args, predicates, projection),
        fields(source = %self.id, instance = ?args.instance)
    )]
    pub async fn execute(
        self: &Arc<Self>,
        args: &ExecuteArgs,
        predicates: Predicates,
        projection: Vec<usize>,
    ) -> EngineResult<RowCursor> {
        if self.is_closed() {
            return Err(EngineError::closed(&self.id));
        }
        if self.source.is_pluralized() && args.instance.is_none() {
            return Err(EngineError::configuration(format!(
                "{}: a pluralized source needs an instance to execute against",
                self.id
            )));
        }

        self.ensure_initialised().await?;
        self.refresh_if_modified().await?;

        let state = self.state();
        let conditions = ExtractConditions::new(predicates, projection);
        conditions.validate(state.logical.len())?;
        let predicates = conditions.predicates.coerced_to(&state.logical)?;
        let conditions = ExtractConditions::new(predicates, conditions.projection);

        if let Some(cache) = state.cache.clone() {
            let selection = cache.candidate_rows(&conditions.predicates);
            debug!(
                generation = state.generation,
                narrowed = selection.as_ref().map(|rows| rows.len()),
                "Reading from cache"
            );
            let stream = cache.stream(state.physical.clone(), selection);
            return Ok(RowCursor::new(Box::new(stream), state, conditions).from_cache());
        }

        let _marker = ExecutionMarker::enter(self);
        let selected = physical_selection(&state, &conditions);
        let request = SourceRequest {
            instance: args.instance.clone(),
            physical_columns: state.physical.clone(),
            selected,
            pushed_where: args.pushed_where.clone(),
            cache_mode: false,
            timeout_ms: args
                .acquire_timeout_ms
                .unwrap_or(self.settings.acquire_timeout_ms),
        };
        let stream = self.source.open(request).await?;
        Ok(RowCursor::new(stream, state, conditions))
    }

    /// Detects a modified backing resource and rebuilds the generation once.
    ///
    /// Only one caller performs the refresh; the others wait on the reinit
    /// lock and then find the stamp current.
    async fn refresh_if_modified(self: &Arc<Self>) -> EngineResult<()> {
        if self.source.is_pluralized() {
            return Ok(());
        }

        let stamp = self.source.modification_stamp().await;
        if stamp == self.state().resource_stamp {
            return Ok(());
        }

        let _guard = self.reinit.lock().await;
        let stamp = self.source.modification_stamp().await;
        let current = self.state();
        if stamp == current.resource_stamp {
            debug!(source = %self.id, "Resource refreshed by another caller");
            return Ok(());
        }

        info!(source = %self.id, "Backing resource modified, refreshing");
        self.publish_refreshed(&current, stamp).await?;

        if self.caches(&self.definition()) {
            self.spawn_cache_load();
        }
        Ok(())
    }

    /// Rereads the physical schema and publishes it, uncached, as the next
    /// generation stamped with `stamp`. Callers hold the reinit lock.
    async fn publish_refreshed(
        &self,
        current: &NodeState,
        stamp: Option<SystemTime>,
    ) -> EngineResult<Arc<NodeState>> {
        self.wait_for_executions().await;
        self.source.purge().await;

        let definition = self.definition();
        let physical = self.source.physical_columns(None).await?;
        let mapping = resolve_mapping(&definition, &physical);
        let next = NodeState::new(
            current.generation + 1,
            definition.columns.clone(),
            physical,
            mapping,
            stamp,
        );
        Ok(self.publish(next))
    }

    async fn wait_for_executions(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.executing.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Returns a finished cursor's stream to the source when it can be
    /// rewound and reused, and closes it otherwise.
    ///
    /// A stream opened under an older resource stamp or physical layout than
    /// the published one is always closed.
    pub async fn recycle_or_close(&self, cursor: RowCursor) {
        if cursor.is_closed() {
            return;
        }
        let from_cache = cursor.is_from_cache();
        let opened_under = cursor.node_state().clone();
        let mut stream: Box<dyn RawRowStream> = cursor.into_stream();
        if from_cache {
            return;
        }

        // Held so a refresh cannot purge the pool between the check and the push
        let Ok(_guard) = self.reinit.try_lock() else {
            stream.close().await;
            return;
        };
        let current = self.state();
        let stale = opened_under.resource_stamp != current.resource_stamp
            || !opened_under.same_layout(&current);
        if stale {
            debug!(
                source = %self.id,
                opened_generation = opened_under.generation,
                generation = current.generation,
                "Closing stream of a superseded generation"
            );
        }

        let recyclable = !stale
            && !self.is_closed()
            && !self.source.is_pluralized()
            && stream.is_reusable();
        if recyclable && stream.reinitialise().await {
            self.source.recycle(stream, false).await;
        } else {
            stream.close().await;
        }
    }

    // ==================== Cache ====================

    /// Queues a background cache load unless one is already queued.
    pub fn spawn_cache_load(self: &Arc<Self>) {
        if self.is_closed() || self.load_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_cache_state(CacheState::Loading);
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = adapter.ensure_initialised().await {
                adapter.load_pending.store(false, Ordering::SeqCst);
                adapter.set_cache_state(CacheState::Failed);
                warn!(source = %adapter.id, error = %e, "Cannot load cache of an uninitialised adapter");
                return;
            }
            if let Err(e) = adapter.reload_cache().await {
                debug!(source = %adapter.id, error = %e, "Background cache load ended without a cache");
            }
        });
    }

    /// Loads the full row set and publishes it as a new generation.
    ///
    /// On failure the adapter falls back to direct reads and the cache is
    /// marked failed for the next sweep. Returns the number of cached rows.
    #[instrument(skip(self), fields(source = %self.id))]
    pub async fn reload_cache(self: &Arc<Self>) -> EngineResult<usize> {
        let _guard = self.reinit.lock().await;
        self.load_pending.store(false, Ordering::SeqCst);

        if self.is_closed() {
            return Err(EngineError::closed(&self.id));
        }
        let definition = self.definition();
        if !self.caches(&definition) {
            self.set_cache_state(CacheState::NoCache);
            return Ok(0);
        }

        let mut state = self.state();
        if !state.is_initialised() {
            self.set_cache_state(CacheState::Failed);
            return Err(EngineError::cache_load(&self.id, "adapter is not initialised"));
        }

        self.set_cache_state(CacheState::Loading);
        let stamp = self.source.modification_stamp().await;
        if stamp != state.resource_stamp {
            info!("Backing resource modified before cache load, refreshing");
            state = match self.publish_refreshed(&state, stamp).await {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    self.set_cache_state(CacheState::Failed);
                    warn!(error = %e, "Refresh before cache load failed");
                    return Err(EngineError::cache_load(&self.id, e.to_string()));
                }
            };
        }

        match self.drain_rows(&state).await {
            Ok(rows) => {
                let stamp = self.source.modification_stamp().await;
                if stamp != state.resource_stamp {
                    info!(rows = rows.len(), "Backing resource modified during cache load, discarding rows");
                    metrics::record_cache_load(0, false);
                    if let Err(e) = self.publish_refreshed(&state, stamp).await {
                        self.set_cache_state(CacheState::Failed);
                        return Err(EngineError::cache_load(&self.id, e.to_string()));
                    }
                    self.spawn_cache_load();
                    return Err(EngineError::cache_load(
                        &self.id,
                        "resource changed while loading; reload queued",
                    ));
                }

                let cached = CachedRows::build(&self.id, rows, &state, &indexed_positions(&definition));
                let count = cached.len();
                metrics::record_cache_load(count, true);
                let loaded_at = cached.loaded_at();
                let published = self.publish(state.with_cache(Some(Arc::new(cached))));
                self.set_cache_state(CacheState::Cached { loaded_at });
                info!(rows = count, generation = published.generation, "Cache loaded");
                Ok(count)
            }
            Err(e) => {
                metrics::record_cache_load(0, false);
                if state.cache.is_some() {
                    self.publish(state.with_cache(None));
                }
                self.set_cache_state(CacheState::Failed);
                warn!(error = %e, "Cache load failed, reading the source directly");
                Err(EngineError::cache_load(&self.id, e.to_string()))
            }
        }
    }

    async fn drain_rows(&self, state: &NodeState) -> EngineResult<Vec<Vec<Value>>> {
        let request = SourceRequest {
            instance: None,
            physical_columns: state.physical.clone(),
            selected: state.mapped_physical_columns(),
            pushed_where: None,
            cache_mode: true,
            timeout_ms: self.settings.acquire_timeout_ms,
        };
        let mut stream = self.source.open(request).await?;

        let mut rows = Vec::with_capacity(stream.size_hint().unwrap_or(0));
        let drained = loop {
            match stream.next_row().await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break Ok(rows),
                Err(e) => break Err(e),
            }
        };
        stream.close().await;
        drained
    }

    /// Whether the periodic sweep should reload this adapter's cache at `now`.
    pub fn needs_cache_reload(&self, now: DateTime<Utc>) -> bool {
        if self.is_closed() || self.load_pending.load(Ordering::SeqCst) {
            return false;
        }
        let definition = self.definition.read();
        if !self.caches(&definition) {
            return false;
        }
        let ttl = definition.cache.ttl_secs.map(Duration::from_secs);
        match self.cache_state() {
            CacheState::Loading => false,
            CacheState::Failed | CacheState::NoCache => true,
            CacheState::Cached { .. } => match &self.state().cache {
                Some(cache) => cache.is_expired(ttl, now),
                None => true,
            },
        }
    }

    // ==================== Lifecycle ====================

    /// Whether this adapter reads the given endpoint, table, path or mask.
    pub fn is_based_on(&self, descriptor: &str) -> bool {
        self.source.is_based_on(descriptor)
    }

    /// Instances behind a pluralized source; empty otherwise.
    pub async fn pluralized_instances(&self) -> EngineResult<Vec<String>> {
        if !self.source.is_pluralized() {
            return Ok(Vec::new());
        }
        self.source.pluralized_instances().await
    }

    /// Releases the cache and every handle. Later executions fail.
    #[instrument(skip(self), fields(source = %self.id))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = self.reinit.lock().await;
        let state = self.state();
        if state.cache.is_some() {
            self.publish(state.with_cache(None));
        }
        self.set_cache_state(CacheState::NoCache);
        self.source.close().await;
        info!("Adapter closed");
    }
}

impl std::fmt::Debug for SourceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceAdapter")
            .field("id", &self.id)
            .field("source", &self.source.describe())
            .field("generation", &self.state().generation)
            .field("cache_state", &self.cache_state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Logical positions of the indexed columns a definition names.
fn indexed_positions(definition: &SourceDefinition) -> Vec<usize> {
    definition
        .cache
        .indexes
        .iter()
        .filter_map(|name| definition.logical_position(name))
        .collect()
}

/// Physical positions a cursor with `conditions` reads.
fn physical_selection(state: &NodeState, conditions: &ExtractConditions) -> Vec<usize> {
    let mut selected: Vec<usize> = conditions
        .required_columns()
        .into_iter()
        .filter_map(|logical| state.mapping.get(logical).and_then(|m| m.physical_index()))
        .collect();
    selected.sort_unstable();
    selected.dedup();
    selected
}
