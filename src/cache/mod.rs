//! In-memory row cache
//!
//! A [`CachedRows`] is one complete load of a source: the physical rows in
//! load order plus the secondary indexes built over them. It is immutable
//! once built and travels inside a `NodeState`, so mapping and cache always
//! change together.

pub mod index;

pub use index::{IndexAbandoned, IndexBucket, IndexKey, IndexLookup, SecondaryIndex};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qore_core::{PhysicalColumn, Predicates, Value};
use tracing::{debug, warn};

use crate::adapter::node_state::{ColumnMapping, NodeState};
use crate::cursor::VecRowStream;
use crate::metrics;

/// Share of an index's keys a narrowed scan may still cover, in percent
const INDEX_SELECTIVITY_PERCENT: usize = 30;

/// One complete, immutable cache load
#[derive(Debug, Clone)]
pub struct CachedRows {
    rows: Arc<[Vec<Value>]>,
    indexes: BTreeMap<usize, SecondaryIndex>,
    loaded_at: DateTime<Utc>,
}

impl CachedRows {
    /// Builds the indexes for `indexed` logical columns over freshly loaded rows.
    pub fn build(
        source_id: &str,
        rows: Vec<Vec<Value>>,
        state: &NodeState,
        indexed: &[usize],
    ) -> Self {
        let mut cached = Self {
            rows: rows.into(),
            indexes: BTreeMap::new(),
            loaded_at: Utc::now(),
        };
        cached.index_columns(source_id, state, indexed);
        cached
    }

    /// Same rows and load time, indexes rebuilt against `state`.
    pub fn reindexed(&self, source_id: &str, state: &NodeState, indexed: &[usize]) -> Self {
        let mut cached = Self {
            rows: self.rows.clone(),
            indexes: BTreeMap::new(),
            loaded_at: self.loaded_at,
        };
        cached.index_columns(source_id, state, indexed);
        cached
    }

    fn index_columns(&mut self, source_id: &str, state: &NodeState, indexed: &[usize]) {
        for &logical in indexed {
            let Some(column) = state.logical.get(logical) else {
                continue;
            };
            let ColumnMapping::Mapped(physical) = state.mapping[logical] else {
                debug!(source = source_id, column = %column.name, "Not indexing a missing column");
                continue;
            };
            match SecondaryIndex::build(logical, physical, column.logical_type, &self.rows) {
                Ok(index) => {
                    debug!(
                        source = source_id,
                        column = %column.name,
                        keys = index.key_count(),
                        "Built secondary index"
                    );
                    self.indexes.insert(logical, index);
                }
                Err(reason) => {
                    metrics::record_index_abandoned();
                    warn!(
                        source = source_id,
                        column = %column.name,
                        reason = %reason,
                        "Abandoning index on column"
                    );
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn index(&self, logical_column: usize) -> Option<&SecondaryIndex> {
        self.indexes.get(&logical_column)
    }

    pub fn indexed_columns(&self) -> impl Iterator<Item = usize> + '_ {
        self.indexes.keys().copied()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Whether the load is older than `ttl` at `now`. No TTL means no expiry.
    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.loaded_at >= ttl,
            Err(_) => false,
        }
    }

    /// Row numbers an index can narrow the scan to, in load order.
    ///
    /// Uses the first indexed column the AND group constrains. Range scans
    /// are only worth it when they keep at most 30% of the index's keys;
    /// equality lookups are always used. `None` means scan everything.
    pub fn candidate_rows(&self, predicates: &Predicates) -> Option<Vec<usize>> {
        let (total, lookup) = predicates.and_group.iter().find_map(|qualifier| {
            let index = self.indexes.get(&qualifier.column)?;
            let lookup = index.lookup(&predicates.and_group)?;
            Some((index.key_count(), lookup))
        })?;

        if !lookup.equality && lookup.keys * 100 > total * INDEX_SELECTIVITY_PERCENT {
            debug!(
                keys = lookup.keys,
                total, "Index range too wide, scanning all cached rows"
            );
            return None;
        }

        let mut rows = lookup.rows;
        rows.sort_unstable();
        Some(rows)
    }

    /// Stream over the cached rows, restricted to `selection` when given.
    pub fn stream(
        &self,
        physical: Arc<[PhysicalColumn]>,
        selection: Option<Vec<usize>>,
    ) -> VecRowStream {
        let stream = VecRowStream::new(physical, self.rows.clone());
        match selection {
            Some(selection) => stream.with_selection(selection),
            None => stream,
        }
    }
}
