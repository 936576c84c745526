//! Row cursors
//!
//! A [`RowCursor`] wraps one raw physical row stream and turns its rows into
//! logical rows: projected columns are read through the column mapping,
//! missing columns are written as null without touching the physical row,
//! values are coerced into their logical types, and rows failing the local
//! predicates are skipped.

pub mod stream;

pub use stream::{RawRowStream, VecRowStream};

use std::collections::BTreeSet;
use std::sync::Arc;

use qore_core::{EngineError, EngineResult, LogicalColumn, Predicates, Value};
use tracing::{debug, warn};

use crate::adapter::node_state::{ColumnMapping, NodeState};
use crate::metrics;

/// What the host wants out of a cursor: local predicates and projected logical columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractConditions {
    /// Predicates evaluated locally, on logical positions
    pub predicates: Predicates,
    /// 0-based logical positions to materialise; empty means count-only
    pub projection: Vec<usize>,
}

impl ExtractConditions {
    pub fn new(predicates: Predicates, projection: Vec<usize>) -> Self {
        Self {
            predicates,
            projection,
        }
    }

    /// Projects every logical column of `state`.
    pub fn all_columns(state: &NodeState) -> Self {
        Self::new(Predicates::none(), (0..state.logical.len()).collect())
    }

    pub fn is_count_only(&self) -> bool {
        self.projection.is_empty()
    }

    /// Logical positions that must be read: the projection plus every predicate column.
    pub fn required_columns(&self) -> BTreeSet<usize> {
        let mut columns: BTreeSet<usize> = self.projection.iter().copied().collect();
        columns.extend(self.predicates.columns());
        columns
    }

    /// Fails when a projected or filtered position is outside the logical table.
    pub fn validate(&self, logical_width: usize) -> EngineResult<()> {
        if let Some(bad) = self
            .required_columns()
            .into_iter()
            .find(|&c| c >= logical_width)
        {
            return Err(EngineError::configuration(format!(
                "Column {} referenced, but the logical table has {} columns",
                bad + 1,
                logical_width
            )));
        }
        Ok(())
    }
}

/// Cursor over one raw stream, producing logical rows
pub struct RowCursor {
    stream: Box<dyn RawRowStream>,
    state: Arc<NodeState>,
    conditions: ExtractConditions,
    required: Vec<usize>,
    projected: Vec<bool>,
    row_index: u64,
    exhausted: bool,
    closed: bool,
    from_cache: bool,
}

impl RowCursor {
    /// Builds a cursor. `conditions` must already be validated against `state`.
    pub fn new(
        stream: Box<dyn RawRowStream>,
        state: Arc<NodeState>,
        conditions: ExtractConditions,
    ) -> Self {
        let mut cursor = Self {
            stream,
            state,
            conditions: ExtractConditions::default(),
            required: Vec::new(),
            projected: Vec::new(),
            row_index: 0,
            exhausted: false,
            closed: false,
            from_cache: false,
        };
        cursor.apply_conditions(conditions);
        cursor
    }

    pub(crate) fn from_cache(mut self) -> Self {
        self.from_cache = true;
        self
    }

    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    fn apply_conditions(&mut self, conditions: ExtractConditions) {
        let width = self.state.logical.len();
        self.required = conditions.required_columns().into_iter().collect();
        self.projected = vec![false; width];
        for &column in &conditions.projection {
            if let Some(slot) = self.projected.get_mut(column) {
                *slot = true;
            }
        }
        self.conditions = conditions;
    }

    /// Replaces predicates and projection. Only allowed before the first fetch.
    pub fn set_extract_conditions(&mut self, conditions: ExtractConditions) -> EngineResult<()> {
        if !self.is_before_first() {
            return Err(EngineError::execution_error(
                "Extract conditions can only change before the first fetch",
            ));
        }
        conditions.validate(self.state.logical.len())?;
        let predicates = conditions.predicates.coerced_to(&self.state.logical)?;
        self.apply_conditions(ExtractConditions::new(predicates, conditions.projection));
        Ok(())
    }

    /// Fetches the next matching row into `row`.
    ///
    /// `row` is resized to the logical width, with non-projected positions
    /// null. In count-only mode it is left empty. Returns `false` once the
    /// stream is exhausted.
    pub async fn fetch_next_row(&mut self, row: &mut Vec<Value>) -> EngineResult<bool> {
        if self.closed {
            return Err(EngineError::execution_error("Cursor is closed"));
        }
        if self.exhausted {
            return Ok(false);
        }

        loop {
            let Some(physical) = self.stream.next_row().await? else {
                self.exhausted = true;
                debug!(rows = self.row_index, "Row stream exhausted");
                return Ok(false);
            };

            row.clear();
            row.resize(self.state.logical.len(), Value::Null);
            for &column in &self.required {
                row[column] = self.logical_value(column, &physical);
            }

            if !self.conditions.predicates.is_empty() && !self.conditions.predicates.matches(row) {
                continue;
            }

            if self.conditions.is_count_only() {
                row.clear();
            } else {
                for (column, projected) in self.projected.iter().enumerate() {
                    if !projected {
                        row[column] = Value::Null;
                    }
                }
            }

            self.row_index += 1;
            return Ok(true);
        }
    }

    /// Value of one logical column, read through the mapping.
    fn logical_value(&self, column: usize, physical: &[Value]) -> Value {
        let ColumnMapping::Mapped(index) = self.state.mapping[column] else {
            return Value::Null;
        };
        let Some(raw) = physical.get(index) else {
            return Value::Null;
        };
        let logical = &self.state.logical[column];
        match raw.coerce(logical.logical_type) {
            Ok(value) => value,
            Err(e) => {
                metrics::record_value_nulled();
                warn!(
                    column = %logical.name,
                    physical_column = index + 1,
                    row = self.row_index + 1,
                    error = %e,
                    "Value conversion failed, returning NULL"
                );
                Value::Null
            }
        }
    }

    /// Logical metadata of the rows this cursor produces.
    pub fn meta_data(&self) -> &[LogicalColumn] {
        &self.state.logical
    }

    pub fn node_state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Total number of matching rows.
    ///
    /// Known up front for unfiltered in-memory streams; otherwise the
    /// remaining rows are drained and counted.
    pub async fn row_count(&mut self) -> EngineResult<u64> {
        if self.row_index == 0 && !self.exhausted && self.conditions.predicates.is_empty() {
            if let Some(size) = self.stream.size_hint() {
                return Ok(size as u64);
            }
        }

        let mut scratch = Vec::new();
        while self.fetch_next_row(&mut scratch).await? {}
        Ok(self.row_index)
    }

    pub fn is_before_first(&self) -> bool {
        self.row_index == 0
    }

    pub fn is_scrollable(&self) -> bool {
        self.stream.is_scrollable()
    }

    /// Whether the underlying raw stream can be re-executed after this use.
    pub fn is_reusable(&self) -> bool {
        self.stream.is_reusable()
    }

    pub fn rows_fetched(&self) -> u64 {
        self.row_index
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stream.close().await;
        }
    }

    /// Hands back the raw stream for recycling.
    pub fn into_stream(self) -> Box<dyn RawRowStream> {
        self.stream
    }
}

impl std::fmt::Debug for RowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("generation", &self.state.generation)
            .field("row_index", &self.row_index)
            .field("exhausted", &self.exhausted)
            .field("from_cache", &self.from_cache)
            .finish()
    }
}
