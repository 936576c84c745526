use std::sync::Arc;

use async_trait::async_trait;
use qore_core::{EngineResult, PhysicalColumn, Value};

/// A forward-only stream of physical rows produced by one source read
///
/// Every row carries one value per entry of [`physical_columns`](Self::physical_columns).
#[async_trait]
pub trait RawRowStream: Send {
    fn physical_columns(&self) -> &[PhysicalColumn];

    /// Next physical row, or `None` once exhausted.
    async fn next_row(&mut self) -> EngineResult<Option<Vec<Value>>>;

    /// Row count, when known without reading.
    fn size_hint(&self) -> Option<usize> {
        None
    }

    fn is_scrollable(&self) -> bool {
        false
    }

    /// Whether the stream may be rewound and pooled after use.
    fn is_reusable(&self) -> bool {
        false
    }

    /// Rewinds to the first row. Returns `false` if the stream cannot be rewound.
    async fn reinitialise(&mut self) -> bool {
        false
    }

    /// Releases whatever the stream holds. Called at most once.
    async fn close(&mut self) {}
}

/// Stream over rows already held in memory
///
/// Cheap to clone: rows are shared. An optional selection restricts the
/// stream to the listed row numbers, in the listed order.
#[derive(Debug, Clone)]
pub struct VecRowStream {
    columns: Arc<[PhysicalColumn]>,
    rows: Arc<[Vec<Value>]>,
    selection: Option<Arc<[usize]>>,
    position: usize,
}

impl VecRowStream {
    pub fn new(
        columns: impl Into<Arc<[PhysicalColumn]>>,
        rows: impl Into<Arc<[Vec<Value>]>>,
    ) -> Self {
        Self {
            columns: columns.into(),
            rows: rows.into(),
            selection: None,
            position: 0,
        }
    }

    pub fn with_selection(mut self, selection: Vec<usize>) -> Self {
        self.selection = Some(selection.into());
        self
    }

    fn len(&self) -> usize {
        match &self.selection {
            Some(selection) => selection.len(),
            None => self.rows.len(),
        }
    }
}

#[async_trait]
impl RawRowStream for VecRowStream {
    fn physical_columns(&self) -> &[PhysicalColumn] {
        &self.columns
    }

    async fn next_row(&mut self) -> EngineResult<Option<Vec<Value>>> {
        while self.position < self.len() {
            let index = match &self.selection {
                Some(selection) => selection[self.position],
                None => self.position,
            };
            self.position += 1;
            if let Some(row) = self.rows.get(index) {
                return Ok(Some(row.clone()));
            }
        }
        Ok(None)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.len())
    }

    fn is_scrollable(&self) -> bool {
        true
    }

    fn is_reusable(&self) -> bool {
        true
    }

    async fn reinitialise(&mut self) -> bool {
        self.position = 0;
        true
    }
}
