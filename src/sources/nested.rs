//! Nested Source
//!
//! Exposes another adapter's logical table as a physical source, so one
//! logical table can be layered over another. The child's logical columns
//! become this source's physical columns.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use qore_core::{EngineResult, PhysicalColumn, Predicates, Value};
use tracing::debug;

use crate::adapter::{ExecuteArgs, PhysicalSource, SourceAdapter, SourceRequest};
use crate::cursor::{RawRowStream, RowCursor};

pub struct NestedSource {
    child: Arc<SourceAdapter>,
}

impl NestedSource {
    pub fn new(child: Arc<SourceAdapter>) -> Self {
        Self { child }
    }

    pub fn child(&self) -> &Arc<SourceAdapter> {
        &self.child
    }
}

#[async_trait]
impl PhysicalSource for NestedSource {
    fn kind(&self) -> &'static str {
        "nested"
    }

    fn describe(&self) -> String {
        format!("adapter {}", self.child.id())
    }

    fn is_based_on(&self, descriptor: &str) -> bool {
        self.child.id() == descriptor || self.child.is_based_on(descriptor)
    }

    fn is_pluralized(&self) -> bool {
        self.child.source().is_pluralized()
    }

    async fn pluralized_instances(&self) -> EngineResult<Vec<String>> {
        self.child.pluralized_instances().await
    }

    /// The child's generation, so a child reinitialisation refreshes this source.
    async fn modification_stamp(&self) -> Option<SystemTime> {
        Some(UNIX_EPOCH + Duration::from_nanos(self.child.state().generation))
    }

    async fn physical_columns(&self, _instance: Option<&str>) -> EngineResult<Vec<PhysicalColumn>> {
        self.child.ensure_initialised().await?;
        Ok(self
            .child
            .state()
            .logical
            .iter()
            .map(|column| PhysicalColumn::new(column.name.clone(), column.logical_type.as_str()))
            .collect())
    }

    async fn open(&self, request: SourceRequest) -> EngineResult<Box<dyn RawRowStream>> {
        let args = ExecuteArgs {
            instance: request.instance.clone(),
            pushed_where: None,
            acquire_timeout_ms: Some(request.timeout_ms),
        };
        let cursor = self
            .child
            .execute(&args, Predicates::none(), request.selected.clone())
            .await?;
        debug!(
            child = self.child.id(),
            generation = cursor.node_state().generation,
            "Opened nested row stream"
        );

        Ok(Box::new(NestedRowStream {
            child: self.child.clone(),
            columns: request.physical_columns,
            cursor: Some(cursor),
            buffer: Vec::new(),
        }))
    }
}

/// Rows of a child adapter's cursor
struct NestedRowStream {
    child: Arc<SourceAdapter>,
    columns: Arc<[PhysicalColumn]>,
    cursor: Option<RowCursor>,
    buffer: Vec<Value>,
}

#[async_trait]
impl RawRowStream for NestedRowStream {
    fn physical_columns(&self) -> &[PhysicalColumn] {
        &self.columns
    }

    async fn next_row(&mut self) -> EngineResult<Option<Vec<Value>>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        if !cursor.fetch_next_row(&mut self.buffer).await? {
            return Ok(None);
        }

        // Count-only child cursors hand back empty rows
        let mut row = std::mem::take(&mut self.buffer);
        row.resize(self.columns.len(), Value::Null);
        Ok(Some(row))
    }

    async fn close(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            self.child.recycle_or_close(cursor).await;
        }
    }
}
