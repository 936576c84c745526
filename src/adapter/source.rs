//! Physical Source Trait
//!
//! The downstream contract every concrete source implements. An adapter
//! never talks to a database, file or child adapter directly; it only asks
//! its source for physical columns and raw row streams.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use qore_core::{EngineResult, PhysicalColumn};

use crate::config::{AdapterSettings, SourceDefinition};
use crate::cursor::RawRowStream;

/// One request for a raw row stream
#[derive(Debug, Clone)]
pub struct SourceRequest {
    /// File path of a pluralized source; `None` otherwise
    pub instance: Option<String>,
    /// Physical schema of the generation the stream is opened for
    pub physical_columns: Arc<[PhysicalColumn]>,
    /// Physical positions the caller will read, ascending; empty for count-only reads
    pub selected: Vec<usize>,
    /// Filter fragment pushed down by the host, in the source's own dialect
    pub pushed_where: Option<String>,
    /// The stream loads an in-memory cache
    pub cache_mode: bool,
    /// Bound on the wait for a pooled handle
    pub timeout_ms: u64,
}

/// Downstream contract of a physical source
///
/// Streams returned by [`open`](Self::open) always yield rows as wide as
/// `physical_columns`; positions outside `selected` may be null.
#[async_trait]
pub trait PhysicalSource: Send + Sync {
    /// Returns the source kind (e.g. "relational", "file")
    fn kind(&self) -> &'static str;

    /// Credential-free description for log lines.
    fn describe(&self) -> String;

    /// Whether this source reads `descriptor` (an endpoint, table, path or mask).
    fn is_based_on(&self, descriptor: &str) -> bool;

    fn is_pluralized(&self) -> bool {
        false
    }

    /// Concrete instances behind a pluralized source.
    async fn pluralized_instances(&self) -> EngineResult<Vec<String>> {
        Ok(Vec::new())
    }

    /// Last-modified stamp of the backing resource, when it has one.
    async fn modification_stamp(&self) -> Option<SystemTime> {
        None
    }

    async fn physical_columns(&self, instance: Option<&str>) -> EngineResult<Vec<PhysicalColumn>>;

    /// Applies pool sizes and attempt caps of a new definition.
    fn configure(&self, _definition: &SourceDefinition, _settings: &AdapterSettings) {}

    async fn open(&self, request: SourceRequest) -> EngineResult<Box<dyn RawRowStream>>;

    /// Takes back a rewound stream for reuse. The default closes it.
    async fn recycle(&self, mut stream: Box<dyn RawRowStream>, _cache_mode: bool) {
        stream.close().await;
    }

    /// Drops pooled handles; called when the backing resource changed.
    async fn purge(&self) {}

    async fn close(&self) {}
}
