//! In-memory row source
//!
//! Serves rows held in process, for staging tables and tests. Replacing the
//! rows bumps the modification stamp, so adapters refresh exactly as they do
//! for a rewritten file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use qore_core::{EngineError, EngineResult, PhysicalColumn, Value};

use crate::adapter::{PhysicalSource, SourceRequest};
use crate::cursor::{RawRowStream, VecRowStream};

struct Snapshot {
    columns: Arc<[PhysicalColumn]>,
    rows: Arc<[Vec<Value>]>,
    version: u64,
}

pub struct MemorySource {
    name: String,
    snapshot: RwLock<Snapshot>,
    offline: AtomicBool,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, columns: Vec<PhysicalColumn>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            name: name.into(),
            snapshot: RwLock::new(Snapshot {
                columns: columns.into(),
                rows: rows.into(),
                version: 1,
            }),
            offline: AtomicBool::new(false),
        }
    }

    /// Swaps in a new row set, possibly with a different physical schema.
    pub fn replace_rows(&self, columns: Vec<PhysicalColumn>, rows: Vec<Vec<Value>>) {
        let mut snapshot = self.snapshot.write();
        snapshot.columns = columns.into();
        snapshot.rows = rows.into();
        snapshot.version += 1;
    }

    /// While offline, every open fails as an unreachable endpoint would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn row_count(&self) -> usize {
        self.snapshot.read().rows.len()
    }

    fn check_online(&self) -> EngineResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EngineError::connection_failed(&self.name, "source is offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl PhysicalSource for MemorySource {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn describe(&self) -> String {
        self.name.clone()
    }

    fn is_based_on(&self, descriptor: &str) -> bool {
        self.name.eq_ignore_ascii_case(descriptor.trim())
    }

    async fn modification_stamp(&self) -> Option<SystemTime> {
        Some(UNIX_EPOCH + Duration::from_nanos(self.snapshot.read().version))
    }

    async fn physical_columns(&self, _instance: Option<&str>) -> EngineResult<Vec<PhysicalColumn>> {
        self.check_online()?;
        Ok(self.snapshot.read().columns.to_vec())
    }

    async fn open(&self, _request: SourceRequest) -> EngineResult<Box<dyn RawRowStream>> {
        self.check_online()?;
        let snapshot = self.snapshot.read();
        Ok(Box::new(VecRowStream::new(
            snapshot.columns.clone(),
            snapshot.rows.clone(),
        )))
    }
}
