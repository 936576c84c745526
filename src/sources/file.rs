//! Delimited text file source
//!
//! Reads a CSV-style file whose first record names the physical columns.
//! Fields are served as text (an empty field is a null) and coerced into
//! logical types by the cursor. Open readers are pooled per file and rewound
//! for reuse.
//!
//! A path whose file name carries a `*` or `?` mask is pluralized: it stands
//! for every matching file in its directory, and each execution names the
//! file it reads.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use qore_core::{EngineError, EngineResult, PhysicalColumn, Value};
use regex::Regex;
use tracing::{debug, instrument};

use crate::adapter::{PhysicalSource, SourceRequest};
use crate::config::{AdapterSettings, SourceDefinition};
use crate::cursor::RawRowStream;
use crate::pool::{PoolKey, ResourcePool, ResourceRegistry};

type PooledReader = Box<dyn RawRowStream>;

/// Records read per trip to the blocking pool.
const READ_BATCH: usize = 256;

fn io_error(path: &str, e: std::io::Error) -> EngineError {
    EngineError::connection_failed(path, e.to_string())
}

fn csv_error(path: &str, e: csv::Error) -> EngineError {
    match e.kind() {
        csv::ErrorKind::Io(_) => EngineError::connection_failed(path, e.to_string()),
        _ => EngineError::execution_error(format!("{}: {}", path, e)),
    }
}

fn join_error(path: &str, e: tokio::task::JoinError) -> EngineError {
    EngineError::internal(format!("{}: file read task failed: {}", path, e))
}

/// Opens `path` and parses its header record. Blocking.
fn open_reader(
    path: &str,
    delimiter: u8,
) -> EngineResult<(csv::Reader<File>, csv::StringRecord)> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .map_err(|e| csv_error(path, e))?;
    let headers = reader.headers().map_err(|e| csv_error(path, e))?.clone();
    Ok((reader, headers))
}

/// Compiles a `*`/`?` file-name mask into an anchored regex.
fn mask_regex(mask: &str) -> EngineResult<Regex> {
    let mut pattern = String::from("^");
    for ch in mask.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| EngineError::configuration(format!("Invalid file mask {}: {}", mask, e)))
}

struct Resolution {
    at: Instant,
    instances: Vec<String>,
}

pub struct FileSource {
    path: String,
    delimiter: u8,
    mask: Option<Regex>,
    resources: Arc<ResourceRegistry>,
    pool_capacity: AtomicUsize,
    resolution_interval: Duration,
    resolved: Mutex<Option<Resolution>>,
    pool_keys: Mutex<HashSet<PoolKey>>,
}

impl FileSource {
    pub fn new(
        path: impl Into<String>,
        delimiter: char,
        resources: Arc<ResourceRegistry>,
        settings: &AdapterSettings,
    ) -> EngineResult<Self> {
        let path = path.into();
        if path.trim().is_empty() {
            return Err(EngineError::configuration("File path cannot be empty"));
        }
        if !delimiter.is_ascii() {
            return Err(EngineError::configuration(format!(
                "Delimiter {:?} is not a single-byte character",
                delimiter
            )));
        }

        let file_name = Path::new(&path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let mask = if file_name.contains(|c| c == '*' || c == '?') {
            Some(mask_regex(file_name)?)
        } else {
            None
        };

        Ok(Self {
            path,
            delimiter: delimiter as u8,
            mask,
            resources,
            pool_capacity: AtomicUsize::new(settings.max_pool_size),
            resolution_interval: settings.plural_resolution_interval(),
            resolved: Mutex::new(None),
            pool_keys: Mutex::new(HashSet::new()),
        })
    }

    fn directory(&self) -> PathBuf {
        match Path::new(&self.path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Whether `candidate` is this file, or a file covered by its mask.
    fn covers(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        if candidate == self.path {
            return true;
        }
        let Some(mask) = &self.mask else {
            return false;
        };
        let candidate = Path::new(candidate);
        let in_directory = candidate
            .parent()
            .map(|parent| parent == self.directory() || parent.as_os_str().is_empty())
            .unwrap_or(false);
        in_directory
            && candidate
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| mask.is_match(n))
                .unwrap_or(false)
    }

    /// The file a request reads.
    fn target(&self, instance: Option<&str>) -> EngineResult<String> {
        match (&self.mask, instance) {
            (None, _) => Ok(self.path.clone()),
            (Some(_), Some(instance)) if self.covers(instance) => Ok(instance.to_string()),
            (Some(_), Some(instance)) => Err(EngineError::configuration(format!(
                "{} is not covered by {}",
                instance, self.path
            ))),
            (Some(_), None) => Err(EngineError::configuration(format!(
                "{} is pluralized; name the file to read",
                self.path
            ))),
        }
    }

    fn pool(&self, file: &str, cache_mode: bool) -> EngineResult<Arc<ResourcePool<PooledReader>>> {
        let key = PoolKey::new(file, cache_mode);
        self.pool_keys.lock().insert(key.clone());
        self.resources
            .pool::<PooledReader>(&key, self.pool_capacity.load(Ordering::SeqCst))
    }

    fn pools(&self) -> Vec<Arc<ResourcePool<PooledReader>>> {
        let capacity = self.pool_capacity.load(Ordering::SeqCst);
        let keys: Vec<PoolKey> = self.pool_keys.lock().iter().cloned().collect();
        keys.iter()
            .filter_map(|key| self.resources.pool::<PooledReader>(key, capacity).ok())
            .collect()
    }
}

#[async_trait]
impl PhysicalSource for FileSource {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn describe(&self) -> String {
        self.path.clone()
    }

    fn is_based_on(&self, descriptor: &str) -> bool {
        self.covers(descriptor)
    }

    fn is_pluralized(&self) -> bool {
        self.mask.is_some()
    }

    async fn pluralized_instances(&self) -> EngineResult<Vec<String>> {
        let Some(mask) = &self.mask else {
            return Ok(Vec::new());
        };

        let fresh = self
            .resolved
            .lock()
            .as_ref()
            .filter(|resolution| resolution.at.elapsed() < self.resolution_interval)
            .map(|resolution| resolution.instances.clone());
        if let Some(instances) = fresh {
            return Ok(instances);
        }

        let directory = self.directory();
        let dir_name = directory.to_string_lossy().to_string();
        let mut entries = tokio::fs::read_dir(&directory)
            .await
            .map_err(|e| io_error(&dir_name, e))?;
        let mut instances = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir_name, e))? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let matches = entry
                .file_name()
                .to_str()
                .map(|n| mask.is_match(n))
                .unwrap_or(false);
            if is_file && matches {
                instances.push(entry.path().to_string_lossy().to_string());
            }
        }
        instances.sort();

        debug!(mask = %self.path, instances = instances.len(), "Resolved file mask");
        *self.resolved.lock() = Some(Resolution {
            at: Instant::now(),
            instances: instances.clone(),
        });
        Ok(instances)
    }

    async fn modification_stamp(&self) -> Option<SystemTime> {
        if self.mask.is_some() {
            return None;
        }
        tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
    }

    async fn physical_columns(&self, instance: Option<&str>) -> EngineResult<Vec<PhysicalColumn>> {
        let path = self.target(instance)?;
        let delimiter = self.delimiter;
        let target = path.clone();
        let (_, headers) = tokio::task::spawn_blocking(move || open_reader(&target, delimiter))
            .await
            .map_err(|e| join_error(&path, e))??;
        Ok(headers
            .iter()
            .map(|name| PhysicalColumn::new(name.trim(), "TEXT"))
            .collect())
    }

    fn configure(&self, definition: &SourceDefinition, settings: &AdapterSettings) {
        let capacity = definition.pool_capacity_or(settings);
        self.pool_capacity.store(capacity, Ordering::SeqCst);
        for pool in self.pools() {
            let evicted = pool.set_capacity(capacity);
            if !evicted.is_empty() {
                debug!(pool = %pool.key(), evicted = evicted.len(), "Shrunk reader pool");
            }
        }
    }

    #[instrument(skip(self, request), fields(file = %self.path, cache_mode = request.cache_mode))]
    async fn open(&self, request: SourceRequest) -> EngineResult<Box<dyn RawRowStream>> {
        let path = self.target(request.instance.as_deref())?;
        if !self.is_pluralized() {
            if let Some(reader) = self.pool(&path, request.cache_mode)?.pop() {
                debug!("Reusing pooled reader");
                return Ok(reader);
            }
        }
        let stream = CsvRowStream::open(&path, self.delimiter, request.physical_columns).await?;
        Ok(Box::new(stream))
    }

    async fn recycle(&self, mut stream: Box<dyn RawRowStream>, cache_mode: bool) {
        if self.is_pluralized() {
            stream.close().await;
            return;
        }
        match self.pool(&self.path, cache_mode) {
            Ok(pool) => {
                if let Some(mut refused) = pool.push(stream) {
                    refused.close().await;
                }
            }
            Err(_) => stream.close().await,
        }
    }

    async fn purge(&self) {
        for pool in self.pools() {
            for mut reader in pool.drain() {
                reader.close().await;
            }
        }
        *self.resolved.lock() = None;
    }

    async fn close(&self) {
        self.purge().await;
        let keys: Vec<PoolKey> = self.pool_keys.lock().drain().collect();
        for key in keys {
            self.resources.remove_pool(&key);
        }
    }
}

/// Forward reader over one delimited file, rewindable to its first data record
///
/// Records are read in batches on tokio's blocking pool.
pub struct CsvRowStream {
    path: String,
    columns: Arc<[PhysicalColumn]>,
    reader: Option<csv::Reader<File>>,
    data_start: csv::Position,
    buffered: VecDeque<Vec<Value>>,
    failed: Option<EngineError>,
    at_end: bool,
}

impl CsvRowStream {
    pub async fn open(
        path: &str,
        delimiter: u8,
        columns: Arc<[PhysicalColumn]>,
    ) -> EngineResult<Self> {
        let target = path.to_string();
        let (reader, _) = tokio::task::spawn_blocking(move || open_reader(&target, delimiter))
            .await
            .map_err(|e| join_error(path, e))??;
        let data_start = reader.position().clone();

        Ok(Self {
            path: path.to_string(),
            columns,
            reader: Some(reader),
            data_start,
            buffered: VecDeque::new(),
            failed: None,
            at_end: false,
        })
    }

    fn lost_reader(&self) -> EngineError {
        EngineError::internal(format!("{}: reader lost after a failed read", self.path))
    }

    async fn fill(&mut self) -> EngineResult<()> {
        let mut reader = self.reader.take().ok_or_else(|| self.lost_reader())?;
        let path = self.path.clone();
        let width = self.columns.len();

        let (reader, rows, outcome) = tokio::task::spawn_blocking(move || {
            let mut record = csv::StringRecord::new();
            let mut rows = Vec::with_capacity(READ_BATCH);
            let outcome = loop {
                if rows.len() == READ_BATCH {
                    break Ok(false);
                }
                match reader.read_record(&mut record) {
                    Ok(true) => rows.push(record_values(&record, width)),
                    Ok(false) => break Ok(true),
                    Err(e) => break Err(csv_error(&path, e)),
                }
            };
            (reader, rows, outcome)
        })
        .await
        .map_err(|e| join_error(&self.path, e))?;

        self.reader = Some(reader);
        self.buffered.extend(rows);
        match outcome {
            Ok(at_end) => self.at_end = at_end,
            Err(e) => self.failed = Some(e),
        }
        Ok(())
    }
}

/// Fields as text values, an empty field read as null, padded or cut to `width`.
fn record_values(record: &csv::StringRecord, width: usize) -> Vec<Value> {
    (0..width)
        .map(|i| match record.get(i) {
            Some(field) if !field.is_empty() => Value::Text(field.to_string()),
            _ => Value::Null,
        })
        .collect()
}

#[async_trait]
impl RawRowStream for CsvRowStream {
    fn physical_columns(&self) -> &[PhysicalColumn] {
        &self.columns
    }

    async fn next_row(&mut self) -> EngineResult<Option<Vec<Value>>> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Ok(Some(row));
            }
            if let Some(e) = self.failed.take() {
                return Err(e);
            }
            if self.at_end {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    fn is_reusable(&self) -> bool {
        self.reader.is_some()
    }

    async fn reinitialise(&mut self) -> bool {
        let Some(mut reader) = self.reader.take() else {
            return false;
        };
        let start = self.data_start.clone();
        let rewound = tokio::task::spawn_blocking(move || {
            let sought = reader.seek(start).is_ok();
            (reader, sought)
        })
        .await;

        self.buffered.clear();
        self.failed = None;
        self.at_end = false;
        match rewound {
            Ok((reader, sought)) => {
                self.reader = Some(reader);
                sought
            }
            Err(_) => false,
        }
    }
}
