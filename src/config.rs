//! Adapter configuration
//!
//! Process-wide tunables ([`AdapterSettings`]) and the per-source
//! definition ([`SourceDefinition`]) that an adapter reads at each
//! reinitialisation. Both load from JSON; settings can additionally be
//! overridden from `QORE_*` environment variables.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use compact_str::CompactString;
use qore_core::{EngineError, EngineResult, LogicalColumn};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_POOL_SIZE: usize = 10;
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: usize = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_DISABLEMENT_MS: u64 = 5000;
pub const DEFAULT_CACHE_SWEEP_SECS: u64 = 10;
pub const DEFAULT_PLURAL_RESOLUTION_MS: u64 = 5000;

/// Process-wide adapter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    /// Pool capacity used when a source does not set its own
    pub max_pool_size: usize,
    /// Concurrent connection attempts allowed per endpoint
    pub max_connect_attempts: usize,
    /// How long `execute` waits for a relational handle
    pub acquire_timeout_ms: u64,
    /// Extended wait applied to the very first attempt against an endpoint (0 = off)
    pub first_attempt_grace_ms: u64,
    /// Start a background attempt whenever a pop leaves a pool empty
    pub prefetch_spare_handles: bool,
    /// How long an endpoint is skipped after it failed to yield a handle
    pub disablement_ms: u64,
    /// Interval of the cache reload sweep
    pub cache_sweep_interval_secs: u64,
    /// Minimum interval between re-resolutions of a file mask
    pub plural_resolution_interval_ms: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            first_attempt_grace_ms: 0,
            prefetch_spare_handles: false,
            disablement_ms: DEFAULT_DISABLEMENT_MS,
            cache_sweep_interval_secs: DEFAULT_CACHE_SWEEP_SECS,
            plural_resolution_interval_ms: DEFAULT_PLURAL_RESOLUTION_MS,
        }
    }
}

impl AdapterSettings {
    /// Loads settings from a JSON file, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            debug!("No adapter settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let settings: AdapterSettings = serde_json::from_str(&content).map_err(|e| {
            EngineError::configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        info!("Loaded adapter settings from {:?}", path);
        settings.validated()
    }

    /// Defaults overridden by any `QORE_*` variable present in the environment.
    pub fn from_env() -> EngineResult<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> EngineResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())?;
        self.validated()
    }

    fn with_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> EngineResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> EngineResult<T> {
            raw.trim().parse::<T>().map_err(|_| {
                EngineError::configuration(format!("Invalid value for {}: '{}'", key, raw))
            })
        }

        if let Some(raw) = lookup("QORE_MAX_POOL_SIZE") {
            self.max_pool_size = parse("QORE_MAX_POOL_SIZE", raw)?;
        }
        if let Some(raw) = lookup("QORE_MAX_CONNECT_ATTEMPTS") {
            self.max_connect_attempts = parse("QORE_MAX_CONNECT_ATTEMPTS", raw)?;
        }
        if let Some(raw) = lookup("QORE_ACQUIRE_TIMEOUT_MS") {
            self.acquire_timeout_ms = parse("QORE_ACQUIRE_TIMEOUT_MS", raw)?;
        }
        if let Some(raw) = lookup("QORE_FIRST_ATTEMPT_GRACE_MS") {
            self.first_attempt_grace_ms = parse("QORE_FIRST_ATTEMPT_GRACE_MS", raw)?;
        }
        if let Some(raw) = lookup("QORE_PREFETCH_SPARE_HANDLES") {
            self.prefetch_spare_handles = parse("QORE_PREFETCH_SPARE_HANDLES", raw)?;
        }
        if let Some(raw) = lookup("QORE_DISABLEMENT_MS") {
            self.disablement_ms = parse("QORE_DISABLEMENT_MS", raw)?;
        }
        if let Some(raw) = lookup("QORE_CACHE_SWEEP_INTERVAL_SECS") {
            self.cache_sweep_interval_secs = parse("QORE_CACHE_SWEEP_INTERVAL_SECS", raw)?;
        }
        if let Some(raw) = lookup("QORE_PLURAL_RESOLUTION_INTERVAL_MS") {
            self.plural_resolution_interval_ms = parse("QORE_PLURAL_RESOLUTION_INTERVAL_MS", raw)?;
        }
        Ok(())
    }

    fn validated(self) -> EngineResult<Self> {
        if self.max_connect_attempts == 0 {
            return Err(EngineError::configuration(
                "max_connect_attempts must be at least 1",
            ));
        }
        if self.cache_sweep_interval_secs == 0 {
            return Err(EngineError::configuration(
                "cache_sweep_interval_secs must be at least 1",
            ));
        }
        Ok(self)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn disablement(&self) -> Duration {
        Duration::from_millis(self.disablement_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    pub fn plural_resolution_interval(&self) -> Duration {
        Duration::from_millis(self.plural_resolution_interval_ms)
    }
}

/// How logical columns without an explicit override find their physical column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    /// Case-insensitive name match
    #[default]
    ByName,
    /// Logical position i reads physical position i
    ByPosition,
}

/// In-memory caching options of a source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub enabled: bool,
    /// Reload the cache once it is older than this (no expiry when unset)
    pub ttl_secs: Option<u64>,
    /// Logical column names to build secondary indexes on
    pub indexes: Vec<CompactString>,
}

/// Where a source's rows physically live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhysicalSpec {
    /// A table behind a database URL (`sqlite:`, `postgres://`, `mysql://`)
    Relational { url: String, table: String },
    /// A delimited text file; the path may carry a `*`/`?` mask
    File {
        path: String,
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    /// The logical table of another registered adapter
    Nested { adapter: String },
}

fn default_delimiter() -> char {
    ','
}

/// Definition of one data source backing a logical table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub id: String,
    pub logical_table: String,
    /// Logical schema, in position order
    pub columns: Vec<LogicalColumn>,
    /// Logical column name -> physical column name; an empty target marks the column missing
    #[serde(default)]
    pub column_overrides: HashMap<String, String>,
    #[serde(default)]
    pub mapping_mode: MappingMode,
    #[serde(default)]
    pub cache: CacheOptions,
    #[serde(default)]
    pub pool_capacity: Option<usize>,
    #[serde(default)]
    pub max_connect_attempts: Option<usize>,
    #[serde(default)]
    pub physical: Option<PhysicalSpec>,
}

impl SourceDefinition {
    pub fn new(
        id: impl Into<String>,
        logical_table: impl Into<String>,
        columns: Vec<LogicalColumn>,
    ) -> Self {
        Self {
            id: id.into(),
            logical_table: logical_table.into(),
            columns,
            column_overrides: HashMap::new(),
            mapping_mode: MappingMode::ByName,
            cache: CacheOptions::default(),
            pool_capacity: None,
            max_connect_attempts: None,
            physical: None,
        }
    }

    pub fn with_override(mut self, logical: impl Into<String>, physical: impl Into<String>) -> Self {
        self.column_overrides.insert(logical.into(), physical.into());
        self
    }

    pub fn with_mapping_mode(mut self, mode: MappingMode) -> Self {
        self.mapping_mode = mode;
        self
    }

    pub fn with_cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    pub fn with_physical(mut self, physical: PhysicalSpec) -> Self {
        self.physical = Some(physical);
        self
    }

    pub fn pool_capacity_or(&self, settings: &AdapterSettings) -> usize {
        self.pool_capacity.unwrap_or(settings.max_pool_size)
    }

    pub fn max_connect_attempts_or(&self, settings: &AdapterSettings) -> usize {
        self.max_connect_attempts.unwrap_or(settings.max_connect_attempts)
    }

    /// Position of a logical column, matched case-insensitively.
    pub fn logical_position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Checks the definition is internally consistent.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::configuration("Data source id cannot be empty"));
        }
        if self.columns.is_empty() {
            return Err(EngineError::configuration(format!(
                "{}: logical table {} defines no columns",
                self.id, self.logical_table
            )));
        }

        for (i, column) in self.columns.iter().enumerate() {
            if column.name.trim().is_empty() {
                return Err(EngineError::configuration(format!(
                    "{}: logical column {} has no name",
                    self.id,
                    i + 1
                )));
            }
            if self.columns[..i]
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&column.name))
            {
                return Err(EngineError::configuration(format!(
                    "{}: duplicate logical column {}",
                    self.id, column.name
                )));
            }
        }

        for logical in self.column_overrides.keys() {
            if self.logical_position(logical).is_none() {
                return Err(EngineError::configuration(format!(
                    "{}: override names unknown logical column {}",
                    self.id, logical
                )));
            }
        }

        for indexed in &self.cache.indexes {
            if self.logical_position(indexed).is_none() {
                return Err(EngineError::configuration(format!(
                    "{}: cannot index unknown logical column {}",
                    self.id, indexed
                )));
            }
        }

        if self.pool_capacity == Some(0) {
            warn!(source = %self.id, "Pool capacity 0: handles will never be reused");
        }
        if self.max_connect_attempts == Some(0) {
            return Err(EngineError::configuration(format!(
                "{}: max_connect_attempts must be at least 1",
                self.id
            )));
        }
        if let Some(PhysicalSpec::Nested { adapter }) = &self.physical {
            if adapter == &self.id {
                return Err(EngineError::configuration(format!(
                    "{}: a nested source cannot read itself",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

/// A settings file together with the source definitions it declares
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterConfigFile {
    #[serde(default)]
    pub settings: AdapterSettings,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl AdapterConfigFile {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut file: AdapterConfigFile = serde_json::from_str(&content).map_err(|e| {
            EngineError::configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        file.settings = file.settings.with_env_overrides()?;
        for source in &file.sources {
            source.validate()?;
        }
        info!(
            "Loaded {} source definitions from {:?}",
            file.sources.len(),
            path
        );
        Ok(file)
    }
}
