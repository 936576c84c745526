// SPDX-License-Identifier: Apache-2.0

//! Relational Source
//!
//! Reads one table behind a database URL through `sqlx`'s driver-agnostic
//! `AnyConnection`. Connections are pooled per endpoint and cache mode, and
//! new ones are only ever opened by the connection throttle.
//!
//! Rows are streamed by a background task that owns the connection for the
//! duration of the query; it hands the connection back to its pool once the
//! result set has been fully read.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use qore_core::{EngineError, EngineResult, PhysicalColumn, Value};
use sqlx::any::install_default_drivers;
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Column, Connection, Executor, Row, Statement, TypeInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::adapter::{PhysicalSource, SourceRequest};
use crate::config::{AdapterSettings, SourceDefinition};
use crate::cursor::RawRowStream;
use crate::observability::{endpoint_identity, redact_endpoint, Sensitive};
use crate::pool::{PoolKey, ResourcePool};
use crate::throttle::{ConnectionThrottle, Connector};

const ROW_CHANNEL_CAPACITY: usize = 256;
const CONNECT_TIMEOUT_MS: u64 = 15_000;
const SUPPORTED_SCHEMES: [&str; 5] = ["sqlite", "postgres", "postgresql", "mysql", "mariadb"];

static INSTALL_DRIVERS: Once = Once::new();

fn sqlx_error(endpoint: &str, e: sqlx::Error) -> EngineError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Configuration(_) => EngineError::connection_failed(endpoint, e.to_string()),
        other => EngineError::execution_error(format!("{}: {}", endpoint, other)),
    }
}

/// Bounds a connection attempt; an attempt still pending after `timeout_ms` fails with `Timeout`.
async fn connect_within<T>(
    endpoint: &str,
    timeout_ms: u64,
    attempt: impl Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), attempt).await {
        Ok(result) => result,
        Err(_) => {
            debug!(endpoint, timeout_ms, "Connection attempt timed out");
            Err(EngineError::Timeout { timeout_ms })
        }
    }
}

/// Opens `AnyConnection`s to one URL
struct SqlConnector {
    url: Sensitive<String>,
    endpoint: String,
}

#[async_trait]
impl Connector<AnyConnection> for SqlConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> EngineResult<AnyConnection> {
        INSTALL_DRIVERS.call_once(install_default_drivers);
        connect_within(&self.endpoint, CONNECT_TIMEOUT_MS, async {
            AnyConnection::connect(self.url.expose())
                .await
                .map_err(|e| sqlx_error(&self.endpoint, e))
        })
        .await
    }

    async fn discard(&self, handle: AnyConnection) {
        if let Err(e) = handle.close().await {
            debug!(endpoint = %self.endpoint, error = %e, "Error closing discarded connection");
        }
    }
}

pub struct RelationalSource {
    endpoint: String,
    display: String,
    table: String,
    quote: char,
    throttle: Arc<ConnectionThrottle>,
    connector: Arc<dyn Connector<AnyConnection>>,
    settings: AdapterSettings,
    pool_capacity: AtomicUsize,
    max_attempts: AtomicUsize,
    closed: AtomicBool,
}

impl RelationalSource {
    pub fn new(
        url: impl Into<String>,
        table: impl Into<String>,
        throttle: Arc<ConnectionThrottle>,
        settings: &AdapterSettings,
    ) -> EngineResult<Self> {
        let url = url.into();
        let table = table.into();
        let parsed = Url::parse(&url).map_err(|e| {
            EngineError::configuration(format!("Invalid database URL {}: {}", redact_endpoint(&url), e))
        })?;
        let scheme = parsed.scheme().to_ascii_lowercase();
        if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
            return Err(EngineError::configuration(format!(
                "Unsupported database scheme: {}",
                scheme
            )));
        }
        if table.trim().is_empty() {
            return Err(EngineError::configuration("Table name cannot be empty"));
        }

        let endpoint = endpoint_identity(&url);
        throttle.resources().retain_endpoint(&endpoint);
        let display = format!("{} table {}", redact_endpoint(&url), table);
        let quote = if scheme == "mysql" || scheme == "mariadb" {
            '`'
        } else {
            '"'
        };

        Ok(Self {
            connector: Arc::new(SqlConnector {
                url: Sensitive::new(url),
                endpoint: endpoint.clone(),
            }),
            endpoint,
            display,
            table,
            quote,
            throttle,
            settings: settings.clone(),
            pool_capacity: AtomicUsize::new(settings.max_pool_size),
            max_attempts: AtomicUsize::new(settings.max_connect_attempts),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn pool(&self, cache_mode: bool) -> EngineResult<Arc<ResourcePool<AnyConnection>>> {
        self.throttle.resources().pool::<AnyConnection>(
            &PoolKey::new(&self.endpoint, cache_mode),
            self.pool_capacity.load(Ordering::SeqCst),
        )
    }

    fn quoted(&self, column: &str) -> String {
        let q = self.quote;
        let escaped = column.replace(q, &format!("{}{}", q, q));
        format!("{}{}{}", q, escaped, q)
    }

    /// `SELECT` for the requested physical columns; `SELECT 1` when none are needed.
    fn select_sql(&self, request: &SourceRequest) -> String {
        let columns: Vec<String> = request
            .selected
            .iter()
            .filter_map(|&i| request.physical_columns.get(i))
            .map(|c| self.quoted(&c.name))
            .collect();
        let projection = if columns.is_empty() {
            "1".to_string()
        } else {
            columns.join(", ")
        };

        let mut sql = format!("SELECT {} FROM {}", projection, self.table);
        if let Some(fragment) = request.pushed_where.as_deref().map(str::trim) {
            if !fragment.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(fragment);
            }
        }
        sql
    }

    /// Waits for a pooled connection. An endpoint that yields none in time is
    /// disabled for the configured period.
    async fn acquire(&self, cache_mode: bool, timeout_ms: u64) -> EngineResult<AnyConnection> {
        let resources = self.throttle.resources();
        if resources.is_endpoint_disabled(&self.endpoint) {
            return Err(EngineError::resource_exhausted(
                &self.endpoint,
                "endpoint temporarily disabled after failing to provide a connection",
            ));
        }

        let pool = self.pool(cache_mode)?;
        let cap = self.max_attempts.load(Ordering::SeqCst);
        match self
            .throttle
            .acquire_with_cap(&pool, &self.connector, timeout_ms, cap)
            .await
        {
            Some(connection) => Ok(connection),
            None => {
                resources.disable_endpoint(&self.endpoint, self.settings.disablement());
                Err(EngineError::resource_exhausted(
                    &self.endpoint,
                    format!("no connection available within {} ms", timeout_ms),
                ))
            }
        }
    }

    /// Returns a connection to its pool, closing it when the pool is full.
    async fn release(&self, connection: AnyConnection, cache_mode: bool) {
        match self.pool(cache_mode) {
            Ok(pool) => {
                if let Some(refused) = pool.push(connection) {
                    self.connector.discard(refused).await;
                }
            }
            Err(_) => self.connector.discard(connection).await,
        }
    }

    async fn drain_pools(&self) {
        for cache_mode in [false, true] {
            if let Ok(pool) = self.pool(cache_mode) {
                for connection in pool.drain() {
                    self.connector.discard(connection).await;
                }
            }
        }
    }
}

#[async_trait]
impl PhysicalSource for RelationalSource {
    fn kind(&self) -> &'static str {
        "relational"
    }

    fn describe(&self) -> String {
        self.display.clone()
    }

    fn is_based_on(&self, descriptor: &str) -> bool {
        let descriptor = descriptor.trim();
        descriptor.eq_ignore_ascii_case(&self.table) || endpoint_identity(descriptor) == self.endpoint
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint, table = %self.table))]
    async fn physical_columns(&self, _instance: Option<&str>) -> EngineResult<Vec<PhysicalColumn>> {
        let mut connection = self
            .acquire(false, self.settings.acquire_timeout_ms)
            .await?;
        let sql = format!("SELECT * FROM {}", self.table);
        let described = match (&mut connection).prepare(sql.as_str()).await {
            Ok(statement) => Ok(statement
                .columns()
                .iter()
                .map(|c| PhysicalColumn::new(c.name(), c.type_info().name()))
                .collect::<Vec<_>>()),
            Err(e) => Err(sqlx_error(&self.endpoint, e)),
        };
        self.release(connection, false).await;
        described
    }

    fn configure(&self, definition: &SourceDefinition, settings: &AdapterSettings) {
        let capacity = definition.pool_capacity_or(settings);
        self.pool_capacity.store(capacity, Ordering::SeqCst);
        self.max_attempts
            .store(definition.max_connect_attempts_or(settings).max(1), Ordering::SeqCst);
        for cache_mode in [false, true] {
            if let Ok(pool) = self.pool(cache_mode) {
                let evicted = pool.set_capacity(capacity);
                if !evicted.is_empty() {
                    debug!(pool = %pool.key(), evicted = evicted.len(), "Shrunk connection pool");
                }
            }
        }
    }

    #[instrument(skip(self, request), fields(endpoint = %self.endpoint, cache_mode = request.cache_mode))]
    async fn open(&self, request: SourceRequest) -> EngineResult<Box<dyn RawRowStream>> {
        let connection = self.acquire(request.cache_mode, request.timeout_ms).await?;
        let sql = self.select_sql(&request);
        debug!(sql = %sql, "Opening relational row stream");

        let pool = self.pool(request.cache_mode)?;
        let (sender, receiver) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let feeder = RowFeeder {
            endpoint: self.endpoint.clone(),
            connector: self.connector.clone(),
            pool,
            sql,
            selected: request.selected.clone(),
            width: request.physical_columns.len(),
        };
        tokio::spawn(feeder.run(connection, sender));

        Ok(Box::new(RelationalRowStream {
            columns: request.physical_columns,
            receiver,
        }))
    }

    async fn purge(&self) {
        self.drain_pools().await;
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let resources = self.throttle.resources();
        let remaining = resources.release_endpoint(&self.endpoint);
        if remaining > 0 {
            info!(endpoint = %self.endpoint, remaining, "Relational source closed, endpoint still shared");
            return;
        }

        self.drain_pools().await;
        for cache_mode in [false, true] {
            resources.remove_pool(&PoolKey::new(&self.endpoint, cache_mode));
        }
        info!(endpoint = %self.endpoint, "Relational source closed");
    }
}

enum FeedEnd {
    Completed,
    Abandoned,
    Failed,
}

/// Background task streaming one query's rows into a channel
struct RowFeeder {
    endpoint: String,
    connector: Arc<dyn Connector<AnyConnection>>,
    pool: Arc<ResourcePool<AnyConnection>>,
    sql: String,
    selected: Vec<usize>,
    width: usize,
}

impl RowFeeder {
    async fn run(self, mut connection: AnyConnection, sender: mpsc::Sender<EngineResult<Vec<Value>>>) {
        let end = self.feed(&mut connection, &sender).await;
        match end {
            FeedEnd::Completed => {
                if let Some(refused) = self.pool.push(connection) {
                    self.connector.discard(refused).await;
                }
            }
            FeedEnd::Abandoned => {
                debug!(endpoint = %self.endpoint, "Row stream abandoned, closing its connection");
                self.connector.discard(connection).await;
            }
            FeedEnd::Failed => {
                // The connection may be lost; so may the idle ones
                self.connector.discard(connection).await;
                for idle in self.pool.drain() {
                    self.connector.discard(idle).await;
                }
            }
        }
    }

    async fn feed(
        &self,
        connection: &mut AnyConnection,
        sender: &mpsc::Sender<EngineResult<Vec<Value>>>,
    ) -> FeedEnd {
        let mut rows = sqlx::query(&self.sql).fetch(&mut *connection);
        loop {
            match rows.try_next().await {
                Ok(Some(row)) => {
                    let mut values = vec![Value::Null; self.width];
                    for (position, &physical) in self.selected.iter().enumerate() {
                        if let Some(slot) = values.get_mut(physical) {
                            *slot = extract_value(&row, position);
                        }
                    }
                    if sender.send(Ok(values)).await.is_err() {
                        return FeedEnd::Abandoned;
                    }
                }
                Ok(None) => return FeedEnd::Completed,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Query failed while streaming rows");
                    let _ = sender.send(Err(sqlx_error(&self.endpoint, e))).await;
                    return FeedEnd::Failed;
                }
            }
        }
    }
}

/// Extracts a value from an AnyRow at the given index
fn extract_value(row: &AnyRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }

    Value::Null
}

/// Rows of one query, fed by a background task
struct RelationalRowStream {
    columns: Arc<[PhysicalColumn]>,
    receiver: mpsc::Receiver<EngineResult<Vec<Value>>>,
}

#[async_trait]
impl RawRowStream for RelationalRowStream {
    fn physical_columns(&self) -> &[PhysicalColumn] {
        &self.columns
    }

    async fn next_row(&mut self) -> EngineResult<Option<Vec<Value>>> {
        match self.receiver.recv().await {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.receiver.close();
    }
}
