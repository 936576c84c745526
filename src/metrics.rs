//! Lightweight in-memory counters for the adapter layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct AdapterMetrics {
    handles_pooled: AtomicU64,
    handles_dropped: AtomicU64,
    handles_reused: AtomicU64,
    attempts_started: AtomicU64,
    attempts_failed: AtomicU64,
    cache_loads: AtomicU64,
    cache_load_failures: AtomicU64,
    cached_rows_max: AtomicU64,
    indexes_abandoned: AtomicU64,
    values_nulled: AtomicU64,
}

static ADAPTER_METRICS: OnceLock<AdapterMetrics> = OnceLock::new();

fn metrics() -> &'static AdapterMetrics {
    ADAPTER_METRICS.get_or_init(AdapterMetrics::default)
}

pub fn record_handle_pooled() {
    metrics().handles_pooled.fetch_add(1, Ordering::Relaxed);
}

/// A push found its pool full and the handle was discarded.
pub fn record_handle_dropped() {
    metrics().handles_dropped.fetch_add(1, Ordering::Relaxed);
}

pub fn record_handle_reused() {
    metrics().handles_reused.fetch_add(1, Ordering::Relaxed);
}

pub fn record_attempt_started() {
    metrics().attempts_started.fetch_add(1, Ordering::Relaxed);
}

pub fn record_attempt_failed() {
    metrics().attempts_failed.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cache_load(rows: usize, success: bool) {
    let metrics = metrics();
    if !success {
        metrics.cache_load_failures.fetch_add(1, Ordering::Relaxed);
        return;
    }
    metrics.cache_loads.fetch_add(1, Ordering::Relaxed);

    let rows = rows as u64;
    let mut current = metrics.cached_rows_max.load(Ordering::Relaxed);
    while rows > current {
        match metrics.cached_rows_max.compare_exchange(
            current,
            rows,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

pub fn record_index_abandoned() {
    metrics().indexes_abandoned.fetch_add(1, Ordering::Relaxed);
}

/// A physical value could not be converted and was delivered as null.
pub fn record_value_nulled() {
    metrics().values_nulled.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
pub struct AdapterMetricsSnapshot {
    pub handles_pooled: u64,
    pub handles_dropped: u64,
    pub handles_reused: u64,
    pub attempts_started: u64,
    pub attempts_failed: u64,
    pub cache_loads: u64,
    pub cache_load_failures: u64,
    pub cached_rows_max: Option<u64>,
    pub indexes_abandoned: u64,
    pub values_nulled: u64,
}

pub fn snapshot() -> AdapterMetricsSnapshot {
    let metrics = metrics();
    let cached_rows_max = metrics.cached_rows_max.load(Ordering::Relaxed);

    AdapterMetricsSnapshot {
        handles_pooled: metrics.handles_pooled.load(Ordering::Relaxed),
        handles_dropped: metrics.handles_dropped.load(Ordering::Relaxed),
        handles_reused: metrics.handles_reused.load(Ordering::Relaxed),
        attempts_started: metrics.attempts_started.load(Ordering::Relaxed),
        attempts_failed: metrics.attempts_failed.load(Ordering::Relaxed),
        cache_loads: metrics.cache_loads.load(Ordering::Relaxed),
        cache_load_failures: metrics.cache_load_failures.load(Ordering::Relaxed),
        cached_rows_max: if cached_rows_max > 0 {
            Some(cached_rows_max)
        } else {
            None
        },
        indexes_abandoned: metrics.indexes_abandoned.load(Ordering::Relaxed),
        values_nulled: metrics.values_nulled.load(Ordering::Relaxed),
    }
}
