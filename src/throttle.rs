//! Connection Throttle
//!
//! Caps concurrent connection *attempts* per physical endpoint. Attempts run
//! on background tasks and deposit their handle into a [`ResourcePool`];
//! callers only ever wait a bounded time for a handle to appear there.
//!
//! A failed attempt is logged and otherwise invisible: the caller's only
//! signal is that no handle arrived within its timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use qore_core::EngineResult;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::AdapterSettings;
use crate::metrics;
use crate::pool::{AttemptId, ResourcePool, ResourceRegistry};

/// Opens new handles to one physical endpoint
#[async_trait]
pub trait Connector<H: Send + 'static>: Send + Sync {
    /// Endpoint identity, free of credentials. Keys the in-flight record and log lines.
    fn endpoint(&self) -> &str;

    /// Opens a handle. May block for the endpoint's own connect timeout.
    async fn connect(&self) -> EngineResult<H>;

    /// Disposes of a handle that its pool refused.
    async fn discard(&self, handle: H) {
        drop(handle);
    }
}

/// Throttle tunables
#[derive(Debug, Clone, Copy)]
pub struct ThrottleSettings {
    /// Default per-endpoint cap on concurrent attempts
    pub max_in_flight: usize,
    /// Minimum wait granted to the very first acquisition against an endpoint
    pub first_attempt_grace: Duration,
    /// Start a background attempt whenever a pop leaves the pool empty
    pub prefetch_spare: bool,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            first_attempt_grace: Duration::ZERO,
            prefetch_spare: false,
        }
    }
}

impl From<&AdapterSettings> for ThrottleSettings {
    fn from(settings: &AdapterSettings) -> Self {
        Self {
            max_in_flight: settings.max_connect_attempts.max(1),
            first_attempt_grace: Duration::from_millis(settings.first_attempt_grace_ms),
            prefetch_spare: settings.prefetch_spare_handles,
        }
    }
}

/// Removes the attempt from the in-flight record and wakes the pool's
/// waiters, even if the attempt task panics.
struct AttemptGuard<H> {
    resources: Arc<ResourceRegistry>,
    pool: Arc<ResourcePool<H>>,
    endpoint: String,
    id: AttemptId,
}

impl<H> Drop for AttemptGuard<H> {
    fn drop(&mut self) {
        self.resources.end_attempt(&self.endpoint, self.id);
        self.pool.notify_all();
    }
}

pub struct ConnectionThrottle {
    resources: Arc<ResourceRegistry>,
    settings: ThrottleSettings,
}

impl ConnectionThrottle {
    pub fn new(resources: Arc<ResourceRegistry>, settings: ThrottleSettings) -> Self {
        Self {
            resources,
            settings,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceRegistry> {
        &self.resources
    }

    pub fn settings(&self) -> ThrottleSettings {
        self.settings
    }

    /// Returns a pooled handle if one is, or becomes, available within `timeout_ms`.
    ///
    /// Starts a background attempt when the endpoint is below the default
    /// cap. Returns `None` on timeout; a started attempt keeps running and
    /// pools its handle for a later caller.
    pub async fn acquire_within_timeout_or_async<H: Send + 'static>(
        &self,
        pool: &Arc<ResourcePool<H>>,
        connector: &Arc<dyn Connector<H>>,
        timeout_ms: u64,
    ) -> Option<H> {
        self.acquire_with_cap(pool, connector, timeout_ms, self.settings.max_in_flight)
            .await
    }

    /// Same as [`acquire_within_timeout_or_async`](Self::acquire_within_timeout_or_async)
    /// with a per-source cap.
    #[instrument(
        skip(self, pool, connector),
        fields(endpoint = %connector.endpoint(), pool = %pool.key())
    )]
    pub async fn acquire_with_cap<H: Send + 'static>(
        &self,
        pool: &Arc<ResourcePool<H>>,
        connector: &Arc<dyn Connector<H>>,
        timeout_ms: u64,
        cap: usize,
    ) -> Option<H> {
        let endpoint = connector.endpoint();
        let mut wait = Duration::from_millis(timeout_ms);
        if !self.settings.first_attempt_grace.is_zero() && self.resources.is_first_attempt(endpoint)
        {
            debug!(
                grace_ms = self.settings.first_attempt_grace.as_millis() as u64,
                "First attempt against endpoint, extending wait"
            );
            wait = wait.max(self.settings.first_attempt_grace);
        }
        let deadline = Instant::now() + wait;

        loop {
            let notified = pool.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(handle) = pool.pop() {
                if self.settings.prefetch_spare && pool.is_empty() {
                    self.spawn_attempt_below_cap(pool, connector, cap);
                }
                return Some(handle);
            }

            self.spawn_attempt_below_cap(pool, connector, cap);

            if Instant::now() >= deadline {
                return None;
            }
            if timeout_at(deadline, notified).await.is_err() {
                debug!(
                    in_flight = self.resources.in_flight(endpoint),
                    "No handle within timeout"
                );
                return pool.pop();
            }
        }
    }

    /// Spawns an attempt unless `cap` attempts are already in flight.
    pub fn spawn_attempt_below_cap<H: Send + 'static>(
        &self,
        pool: &Arc<ResourcePool<H>>,
        connector: &Arc<dyn Connector<H>>,
        cap: usize,
    ) -> bool {
        let endpoint = connector.endpoint().to_string();
        let Some(id) = self.resources.try_begin_attempt(&endpoint, cap.max(1)) else {
            return false;
        };

        metrics::record_attempt_started();
        debug!(endpoint = %endpoint, "Starting background connection attempt");

        let guard = AttemptGuard {
            resources: self.resources.clone(),
            pool: pool.clone(),
            endpoint,
            id,
        };
        let connector = connector.clone();

        tokio::spawn(async move {
            match connector.connect().await {
                Ok(handle) => {
                    info!(endpoint = %guard.endpoint, "Connection established, pooling handle");
                    if let Some(refused) = guard.pool.push(handle) {
                        debug!(endpoint = %guard.endpoint, "Pool full, discarding new handle");
                        connector.discard(refused).await;
                    }
                }
                Err(e) if e.is_connection_failure() => {
                    metrics::record_attempt_failed();
                    warn!(
                        endpoint = %guard.endpoint,
                        error = %e,
                        "Connection attempt failed (check for a missing driver, network unavailability, \
                         incorrect user/password, or an endpoint that is not running)"
                    );
                }
                Err(e) => {
                    metrics::record_attempt_failed();
                    error!(endpoint = %guard.endpoint, error = %e, "Connection attempt rejected");
                }
            }
            drop(guard);
        });

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolKey;
    use qore_core::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowConnector {
        delay: Duration,
        fail: bool,
        started: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl SlowConnector {
        fn new(delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                fail,
                started: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Connector<usize> for SlowConnector {
        fn endpoint(&self) -> &str {
            "slow://endpoint"
        }

        async fn connect(&self) -> EngineResult<usize> {
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(EngineError::connection_failed("slow://endpoint", "refused"))
            } else {
                Ok(n)
            }
        }
    }

    fn setup(settings: ThrottleSettings) -> (ConnectionThrottle, Arc<ResourcePool<usize>>) {
        let resources = Arc::new(ResourceRegistry::new());
        let pool = resources.pool::<usize>(&PoolKey::direct("slow"), 4).unwrap();
        (ConnectionThrottle::new(resources, settings), pool)
    }

    #[tokio::test(start_paused = true)]
    async fn pooled_handle_returns_immediately() {
        let (throttle, pool) = setup(ThrottleSettings::default());
        pool.push(42);
        let connector = SlowConnector::new(500, false);
        let dyn_connector: Arc<dyn Connector<usize>> = connector.clone();

        let got = throttle
            .acquire_within_timeout_or_async(&pool, &dyn_connector, 100)
            .await;
        assert_eq!(got, Some(42));
        assert_eq!(connector.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_connect_is_returned_to_waiter() {
        let (throttle, pool) = setup(ThrottleSettings::default());
        let connector: Arc<dyn Connector<usize>> = SlowConnector::new(10, false);

        let got = throttle
            .acquire_within_timeout_or_async(&pool, &connector, 1000)
            .await;
        assert_eq!(got, Some(0));
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_starts_attempt_and_returns_none() {
        let (throttle, pool) = setup(ThrottleSettings::default());
        let connector: Arc<dyn Connector<usize>> = SlowConnector::new(50, false);

        assert_eq!(
            throttle
                .acquire_within_timeout_or_async(&pool, &connector, 0)
                .await,
            None
        );
        assert_eq!(throttle.resources().in_flight("slow://endpoint"), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(throttle.resources().in_flight("slow://endpoint"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_stay_silent_and_clear_in_flight() {
        let (throttle, pool) = setup(ThrottleSettings::default());
        let connector = SlowConnector::new(20, true);
        let dyn_connector: Arc<dyn Connector<usize>> = connector.clone();

        let got = throttle
            .acquire_within_timeout_or_async(&pool, &dyn_connector, 30)
            .await;
        assert_eq!(got, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(throttle.resources().in_flight("slow://endpoint"), 0);
        assert!(pool.is_empty());
        assert!(connector.started.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cap_bounds_concurrent_attempts() {
        let (throttle, pool) = setup(ThrottleSettings {
            max_in_flight: 2,
            ..ThrottleSettings::default()
        });
        let throttle = Arc::new(throttle);
        let connector = SlowConnector::new(200, true);
        let dyn_connector: Arc<dyn Connector<usize>> = connector.clone();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let throttle = throttle.clone();
            let pool = pool.clone();
            let connector = dyn_connector.clone();
            tasks.push(tokio::spawn(async move {
                throttle
                    .acquire_within_timeout_or_async(&pool, &connector, 1000)
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), None);
        }
        assert!(connector.max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_grace_extends_wait() {
        let (throttle, pool) = setup(ThrottleSettings {
            first_attempt_grace: Duration::from_millis(300),
            ..ThrottleSettings::default()
        });
        let connector: Arc<dyn Connector<usize>> = SlowConnector::new(200, false);

        let got = throttle
            .acquire_within_timeout_or_async(&pool, &connector, 10)
            .await;
        assert_eq!(got, Some(0));

        let again = throttle
            .acquire_within_timeout_or_async(&pool, &connector, 10)
            .await;
        assert_eq!(again, None);
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_refills_emptied_pool() {
        let (throttle, pool) = setup(ThrottleSettings {
            prefetch_spare: true,
            ..ThrottleSettings::default()
        });
        pool.push(99);
        let connector = SlowConnector::new(10, false);
        let dyn_connector: Arc<dyn Connector<usize>> = connector.clone();

        let got = throttle
            .acquire_within_timeout_or_async(&pool, &dyn_connector, 10)
            .await;
        assert_eq!(got, Some(99));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.len(), 1);
        assert_eq!(connector.started.load(Ordering::SeqCst), 1);
    }
}
