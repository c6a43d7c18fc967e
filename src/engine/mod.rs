//! Synchronization engine facade
//!
//! `SyncEngine` is the only type a dashboard talks to. It owns one session:
//! the cache, the endpoint pool, the fetch coordinator and the scheduler,
//! all cancelled together by `stop()`. Consumers read `snapshot()` or
//! `subscribe()` to every replacement.

mod snapshot;

pub use snapshot::{Snapshot, SnapshotError, SyncState};

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, CachedData};
use crate::config::EngineConfig;
use crate::data::{keys, DataSource, Identity, Market, ProtocolAnalytics, UserPositions};
use crate::error::FetchError;
use crate::fetch::{FetchCoordinator, RetryPolicy};
use crate::health::HealthMonitor;
use crate::pool::{Endpoint, EndpointPool, ProbeFn};
use crate::scheduler::{Refresher, Scheduler, SchedulerConfig};
use crate::shutdown::Shutdown;
use snapshot::Publisher;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Picks the error to show for one refresh, preferring connection-wide ones
fn worst_error<'a, I>(errors: I) -> Option<FetchError>
where
    I: IntoIterator<Item = Option<&'a FetchError>>,
{
    let errors: Vec<&FetchError> = errors
        .into_iter()
        .flatten()
        .filter(|err| **err != FetchError::Cancelled)
        .collect();
    errors
        .iter()
        .find(|err| err.is_connection_wide())
        .or_else(|| errors.first())
        .map(|err| (*err).clone())
}

/// Keeps `is_loading` set while at least one refresh runs
struct LoadingGuard<'a>(&'a AtomicUsize);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared between the facade and its scheduler tasks
struct EngineInner<S> {
    source: Arc<S>,
    config: EngineConfig,
    coordinator: FetchCoordinator,
    health: HealthMonitor,
    shutdown: Shutdown,
    publisher: Arc<Publisher>,
    loading: AtomicUsize,
    last_manual_refresh: Mutex<Option<Instant>>,
}

impl<S: DataSource> EngineInner<S> {
    fn begin_loading(&self) -> LoadingGuard<'_> {
        self.loading.fetch_add(1, Ordering::SeqCst);
        self.publisher.update(|s| s.is_loading = true);
        LoadingGuard(&self.loading)
    }

    fn is_current_identity(&self, identity: &Identity) -> bool {
        self.publisher.current().identity.as_ref() == Some(identity)
    }

    /// Publishes the outcome of a refresh, unless the session has stopped
    fn apply<F: FnOnce(&mut Snapshot)>(&self, error: Option<&FetchError>, f: F) {
        if self.shutdown.is_triggered() {
            return;
        }
        let healthy = self.health.is_healthy();
        let loading = self.loading.load(Ordering::SeqCst) > 0;
        let active = self.coordinator.pool().active_endpoint().ok().map(|e| e.url);

        let generation = self.publisher.update_with_error(error, |s| {
            f(s);
            s.is_loading = loading;
            s.connection_healthy = healthy;
            s.active_endpoint = active;
        });

        if let (Some(generation), Some(err)) = (generation, error) {
            warn!(error = %err, "Refresh failed");
            self.schedule_error_clear(generation);
        }
    }

    /// Hides the error again after the display duration
    fn schedule_error_clear(&self, generation: u64) {
        let publisher = Arc::clone(&self.publisher);
        let shutdown = self.shutdown.listener();
        let after = self.config.error_display_duration;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    if publisher.clear_error_if(generation) {
                        debug!("Error display expired");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    async fn fetch_markets(&self) -> Result<Vec<Market>, FetchError> {
        let source = Arc::clone(&self.source);
        self.coordinator
            .fetch(keys::MARKET_DATA, self.config.ttl.markets, move |endpoint: Endpoint| {
                let source = Arc::clone(&source);
                async move { source.fetch_markets(&endpoint).await }
            })
            .await
    }

    async fn fetch_analytics(&self) -> Result<ProtocolAnalytics, FetchError> {
        let source = Arc::clone(&self.source);
        self.coordinator
            .fetch(
                keys::PROTOCOL_ANALYTICS,
                self.config.ttl.analytics,
                move |endpoint: Endpoint| {
                    let source = Arc::clone(&source);
                    async move { source.fetch_analytics(&endpoint).await }
                },
            )
            .await
    }

    async fn fetch_positions(&self, identity: &Identity) -> Result<UserPositions, FetchError> {
        identity.validate()?;
        let source = Arc::clone(&self.source);
        let owner = identity.clone();
        self.coordinator
            .fetch(
                &keys::user_positions(identity),
                self.config.ttl.positions,
                move |endpoint: Endpoint| {
                    let source = Arc::clone(&source);
                    let owner = owner.clone();
                    async move { source.fetch_positions(&endpoint, &owner).await }
                },
            )
            .await
    }

    /// Markets and analytics, landing in a single snapshot replacement
    async fn load_protocol(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        let loading = self.begin_loading();
        let (markets, analytics) = tokio::join!(self.fetch_markets(), self.fetch_analytics());
        drop(loading);

        let error = worst_error([markets.as_ref().err(), analytics.as_ref().err()]);
        let complete = markets.is_ok() && analytics.is_ok();

        // Failed fields keep their last known value
        self.apply(error.as_ref(), |s| {
            let mut updated = false;
            if let Ok(markets) = markets {
                s.markets = markets;
                updated = true;
            }
            if let Ok(analytics) = analytics {
                s.analytics = Some(analytics);
                updated = true;
            }
            if updated {
                s.last_updated = Some(Utc::now());
            }
            if complete && s.state == SyncState::Loading {
                info!("Initial protocol data loaded");
                s.state = SyncState::Ready;
            }
        });
    }

    async fn load_positions(&self, identity: Identity) {
        if self.shutdown.is_triggered() || !self.is_current_identity(&identity) {
            return;
        }
        let loading = self.begin_loading();
        let result = self.fetch_positions(&identity).await;
        drop(loading);

        let still_current = self.is_current_identity(&identity);
        if !still_current {
            debug!(identity = %identity, "Identity changed during fetch, discarding positions");
        }
        let error = if still_current {
            worst_error([result.as_ref().err()])
        } else {
            None
        };

        self.apply(error.as_ref(), |s| {
            if s.identity.as_ref() != Some(&identity) {
                return;
            }
            if let Ok(positions) = result {
                s.supplied_positions = positions.supplied;
                s.borrowed_positions = positions.borrowed;
                s.last_updated = Some(Utc::now());
            }
        });
    }

    async fn run_probe(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        let result = self
            .coordinator
            .pool()
            .probe_all(self.config.health_check_timeout)
            .await;
        self.health.record_probe(result.is_ok());

        if let Ok(endpoint) = &result {
            self.coordinator.store(
                keys::HEALTH_PROBE,
                json!(endpoint.ledger_height),
                self.config.health_check_interval,
            );
        }

        let error = result.as_ref().err().cloned();
        self.apply(error.as_ref(), |s| {
            if let Ok(endpoint) = result {
                s.ledger_height = endpoint.ledger_height;
            }
        });
    }

    /// Protocol data plus positions of `identity`, concurrently
    async fn load_all(&self, identity: Option<Identity>) {
        match identity {
            Some(identity) => {
                tokio::join!(self.load_protocol(), self.load_positions(identity));
            }
            None => self.load_protocol().await,
        }
    }
}

impl<S: DataSource> Refresher for EngineInner<S> {
    async fn refresh_periodic(&self) {
        let identity = self.publisher.current().identity.clone();
        self.load_all(identity).await;
    }

    async fn refresh_identity(&self, identity: Identity) {
        self.load_positions(identity).await;
    }

    async fn probe_health(&self) {
        self.run_probe().await;
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

/// Client-side synchronization engine for one dashboard session
pub struct SyncEngine<S: DataSource> {
    inner: Arc<EngineInner<S>>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl<S: DataSource> std::fmt::Debug for SyncEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.inner.publisher.current().state)
            .field("pool", self.inner.coordinator.pool())
            .finish()
    }
}

impl<S: DataSource> SyncEngine<S> {
    /// Creates an idle engine; nothing is fetched until `start`
    ///
    /// # Arguments
    /// * `source` - Remote data provider queried through the endpoint pool
    /// * `config` - Engine settings, expected to be validated already
    pub fn new(source: S, config: EngineConfig) -> Self {
        let source = Arc::new(source);

        let probe_source = Arc::clone(&source);
        let probe: ProbeFn = Arc::new(move |endpoint: Endpoint| {
            let source = Arc::clone(&probe_source);
            async move { source.probe(&endpoint).await }.boxed()
        });
        let pool = EndpointPool::new(
            config.endpoints.iter().cloned(),
            probe,
            config.health_check_timeout,
        );

        let health = HealthMonitor::new(config.unhealthy_after_failures);
        let shutdown = Shutdown::new();
        let coordinator = FetchCoordinator::new(
            CacheStore::new(),
            pool,
            health.clone(),
            RetryPolicy::from_config(&config),
            config.min_fetch_interval,
            shutdown.listener(),
        );

        Self {
            inner: Arc::new(EngineInner {
                source,
                config,
                coordinator,
                health,
                shutdown,
                publisher: Arc::new(Publisher::new()),
                loading: AtomicUsize::new(0),
                last_manual_refresh: Mutex::new(None),
            }),
            scheduler: Mutex::new(None),
        }
    }

    /// The data source every fetch goes through
    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &EndpointPool {
        self.inner.coordinator.pool()
    }

    pub fn cache(&self) -> &CacheStore {
        self.inner.coordinator.cache()
    }

    /// Ledger height from the last probe round, stale once probes stop
    pub fn ledger_height(&self) -> Option<CachedData<u64>> {
        self.cache().get::<u64>(keys::HEALTH_PROBE)
    }

    /// Current snapshot; never blocks on the network
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.publisher.current()
    }

    /// Receives every later snapshot replacement exactly once
    ///
    /// The channel closes when the engine stops.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<Snapshot>> {
        self.inner.publisher.subscribe()
    }

    /// Starts the session and performs the initial load
    ///
    /// Returns once endpoints have been probed and the first refresh of
    /// protocol data (and positions, with an identity) has settled. Calling
    /// it on a started or stopped engine does nothing.
    pub async fn start(&self, identity: Option<Identity>) {
        if !self.begin(&identity) {
            debug!("Engine already started, ignoring start");
            return;
        }
        info!(
            endpoints = self.inner.config.endpoints.len(),
            identity = ?identity.as_ref().map(Identity::as_str),
            "Sync engine started"
        );

        self.inner.run_probe().await;
        self.inner.load_all(identity).await;
    }

    fn begin(&self, identity: &Option<Identity>) -> bool {
        let mut slot = lock(&self.scheduler);
        if slot.is_some() || self.inner.shutdown.is_triggered() {
            return false;
        }
        self.inner.publisher.update(|s| {
            s.state = SyncState::Loading;
            s.identity = identity.clone();
        });
        *slot = Some(Scheduler::spawn(
            Arc::clone(&self.inner),
            SchedulerConfig::from(&self.inner.config),
            self.inner.shutdown.listener(),
            identity.clone(),
        ));
        true
    }

    /// Switches the wallet whose positions are tracked
    ///
    /// Positions of the previous wallet are dropped at once; the new ones are
    /// fetched after the debounce window. `None` disconnects the wallet.
    pub fn set_identity(&self, identity: Option<Identity>) {
        if self.inner.shutdown.is_triggered() {
            return;
        }
        let previous = self.inner.publisher.current().identity.clone();
        if previous == identity {
            return;
        }
        info!(identity = ?identity.as_ref().map(Identity::as_str), "Identity changed");
        if let Some(previous) = &previous {
            self.inner.coordinator.forget(&keys::user_positions(previous));
        }

        self.inner.publisher.update(|s| {
            s.identity = identity.clone();
            s.supplied_positions.clear();
            s.borrowed_positions.clear();
        });
        if let Some(scheduler) = lock(&self.scheduler).as_ref() {
            scheduler.identity_changed(identity);
        }
    }

    /// Forces a refetch of everything the session shows
    ///
    /// Returns `false` without doing anything when called again within the
    /// manual refresh rate limit, or after `stop`.
    pub async fn refresh(&self) -> bool {
        if !self.accept_manual_refresh() {
            return false;
        }
        info!("Manual refresh");
        self.inner.publisher.clear_error();

        let identity = self.inner.publisher.current().identity.clone();
        let cache = self.cache();
        cache.invalidate(keys::MARKET_DATA);
        cache.invalidate(keys::PROTOCOL_ANALYTICS);
        if let Some(identity) = &identity {
            cache.invalidate(&keys::user_positions(identity));
        }

        self.inner.load_all(identity).await;
        true
    }

    fn accept_manual_refresh(&self) -> bool {
        if self.inner.shutdown.is_triggered() {
            return false;
        }
        let now = Instant::now();
        let mut last = lock(&self.inner.last_manual_refresh);
        if let Some(previous) = *last {
            if now.saturating_duration_since(previous) < self.inner.config.manual_refresh_rate_limit {
                debug!("Manual refresh rate-limited");
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Hides the current error
    pub fn clear_error(&self) {
        if self.inner.publisher.clear_error() {
            debug!("Error cleared");
        }
    }

    /// Ends the session
    ///
    /// Timers stop before this returns. Fetches still in flight finish in
    /// the background and their results are dropped. Every later call on
    /// the engine is a no-op.
    pub fn stop(&self) {
        if self.inner.shutdown.is_triggered() {
            return;
        }
        self.inner.shutdown.trigger();
        self.inner.coordinator.seal();
        if let Some(scheduler) = lock(&self.scheduler).as_ref() {
            scheduler.stop();
        }
        self.inner.publisher.close(|s| {
            s.state = SyncState::Stopped;
            s.is_loading = false;
        });
        info!("Sync engine stopped");
    }
}

impl<S: DataSource> Drop for SyncEngine<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
