//! Fetch coordinator: caching, deduplication and retries for remote calls
//!
//! Every remote read goes through `FetchCoordinator::fetch`:
//!
//! 1. a fresh cache entry is returned without touching the network,
//! 2. a fetch already in flight for the same key is joined instead of
//!    duplicated,
//! 3. otherwise the producer runs against the active endpoint, with
//!    exponential backoff and endpoint failover between attempts.
//!
//! The underlying fetch runs in its own task. Dropping every waiter does not
//! abort it, and once the session is cancelled its result is not written to
//! the cache: the shutdown check and the write happen under one commit lock,
//! which `seal` waits on. Results for one key land in completion order, so a
//! later-issued fetch that completes first can be overwritten by an older one.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::health::HealthMonitor;
use crate::pool::{Endpoint, EndpointPool};
use crate::shutdown::ShutdownListener;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// Checks that a raw payload decodes into the caller's type
type Validator = fn(&Value) -> Result<(), FetchError>;

fn validate_as<T: DeserializeOwned>(value: &Value) -> Result<(), FetchError> {
    T::deserialize(value).map(|_| ()).map_err(FetchError::from)
}

/// Attempt budget and delays between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub cap_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_base_delay,
            cap_delay: config.retry_cap_delay,
        }
    }

    /// Delay after the given failed attempt (1-based): `min(base * 2^(attempt-1), cap)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap_delay)
            .min(self.cap_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

struct InFlight {
    id: u64,
    result: SharedFetch,
}

/// What `fetch` should do after inspecting the in-flight registry
enum Step {
    Join(SharedFetch),
    Wait(Duration),
}

struct Inner {
    cache: CacheStore,
    pool: EndpointPool,
    health: HealthMonitor,
    policy: RetryPolicy,
    min_fetch_interval: Duration,
    shutdown: ShutdownListener,
    in_flight: Mutex<HashMap<String, InFlight>>,
    last_issued: Mutex<HashMap<String, Instant>>,
    failures: Mutex<HashMap<String, u32>>,
    /// Held while checking for shutdown and writing a result
    commit: Mutex<()>,
    next_id: AtomicU64,
}

impl Inner {
    /// Writes `value` unless the session has stopped
    fn commit(&self, key: &str, value: Value, ttl: Duration) -> bool {
        let _commit = lock(&self.commit);
        if self.shutdown.is_shutdown() {
            return false;
        }
        self.cache.set_value(key, value, ttl);
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared entry point for all remote reads; clones refer to the same registry
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("policy", &self.inner.policy)
            .field("min_fetch_interval", &self.inner.min_fetch_interval)
            .field("in_flight", &lock(&self.inner.in_flight).len())
            .finish()
    }
}

impl FetchCoordinator {
    pub fn new(
        cache: CacheStore,
        pool: EndpointPool,
        health: HealthMonitor,
        policy: RetryPolicy,
        min_fetch_interval: Duration,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                pool,
                health,
                policy,
                min_fetch_interval,
                shutdown,
                in_flight: Mutex::new(HashMap::new()),
                last_issued: Mutex::new(HashMap::new()),
                failures: Mutex::new(HashMap::new()),
                commit: Mutex::new(()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn pool(&self) -> &EndpointPool {
        &self.inner.pool
    }

    /// Failed fetch cycles for `key` since its last success
    pub fn failure_count(&self, key: &str) -> u32 {
        lock(&self.inner.failures).get(key).copied().unwrap_or(0)
    }

    /// Stores a value obtained outside `fetch`, unless the session has stopped
    pub fn store(&self, key: &str, value: Value, ttl: Duration) -> bool {
        self.inner.commit(key, value, ttl)
    }

    /// Waits for a cache write in progress to finish
    ///
    /// Call after triggering shutdown: once this returns, no result lands in
    /// the cache anymore.
    pub fn seal(&self) {
        drop(lock(&self.inner.commit));
    }

    /// Drops the spacing and failure bookkeeping of a key nobody reads anymore
    pub fn forget(&self, key: &str) {
        lock(&self.inner.last_issued).remove(key);
        lock(&self.inner.failures).remove(key);
    }

    /// Whether a fetch for `key` is currently outstanding
    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.inner.in_flight).contains_key(key)
    }

    /// Returns the value for `key`, fetching it with `producer` when needed
    ///
    /// `producer` receives the endpoint to query and returns the raw JSON
    /// payload. A payload that does not decode into `T` counts as a
    /// malformed response of that endpoint.
    pub async fn fetch<T, P, Fut>(&self, key: &str, ttl: Duration, producer: P) -> Result<T, FetchError>
    where
        T: DeserializeOwned + 'static,
        P: Fn(Endpoint) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        if let Some(cached) = self.inner.cache.get::<T>(key) {
            if cached.is_fresh {
                debug!(key, "Cache hit");
                return Ok(cached.data);
            }
        }
        if self.inner.shutdown.is_shutdown() {
            return Err(FetchError::Cancelled);
        }

        let producer = Arc::new(producer);
        let shared = loop {
            match self.join_or_issue(key, ttl, &producer, validate_as::<T>) {
                Step::Join(shared) => break shared,
                Step::Wait(remaining) => {
                    // Serve stale data instead of hammering the same key
                    if let Some(stale) = self.inner.cache.get::<T>(key) {
                        debug!(key, "Within minimum fetch interval, serving stale value");
                        return Ok(stale.data);
                    }
                    debug!(key, ?remaining, "Within minimum fetch interval, waiting");
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = self.inner.shutdown.cancelled() => return Err(FetchError::Cancelled),
                    }
                }
            }
        };

        let value = shared.await?;
        T::deserialize(&value).map_err(FetchError::from)
    }

    /// Joins the outstanding fetch for `key` or starts a new one
    fn join_or_issue<P, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: &Arc<P>,
        validate: Validator,
    ) -> Step
    where
        P: Fn(Endpoint) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(entry) = in_flight.get(key) {
            debug!(key, "Joining in-flight fetch");
            return Step::Join(entry.result.clone());
        }

        let now = Instant::now();
        {
            let mut last_issued = lock(&self.inner.last_issued);
            if let Some(previous) = last_issued.get(key) {
                let since = now.saturating_duration_since(*previous);
                if since < self.inner.min_fetch_interval {
                    return Step::Wait(self.inner.min_fetch_interval - since);
                }
            }
            // Entries outside the window no longer delay anything
            let window = self.inner.min_fetch_interval;
            last_issued.retain(|_, issued| now.saturating_duration_since(*issued) < window);
            last_issued.insert(key.to_string(), now);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(key, id, "Cache miss, issuing fetch");
        let task = tokio::spawn(run_fetch(
            Arc::clone(&self.inner),
            key.to_string(),
            id,
            ttl,
            Arc::clone(producer),
            validate,
        ));
        let result: SharedFetch = async move {
            task.await
                .unwrap_or_else(|err| Err(FetchError::Transient(format!("fetch task failed: {}", err))))
        }
        .boxed()
        .shared();

        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                result: result.clone(),
            },
        );
        Step::Join(result)
    }
}

/// Body of the spawned fetch task
async fn run_fetch<P, Fut>(
    inner: Arc<Inner>,
    key: String,
    id: u64,
    ttl: Duration,
    producer: Arc<P>,
    validate: Validator,
) -> Result<Value, FetchError>
where
    P: Fn(Endpoint) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    let result = attempt_chain(&inner, &key, producer.as_ref(), validate).await;

    match &result {
        Ok(value) => {
            if inner.commit(&key, value.clone(), ttl) {
                inner.health.record_success();
            } else {
                debug!(key = %key, "Session stopped, discarding fetch result");
            }
            lock(&inner.failures).remove(&key);
        }
        Err(FetchError::Cancelled) => {}
        Err(err) => {
            *lock(&inner.failures).entry(key.clone()).or_insert(0) += 1;
            if !inner.shutdown.is_shutdown() {
                inner.health.record_failure(err);
            }
        }
    }

    // Only drop our own entry; a newer fetch may have replaced it
    let mut in_flight = lock(&inner.in_flight);
    if in_flight.get(&key).map(|entry| entry.id) == Some(id) {
        in_flight.remove(&key);
    }
    result
}

/// Runs attempts until one succeeds or the budget is spent
async fn attempt_chain<P, Fut>(
    inner: &Inner,
    key: &str,
    producer: &P,
    validate: Validator,
) -> Result<Value, FetchError>
where
    P: Fn(Endpoint) -> Fut,
    Fut: Future<Output = Result<Value, FetchError>>,
{
    let policy = inner.policy;
    let mut attempt = 1;

    loop {
        if inner.shutdown.is_shutdown() {
            return Err(FetchError::Cancelled);
        }
        let endpoint = inner.pool.active_endpoint()?;

        let err = match producer(endpoint.clone()).await {
            Ok(value) => match validate(&value) {
                Ok(()) => return Ok(value),
                Err(err) => err,
            },
            Err(err) => err,
        };

        if !err.is_retryable() {
            debug!(key, error = %err, "Non-retryable fetch error");
            return Err(err);
        }

        let next = inner.pool.mark_failed(&endpoint).await?;
        if matches!(err, FetchError::MalformedResponse(_)) && next.url == endpoint.url {
            warn!(key, url = %endpoint.url, error = %err, "Malformed response and no other endpoint");
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            warn!(key, attempts = attempt, error = %err, "Fetch failed, attempts exhausted");
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        info!(key, attempt, ?delay, next = %next.url, error = %err, "Retrying fetch");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.cancelled() => return Err(FetchError::Cancelled),
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ProbeFn;
    use crate::shutdown::Shutdown;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn always_up() -> ProbeFn {
        Arc::new(|_endpoint: Endpoint| async { Ok(1u64) }.boxed())
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1000),
            cap_delay: Duration::from_millis(8000),
        }
    }

    fn coordinator(urls: &[&str], shutdown: &Shutdown) -> FetchCoordinator {
        FetchCoordinator::new(
            CacheStore::new(),
            EndpointPool::new(urls.iter().copied(), always_up(), Duration::from_secs(5)),
            HealthMonitor::new(3),
            policy(3),
            Duration::from_millis(1000),
            shutdown.listener(),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(10);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 8000, 8000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_producer() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);
        coordinator
            .cache()
            .set("market-data", &vec![1u32, 2, 3], Duration::from_secs(30))
            .expect("Set should succeed");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let value: Vec<u32> = coordinator
            .fetch("market-data", Duration::from_secs(30), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!([9])) }
            })
            .await
            .expect("Should hit cache");

        assert_eq!(value, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_one_producer_call() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetches = (0..10).map(|_| {
            let counter = Arc::clone(&calls);
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .fetch::<u64, _, _>("market-data", Duration::from_secs(30), move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(json!(42))
                        }
                    })
                    .await
            }
        });
        let results = join_all(fetches).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(42)));
        assert!(!coordinator.is_in_flight("market-data"));
        assert!(coordinator.cache().is_fresh("market-data"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_share_the_same_error() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetches = (0..5).map(|_| {
            let counter = Arc::clone(&calls);
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .fetch::<u64, _, _>("user-positions:x", Duration::from_secs(30), move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err(FetchError::IdentityInvalid("x".to_string()))
                        }
                    })
                    .await
            }
        });
        let results = join_all(fetches).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| r == &Err(FetchError::IdentityInvalid("x".to_string()))));
        assert_eq!(coordinator.failure_count("user-positions:x"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delays_follow_backoff_then_succeed() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);
        let attempts_at = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&attempts_at);

        let value: u64 = coordinator
            .fetch("protocol-analytics", Duration::from_secs(30), move |_| {
                let mut attempts = recorder.lock().unwrap();
                attempts.push(Instant::now());
                let failing = attempts.len() <= 2;
                async move {
                    if failing {
                        Err(FetchError::Transient("503".to_string()))
                    } else {
                        Ok(json!(7))
                    }
                }
            })
            .await
            .expect("Third attempt succeeds");

        assert_eq!(value, 7);
        let attempts = attempts_at.lock().unwrap();
        let delays: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
        assert_eq!(coordinator.failure_count("protocol-analytics"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_propagate_last_error() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<u64, _> = coordinator
            .fetch("market-data", Duration::from_secs(30), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Transient("timeout".to_string())) }
            })
            .await;

        assert_eq!(result, Err(FetchError::Transient("timeout".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.failure_count("market-data"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_to_second_endpoint_hides_error() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["http://a", "http://b"], &shutdown);

        let value: u64 = coordinator
            .fetch("market-data", Duration::from_secs(30), |endpoint: Endpoint| async move {
                if endpoint.url == "http://a" {
                    Err(FetchError::Transient("connection refused".to_string()))
                } else {
                    Ok(json!(99))
                }
            })
            .await
            .expect("Fetch should succeed on b");

        assert_eq!(value, 99);
        assert_eq!(
            coordinator.pool().active_endpoint().map(|e| e.url),
            Ok("http://b".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_key_fetched_during_failover_uses_next_endpoint() {
        let shutdown = Shutdown::new();
        let slow_b: ProbeFn = Arc::new(|endpoint: Endpoint| {
            async move {
                if endpoint.url == "http://b" {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(2)
                } else {
                    Err(FetchError::Transient("refused".to_string()))
                }
            }
            .boxed()
        });
        let health = HealthMonitor::new(3);
        let coordinator = FetchCoordinator::new(
            CacheStore::new(),
            EndpointPool::new(["http://a", "http://b"], slow_b, Duration::from_secs(5)),
            health.clone(),
            policy(3),
            Duration::from_millis(1000),
            shutdown.listener(),
        );
        let only_b = |endpoint: Endpoint| async move {
            if endpoint.url == "http://a" {
                Err(FetchError::Transient("connection refused".to_string()))
            } else {
                Ok(json!(1))
            }
        };

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .fetch::<u64, _, _>("market-data", Duration::from_secs(30), only_b)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = coordinator
            .fetch::<u64, _, _>("protocol-analytics", Duration::from_secs(30), only_b)
            .await;

        assert_eq!(second, Ok(1));
        assert_eq!(first.await.expect("Task should not panic"), Ok(1));
        assert!(health.is_healthy());
        assert_eq!(coordinator.failure_count("protocol-analytics"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_fails_over() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["http://a", "http://b"], &shutdown);

        let value: Vec<String> = coordinator
            .fetch("market-data", Duration::from_secs(30), |endpoint: Endpoint| async move {
                if endpoint.url == "http://a" {
                    Ok(json!({"unexpected": true}))
                } else {
                    Ok(json!(["SOL", "USDC"]))
                }
            })
            .await
            .expect("b returns well-formed data");

        assert_eq!(value, vec!["SOL".to_string(), "USDC".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_without_alternative_is_not_retried() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["http://a"], &shutdown);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<u64, _> = coordinator
            .fetch("market-data", Duration::from_secs(30), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!("not a number")) }
            })
            .await;

        assert!(matches!(result, Err(FetchError::MalformedResponse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.cache().is_fresh("market-data"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_error_leaves_pool_untouched() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["http://a", "http://b"], &shutdown);

        let result: Result<u64, _> = coordinator
            .fetch("user-positions:bad", Duration::from_secs(30), |_| async {
                Err(FetchError::IdentityInvalid("bad".to_string()))
            })
            .await;

        assert!(matches!(result, Err(FetchError::IdentityInvalid(_))));
        assert_eq!(
            coordinator.pool().active_endpoint().map(|e| e.url),
            Ok("http://a".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_fetch_interval_serves_stale_value() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |coordinator: FetchCoordinator, calls: Arc<AtomicUsize>| async move {
            coordinator
                .fetch::<u64, _, _>("market-data", Duration::from_millis(100), move |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst) as u64;
                    async move { Ok(json!(n)) }
                })
                .await
        };

        assert_eq!(fetch(coordinator.clone(), Arc::clone(&calls)).await, Ok(0));
        // Stale after 200ms, but still inside the 1s spacing window
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(fetch(coordinator.clone(), Arc::clone(&calls)).await, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(900)).await;
        assert_eq!(fetch(coordinator.clone(), Arc::clone(&calls)).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_fetch_interval_waits_without_cached_value() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);

        let first: Result<u64, _> = coordinator
            .fetch("k", Duration::from_secs(30), |_| async {
                Err(FetchError::IdentityInvalid("nope".to_string()))
            })
            .await;
        assert!(first.is_err());

        let started = Instant::now();
        let second: u64 = coordinator
            .fetch("k", Duration::from_secs(30), |_| async { Ok(json!(5)) })
            .await
            .expect("Second fetch succeeds");

        assert_eq!(second, 5);
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_after_shutdown_is_not_cached() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .fetch::<u64, _, _>("market-data", Duration::from_secs(30), |_| async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok(json!(1))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();

        let result = pending.await.expect("Task should not panic");
        assert_eq!(result, Ok(1));
        assert!(coordinator.cache().is_empty());

        let after: Result<u64, _> = coordinator
            .fetch("market-data", Duration::from_secs(30), |_| async { Ok(json!(2)) })
            .await;
        assert_eq!(after, Err(FetchError::Cancelled));
    }

    #[test]
    fn test_seal_waits_for_write_in_progress() {
        let shutdown = Arc::new(Shutdown::new());
        let coordinator = FetchCoordinator::new(
            CacheStore::new(),
            EndpointPool::new(["a"], always_up(), Duration::from_secs(5)),
            HealthMonitor::new(3),
            policy(3),
            Duration::from_millis(1000),
            shutdown.listener(),
        );
        let writing = lock(&coordinator.inner.commit);

        let stopping = {
            let shutdown = Arc::clone(&shutdown);
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                shutdown.trigger();
                coordinator.seal();
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!stopping.is_finished());

        drop(writing);
        stopping.join().expect("Thread should not panic");
        assert!(!coordinator.store("market-data", json!(1), Duration::from_secs(30)));
        assert!(coordinator.cache().is_empty());
    }

    #[test]
    fn test_store_writes_while_running() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);
        assert!(coordinator.store("health-probe", json!(300), Duration::from_secs(60)));
        assert!(coordinator.cache().is_fresh("health-probe"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_entries_are_pruned_after_the_window() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);

        for wallet in ["user-positions:w1", "user-positions:w2"] {
            let _: u64 = coordinator
                .fetch(wallet, Duration::from_secs(20), |_| async { Ok(json!(1)) })
                .await
                .expect("Fetch succeeds");
        }
        assert_eq!(lock(&coordinator.inner.last_issued).len(), 2);

        tokio::time::advance(Duration::from_millis(1500)).await;
        let _: u64 = coordinator
            .fetch("market-data", Duration::from_secs(30), |_| async { Ok(json!(2)) })
            .await
            .expect("Fetch succeeds");

        let last_issued = lock(&coordinator.inner.last_issued);
        assert_eq!(last_issued.len(), 1);
        assert!(last_issued.contains_key("market-data"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_failure_count() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);
        let _: Result<u64, _> = coordinator
            .fetch("user-positions:old", Duration::from_secs(20), |_| async {
                Err(FetchError::IdentityInvalid("old".to_string()))
            })
            .await;
        assert_eq!(coordinator.failure_count("user-positions:old"), 1);

        coordinator.forget("user-positions:old");

        assert_eq!(coordinator.failure_count("user-positions:old"), 0);
        assert!(!lock(&coordinator.inner.last_issued).contains_key("user-positions:old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let shutdown = Shutdown::new();
        let coordinator = coordinator(&["a"], &shutdown);

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .fetch::<u64, _, _>("market-data", Duration::from_secs(30), |_| async {
                        Err(FetchError::Transient("down".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.trigger();

        let result = pending.await.expect("Task should not panic");
        assert_eq!(result, Err(FetchError::Cancelled));
    }
}
