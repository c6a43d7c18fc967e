//! Ranked endpoint pool with liveness probing and failover
//!
//! The pool keeps the configured endpoints in preference order and tracks
//! which one is currently active. Probes fan out to all endpoints at once and
//! each is bounded by the probe timeout, so a full round never takes longer
//! than that timeout no matter how many endpoints hang.

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Probe operation run against a single endpoint; resolves to the ledger height
pub type ProbeFn =
    Arc<dyn Fn(Endpoint) -> BoxFuture<'static, Result<u64, FetchError>> + Send + Sync>;

/// A candidate remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Base URL requests are sent to
    pub url: String,
    /// Preference order, 0 is the most preferred
    pub rank: usize,
    /// When the endpoint was last probed
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Result of the last probe or live fetch
    pub is_healthy: bool,
    /// Ledger height reported by the last successful probe
    pub ledger_height: Option<u64>,
}

impl Endpoint {
    /// Creates an endpoint that has not been probed yet
    pub fn new(url: impl Into<String>, rank: usize) -> Self {
        Self {
            url: url.into(),
            rank,
            last_probe_at: None,
            is_healthy: true,
            ledger_height: None,
        }
    }
}

#[derive(Debug)]
struct PoolState {
    /// Sorted by rank
    endpoints: Vec<Endpoint>,
    /// Index into `endpoints`
    active: Option<usize>,
}

impl PoolState {
    fn best_healthy(&self) -> Option<usize> {
        self.endpoints.iter().position(|e| e.is_healthy)
    }

    fn index_of(&self, url: &str) -> Option<usize> {
        self.endpoints.iter().position(|e| e.url == url)
    }
}

/// Shared pool of endpoints; clones refer to the same pool
#[derive(Clone)]
pub struct EndpointPool {
    state: Arc<RwLock<PoolState>>,
    probe: ProbeFn,
    probe_timeout: Duration,
    /// Serializes probe rounds so failovers do not fan out twice
    probe_round: Arc<AsyncMutex<()>>,
}

impl fmt::Debug for EndpointPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointPool")
            .field("endpoints", &self.endpoints())
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl EndpointPool {
    /// Creates a pool from URLs given in preference order
    ///
    /// Before the first probe every endpoint is assumed healthy and the first
    /// one is active.
    pub fn new<I, S>(urls: I, probe: ProbeFn, probe_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<Endpoint> = urls
            .into_iter()
            .enumerate()
            .map(|(rank, url)| Endpoint::new(url, rank))
            .collect();
        let active = if endpoints.is_empty() { None } else { Some(0) };

        Self {
            state: Arc::new(RwLock::new(PoolState { endpoints, active })),
            probe,
            probe_timeout,
            probe_round: Arc::new(AsyncMutex::new(())),
        }
    }

    /// The endpoint fetches should currently go to
    pub fn active_endpoint(&self) -> Result<Endpoint, FetchError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .active
            .and_then(|index| state.endpoints.get(index).cloned())
            .ok_or(FetchError::NoHealthyEndpoint)
    }

    /// Snapshot of all endpoints in rank order
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.endpoints.clone()
    }

    /// Whether any endpoint is currently usable
    pub fn has_healthy_endpoint(&self) -> bool {
        self.active_endpoint().is_ok()
    }

    /// Probes every endpoint concurrently and promotes the best-ranked
    /// responder to active
    pub async fn probe_all(&self, timeout: Duration) -> Result<Endpoint, FetchError> {
        let _round = self.probe_round.lock().await;
        let candidates = self.endpoints();
        self.probe_and_apply(candidates, timeout).await;
        self.log_active()
    }

    /// Reports a live fetch failure against `endpoint` and fails over
    ///
    /// The endpoint is marked unhealthy and the remaining endpoints are
    /// re-probed right away. The failed endpoint is only probed again in this
    /// round when nothing else answers.
    pub async fn mark_failed(&self, endpoint: &Endpoint) -> Result<Endpoint, FetchError> {
        let _round = self.probe_round.lock().await;

        let others = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let Some(index) = state.index_of(&endpoint.url) else {
                return Err(FetchError::NoHealthyEndpoint);
            };
            state.endpoints[index].is_healthy = false;

            // Someone already failed over to a working endpoint
            if let Some(active) = state.active {
                if active != index && state.endpoints[active].is_healthy {
                    debug!(failed = %endpoint.url, "Endpoint already replaced");
                    return Ok(state.endpoints[active].clone());
                }
            }
            // Readers keep a usable endpoint while the round runs: the next
            // healthy one if any, otherwise the current one until the round
            // publishes its outcome
            if let Some(next) = state.best_healthy() {
                state.active = Some(next);
            }

            state
                .endpoints
                .iter()
                .filter(|e| e.url != endpoint.url)
                .cloned()
                .collect::<Vec<_>>()
        };

        warn!(url = %endpoint.url, "Endpoint failed a live fetch, failing over");
        self.probe_and_apply(others, self.probe_timeout).await;

        if !self.has_healthy_endpoint() {
            debug!(url = %endpoint.url, "No alternative endpoint, re-probing failed one");
            self.probe_and_apply(vec![endpoint.clone()], self.probe_timeout)
                .await;
        }
        self.log_active()
    }

    /// Runs probes for `candidates` and writes the outcomes back
    async fn probe_and_apply(&self, candidates: Vec<Endpoint>, timeout: Duration) {
        let probes = candidates.into_iter().map(|endpoint| {
            let probe = Arc::clone(&self.probe);
            async move {
                let outcome = match tokio::time::timeout(timeout, probe(endpoint.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Transient(format!(
                        "probe timed out after {:?}",
                        timeout
                    ))),
                };
                (endpoint.url, outcome)
            }
        });
        let results = join_all(probes).await;

        let now = Utc::now();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for (url, outcome) in results {
            let Some(index) = state.index_of(&url) else {
                continue;
            };
            let endpoint = &mut state.endpoints[index];
            endpoint.last_probe_at = Some(now);
            match outcome {
                Ok(height) => {
                    debug!(url = %url, height, "Probe succeeded");
                    endpoint.is_healthy = true;
                    endpoint.ledger_height = Some(height);
                }
                Err(err) => {
                    debug!(url = %url, error = %err, "Probe failed");
                    endpoint.is_healthy = false;
                }
            }
        }
        state.active = state.best_healthy();
    }

    fn log_active(&self) -> Result<Endpoint, FetchError> {
        match self.active_endpoint() {
            Ok(endpoint) => {
                info!(url = %endpoint.url, rank = endpoint.rank, "Active endpoint");
                Ok(endpoint)
            }
            Err(err) => {
                warn!("No healthy endpoint left");
                Err(err)
            }
        }
    }
}
