//! Connection health tracking
//!
//! `HealthMonitor` folds fetch outcomes and probe rounds into a single
//! healthy/unhealthy flag that the scheduler reads to pick its cadence.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::error::FetchError;

/// Current view of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    /// Failed fetch cycles since the last success
    pub consecutive_failures: u32,
    pub is_healthy: bool,
    /// Last time a probe round or fetch outcome updated this state
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            is_healthy: true,
            last_checked_at: None,
        }
    }
}

/// Shared, cloneable handle to the connection health
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    state: Arc<Mutex<HealthState>>,
    unhealthy_after: u32,
}

impl HealthMonitor {
    /// `unhealthy_after` consecutive failures flip the connection to unhealthy
    pub fn new(unhealthy_after: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(HealthState::default())),
            unhealthy_after: unhealthy_after.max(1),
        }
    }

    fn update<F: FnOnce(&mut HealthState)>(&self, f: F) -> HealthState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let was_healthy = state.is_healthy;
        f(&mut state);
        state.last_checked_at = Some(Utc::now());

        if was_healthy && !state.is_healthy {
            warn!(
                failures = state.consecutive_failures,
                "Connection degraded"
            );
        } else if !was_healthy && state.is_healthy {
            info!("Connection recovered");
        }
        state.clone()
    }

    pub fn state(&self) -> HealthState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.state().is_healthy
    }

    /// A fetch succeeded against the remote
    pub fn record_success(&self) -> HealthState {
        self.update(|state| {
            state.consecutive_failures = 0;
            state.is_healthy = true;
        })
    }

    /// A fetch failed after exhausting its attempts
    ///
    /// Identity errors say nothing about the connection and are ignored;
    /// running out of endpoints degrades the connection at once.
    pub fn record_failure(&self, error: &FetchError) -> HealthState {
        if !error.affects_endpoint() && !error.is_connection_wide() {
            return self.state();
        }
        let threshold = self.unhealthy_after;
        let connection_wide = error.is_connection_wide();
        self.update(|state| {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if connection_wide || state.consecutive_failures >= threshold {
                state.is_healthy = false;
            }
        })
    }

    /// A probe round finished; `any_healthy` is whether an endpoint answered
    pub fn record_probe(&self, any_healthy: bool) -> HealthState {
        self.update(|state| {
            if any_healthy {
                state.consecutive_failures = 0;
                state.is_healthy = true;
            } else {
                state.is_healthy = false;
            }
        })
    }
}
