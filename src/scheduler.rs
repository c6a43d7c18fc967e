//! Background refresh scheduling
//!
//! Runs the three timer lines of a session as tokio tasks:
//! - periodic refresh of everything the session shows, slower while the
//!   connection is degraded,
//! - a debounced refresh of identity-scoped data after the wallet changes,
//! - a fixed-cadence endpoint health probe.
//!
//! All three listen on the session's shutdown signal, and `stop()` aborts
//! them outright so nothing fires after it returns.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::data::Identity;
use crate::shutdown::ShutdownListener;

/// Work the scheduler triggers; implemented by the engine
pub trait Refresher: Send + Sync + 'static {
    /// Refresh protocol data and the positions of the connected wallet
    ///
    /// Entries still within their TTL are served from the cache.
    fn refresh_periodic(&self) -> impl Future<Output = ()> + Send;

    /// Refresh the positions of `identity`
    fn refresh_identity(&self, identity: Identity) -> impl Future<Output = ()> + Send;

    /// Probe all endpoints
    fn probe_health(&self) -> impl Future<Output = ()> + Send;

    /// Current connection health, read before every periodic tick
    fn is_healthy(&self) -> bool;
}

/// Timer settings for the background tasks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Periodic refresh interval while the connection is healthy
    pub healthy_interval: Duration,
    /// Periodic refresh interval while the connection is degraded
    pub degraded_interval: Duration,
    /// Quiet period after the last identity change
    pub debounce_window: Duration,
    /// Interval between endpoint probe rounds
    pub health_check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for SchedulerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            healthy_interval: config.healthy_refresh_interval,
            degraded_interval: config.degraded_refresh_interval,
            debounce_window: config.debounce_window,
            health_check_interval: config.health_check_interval,
        }
    }
}

/// Handle to the running timer tasks of one session
#[derive(Debug)]
pub struct Scheduler {
    identity_tx: watch::Sender<Option<Identity>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawns the background tasks
    ///
    /// # Arguments
    /// * `refresher` - Receives the refresh calls
    /// * `config` - Timer settings
    /// * `shutdown` - Session cancellation signal
    /// * `identity` - Identity already loaded at start; only later changes
    ///   trigger the debounced refresh
    pub fn spawn<R: Refresher>(
        refresher: Arc<R>,
        config: SchedulerConfig,
        shutdown: ShutdownListener,
        identity: Option<Identity>,
    ) -> Self {
        let (identity_tx, identity_rx) = watch::channel(identity);

        let tasks = vec![
            tokio::spawn(periodic_refresh(
                Arc::clone(&refresher),
                config.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(debounced_identity(
                Arc::clone(&refresher),
                identity_rx,
                config.debounce_window,
                shutdown.clone(),
            )),
            tokio::spawn(health_probe(
                refresher,
                config.health_check_interval,
                shutdown,
            )),
        ];
        debug!(?config, "Scheduler started");

        Self {
            identity_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Records a new identity; the debounce window restarts
    pub fn identity_changed(&self, identity: Option<Identity>) {
        self.identity_tx.send_replace(identity);
    }

    /// Aborts every timer task
    pub fn stop(&self) {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.iter().all(JoinHandle::is_finished) {
            return;
        }
        for task in tasks.iter() {
            task.abort();
        }
        info!("Scheduler stopped");
    }

    /// Whether every timer task has exited
    pub fn is_finished(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(JoinHandle::is_finished)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn periodic_refresh<R: Refresher>(
    refresher: Arc<R>,
    config: SchedulerConfig,
    shutdown: ShutdownListener,
) {
    let mut previous: Option<Duration> = None;

    loop {
        let interval = if refresher.is_healthy() {
            config.healthy_interval
        } else {
            config.degraded_interval
        };
        if previous.is_some_and(|p| p != interval) {
            info!(?interval, "Refresh cadence changed");
        }
        previous = Some(interval);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                debug!("Periodic refresh");
                refresher.refresh_periodic().await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn debounced_identity<R: Refresher>(
    refresher: Arc<R>,
    mut identity_rx: watch::Receiver<Option<Identity>>,
    window: Duration,
    shutdown: ShutdownListener,
) {
    // The receiver starts with the spawn-time identity marked as seen
    loop {
        tokio::select! {
            changed = identity_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }

        // Restart the window on every further change
        loop {
            tokio::select! {
                _ = tokio::time::sleep(window) => break,
                changed = identity_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }

        let identity = identity_rx.borrow_and_update().clone();
        match identity {
            Some(identity) => {
                debug!(identity = %identity, "Identity settled, refreshing positions");
                refresher.refresh_identity(identity).await;
            }
            None => debug!("Identity cleared"),
        }
    }
}

async fn health_probe<R: Refresher>(refresher: Arc<R>, every: Duration, shutdown: ShutdownListener) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first tick (immediate)
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                debug!("Scheduled health probe");
                refresher.probe_health().await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
