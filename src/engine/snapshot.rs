//! Consumer-facing snapshot and its publication
//!
//! A `Snapshot` is never mutated once handed out. Every change builds a new
//! one, swaps it in and sends it to each subscriber, all under one lock so
//! subscribers observe replacements in the order they happened.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::data::{Identity, Market, Position, ProtocolAnalytics};
use crate::error::FetchError;

/// Lifecycle of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Constructed, not started
    #[default]
    Idle,
    /// Started, first protocol refresh not yet successful
    Loading,
    /// Protocol data has been loaded at least once
    Ready,
    /// Stopped for good
    Stopped,
}

/// Error shown to the consumer until it is cleared or expires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotError {
    pub message: String,
    /// Every endpoint is unreachable, not just one resource
    pub connection_wide: bool,
}

impl From<&FetchError> for SnapshotError {
    fn from(err: &FetchError) -> Self {
        Self {
            message: err.to_string(),
            connection_wide: err.is_connection_wide(),
        }
    }
}

/// Everything a dashboard needs to render one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: SyncState,
    pub markets: Vec<Market>,
    pub analytics: Option<ProtocolAnalytics>,
    pub supplied_positions: Vec<Position>,
    pub borrowed_positions: Vec<Position>,
    /// Wallet the positions belong to
    pub identity: Option<Identity>,
    /// Last time any resource was refreshed successfully
    pub last_updated: Option<DateTime<Utc>>,
    pub is_loading: bool,
    pub error: Option<SnapshotError>,
    pub connection_healthy: bool,
    /// URL of the endpoint fetches currently go to
    pub active_endpoint: Option<String>,
    /// Ledger height reported by the last probe
    pub ledger_height: Option<u64>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            markets: Vec::new(),
            analytics: None,
            supplied_positions: Vec::new(),
            borrowed_positions: Vec::new(),
            identity: None,
            last_updated: None,
            is_loading: false,
            error: None,
            connection_healthy: true,
            active_endpoint: None,
            ledger_height: None,
        }
    }
}

impl Snapshot {
    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Total supplied value in USD
    pub fn supplied_value(&self) -> f64 {
        self.supplied_positions.iter().map(|p| p.market_value).sum()
    }

    /// Total borrowed value in USD
    pub fn borrowed_value(&self) -> f64 {
        self.borrowed_positions.iter().map(|p| p.market_value).sum()
    }
}

struct PublisherState {
    current: Arc<Snapshot>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<Snapshot>>>,
    /// Bumped whenever a new error is shown
    error_generation: u64,
    closed: bool,
}

/// Holds the current snapshot and fans replacements out to subscribers
pub(crate) struct Publisher {
    state: Mutex<PublisherState>,
}

impl Publisher {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PublisherState {
                current: Arc::new(Snapshot::default()),
                subscribers: Vec::new(),
                error_generation: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.lock().current)
    }

    /// New receiver for every later replacement; closed once the session stops
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<Snapshot>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if !state.closed {
            state.subscribers.push(tx);
        }
        rx
    }

    /// Applies `f` to a copy of the current snapshot and publishes it if it changed
    pub(crate) fn update<F: FnOnce(&mut Snapshot)>(&self, f: F) -> bool {
        let mut state = self.lock();
        Self::replace(&mut state, f)
    }

    /// Like `update`, additionally showing `error`
    ///
    /// Returns the error generation to expire it with when an error was set.
    pub(crate) fn update_with_error<F: FnOnce(&mut Snapshot)>(
        &self,
        error: Option<&FetchError>,
        f: F,
    ) -> Option<u64> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let shown = error.map(SnapshotError::from);
        let armed = shown.is_some();
        Self::replace(&mut state, |snapshot| {
            f(snapshot);
            if shown.is_some() {
                snapshot.error = shown;
            }
        });
        if armed {
            state.error_generation += 1;
            Some(state.error_generation)
        } else {
            None
        }
    }

    pub(crate) fn clear_error(&self) -> bool {
        self.update(|snapshot| snapshot.error = None)
    }

    /// Clears the error only if no newer one was shown since `generation`
    pub(crate) fn clear_error_if(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.error_generation != generation {
            return false;
        }
        Self::replace(&mut state, |snapshot| snapshot.error = None)
    }

    /// Publishes a last snapshot and disconnects every subscriber
    pub(crate) fn close<F: FnOnce(&mut Snapshot)>(&self, f: F) {
        let mut state = self.lock();
        Self::replace(&mut state, f);
        state.closed = true;
        state.subscribers.clear();
    }

    fn replace<F: FnOnce(&mut Snapshot)>(state: &mut PublisherState, f: F) -> bool {
        if state.closed {
            return false;
        }
        let mut next = Snapshot::clone(&state.current);
        f(&mut next);
        if next == *state.current {
            return false;
        }

        let next = Arc::new(next);
        state.current = Arc::clone(&next);
        state
            .subscribers
            .retain(|tx| tx.send(Arc::clone(&next)).is_ok());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_snapshot() {
        let snapshot = Snapshot::default();
        assert_eq!(snapshot.state, SyncState::Idle);
        assert!(snapshot.connection_healthy);
        assert!(!snapshot.is_errored());
        assert!(snapshot.markets.is_empty());
    }

    #[test]
    fn test_subscriber_gets_each_replacement_once() {
        let publisher = Publisher::new();
        let mut rx = publisher.subscribe();

        assert!(publisher.update(|s| s.state = SyncState::Loading));
        assert!(publisher.update(|s| s.is_loading = true));
        // No change, nothing published
        assert!(!publisher.update(|s| s.is_loading = true));

        let first = rx.try_recv().expect("First replacement");
        let second = rx.try_recv().expect("Second replacement");
        assert_eq!(first.state, SyncState::Loading);
        assert!(!first.is_loading);
        assert!(second.is_loading);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_error_generation_guards_expiry() {
        let publisher = Publisher::new();
        let transient = FetchError::Transient("timeout".to_string());

        let first = publisher
            .update_with_error(Some(&transient), |_| {})
            .expect("Error was shown");
        let second = publisher
            .update_with_error(Some(&FetchError::NoHealthyEndpoint), |_| {})
            .expect("Error was shown");

        // The timer of the first error must not hide the second one
        assert!(!publisher.clear_error_if(first));
        let shown = publisher.current().error.clone().expect("Still errored");
        assert!(shown.connection_wide);

        assert!(publisher.clear_error_if(second));
        assert!(!publisher.current().is_errored());
    }

    #[test]
    fn test_update_without_error_keeps_existing_error() {
        let publisher = Publisher::new();
        publisher.update_with_error(Some(&FetchError::Transient("x".to_string())), |_| {});

        let generation = publisher.update_with_error(None, |s| s.is_loading = true);

        assert!(generation.is_none());
        assert!(publisher.current().is_errored());
    }

    #[test]
    fn test_close_publishes_last_snapshot_and_disconnects() {
        let publisher = Publisher::new();
        let mut rx = publisher.subscribe();

        publisher.close(|s| s.state = SyncState::Stopped);

        let last = rx.try_recv().expect("Final snapshot");
        assert_eq!(last.state, SyncState::Stopped);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(!publisher.update(|s| s.is_loading = true));

        let mut late = publisher.subscribe();
        assert!(matches!(
            late.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
