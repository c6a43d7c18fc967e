//! Boundary to whatever knows the remote wire format
//!
//! Every operation returns the raw JSON payload for one resource. The engine
//! decodes it into the typed models, so a payload of the wrong shape is
//! classified as a malformed response of the endpoint that produced it.

use serde_json::Value;
use std::future::Future;

use super::Identity;
use crate::error::FetchError;
use crate::pool::Endpoint;

/// A remote provider of protocol data, queried one endpoint at a time
pub trait DataSource: Send + Sync + 'static {
    /// Cheap liveness round-trip; returns the current ledger height
    fn probe(&self, endpoint: &Endpoint) -> impl Future<Output = Result<u64, FetchError>> + Send;

    /// Market list with reserve rates
    fn fetch_markets(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<Value, FetchError>> + Send;

    /// Protocol-wide analytics
    fn fetch_analytics(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<Value, FetchError>> + Send;

    /// Supplied and borrowed positions of one wallet
    fn fetch_positions(
        &self,
        endpoint: &Endpoint,
        identity: &Identity,
    ) -> impl Future<Output = Result<Value, FetchError>> + Send;
}
