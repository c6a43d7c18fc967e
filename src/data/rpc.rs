//! JSON-RPC over HTTP client for lending protocol endpoints
//!
//! This module implements `DataSource` against nodes that speak JSON-RPC 2.0.
//! Liveness is probed with `getSlot`; protocol data comes from the lending
//! indexer methods exposed next to it.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{DataSource, Identity};
use crate::error::FetchError;
use crate::pool::Endpoint;

/// Borrow-lending program queried by default
const DEFAULT_PROGRAM_ID: &str = "HH6BiQtvsL6mh7En2knBeTDqmGjYCJFiXiqixrG8nndB";

/// Per-request timeout for data calls
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const METHOD_GET_SLOT: &str = "getSlot";
const METHOD_GET_MARKETS: &str = "getLendingMarkets";
const METHOD_GET_ANALYTICS: &str = "getProtocolAnalytics";
const METHOD_GET_POSITIONS: &str = "getUserPositions";

/// JSON-RPC error codes that mean the request itself was not understood
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Outgoing JSON-RPC request envelope
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// Incoming JSON-RPC response envelope
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Client for the lending protocol's JSON-RPC endpoints
#[derive(Debug, Clone)]
pub struct RpcClient {
    client: Client,
    program_id: String,
    request_timeout: Duration,
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcClient {
    /// Create a new RpcClient with default settings
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            program_id: DEFAULT_PROGRAM_ID.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Create a new RpcClient with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            ..Self::new()
        }
    }

    /// Query a different lending program
    pub fn with_program_id(mut self, program_id: impl Into<String>) -> Self {
        self.program_id = program_id.into();
        self
    }

    /// Override the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sends one JSON-RPC call and returns its `result`
    async fn call(&self, url: &str, method: &str, params: Value) -> Result<Value, FetchError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };
        debug!(url, method, "Sending RPC request");

        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient(format!(
                "{} answered {} to {}",
                url, status, method
            )));
        }

        let body = response.error_for_status()?.text().await?;
        parse_response(&body, method)
    }
}

/// Extracts `result` from a JSON-RPC response body
fn parse_response(body: &str, method: &str) -> Result<Value, FetchError> {
    let response: RpcResponse = serde_json::from_str(body)?;

    if let Some(error) = response.error {
        return Err(classify_rpc_error(method, error.code, &error.message));
    }

    response
        .result
        .ok_or_else(|| FetchError::MalformedResponse("response has neither result nor error".to_string()))
}

/// Maps a JSON-RPC error object onto the fetch error taxonomy
fn classify_rpc_error(method: &str, code: i64, message: &str) -> FetchError {
    let text = format!("RPC error {} from {}: {}", code, method, message);
    match code {
        // The only caller-supplied parameter is the wallet address
        INVALID_PARAMS if method == METHOD_GET_POSITIONS => FetchError::IdentityInvalid(text),
        PARSE_ERROR | INVALID_REQUEST | METHOD_NOT_FOUND => FetchError::MalformedResponse(text),
        // Node behind, internal errors and rate limits clear up on their own
        _ => FetchError::Transient(text),
    }
}

impl DataSource for RpcClient {
    async fn probe(&self, endpoint: &Endpoint) -> Result<u64, FetchError> {
        let result = self.call(&endpoint.url, METHOD_GET_SLOT, json!([])).await?;
        result.as_u64().ok_or_else(|| {
            FetchError::MalformedResponse(format!("{} returned non-numeric slot", METHOD_GET_SLOT))
        })
    }

    async fn fetch_markets(&self, endpoint: &Endpoint) -> Result<Value, FetchError> {
        self.call(&endpoint.url, METHOD_GET_MARKETS, json!([self.program_id]))
            .await
    }

    async fn fetch_analytics(&self, endpoint: &Endpoint) -> Result<Value, FetchError> {
        self.call(&endpoint.url, METHOD_GET_ANALYTICS, json!([self.program_id]))
            .await
    }

    async fn fetch_positions(
        &self,
        endpoint: &Endpoint,
        identity: &Identity,
    ) -> Result<Value, FetchError> {
        identity.validate()?;
        let params = json!([self.program_id, identity.as_str()]);
        self.call(&endpoint.url, METHOD_GET_POSITIONS, params).await
    }
}
