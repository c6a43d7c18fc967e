//! Core data models for the lending protocol dashboard
//!
//! This module contains the resource types the engine keeps in sync, the
//! wallet identity type, the `DataSource` boundary and its JSON-RPC client.

pub mod identity;
pub mod rpc;
pub mod source;

pub use identity::Identity;
pub use rpc::RpcClient;
pub use source::DataSource;

use serde::{Deserialize, Serialize};

/// Cache and deduplication keys for every logical resource
pub mod keys {
    use super::Identity;

    /// Market list with reserve rates
    pub const MARKET_DATA: &str = "market-data";
    /// Protocol-wide analytics
    pub const PROTOCOL_ANALYTICS: &str = "protocol-analytics";
    /// Endpoint liveness probe
    pub const HEALTH_PROBE: &str = "health-probe";

    /// Key for the positions of one wallet
    pub fn user_positions(identity: &Identity) -> String {
        format!("user-positions:{}", identity.as_str())
    }
}

/// A lending reserve as shown in the markets table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Reserve account address
    pub address: String,
    /// Human-readable reserve name
    pub name: String,
    /// Liquidity token symbol
    pub symbol: String,
    /// Liquidity currently available to borrow, in tokens
    pub liquidity_supply: f64,
    /// Liquidity currently borrowed, in tokens
    pub total_borrowed: f64,
    /// Annual deposit rate (0.03 = 3%)
    pub deposit_rate: f64,
    /// Annual borrow rate (0.05 = 5%)
    pub borrow_rate: f64,
    /// Oracle price of one token in USD
    pub price_usd: f64,
}

impl Market {
    /// Share of deposited liquidity that is borrowed, in `[0, 1]`
    pub fn utilization(&self) -> f64 {
        let total = self.liquidity_supply + self.total_borrowed;
        if total <= 0.0 {
            return 0.0;
        }
        self.total_borrowed / total
    }
}

/// Protocol-wide aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolAnalytics {
    /// Total value locked in USD
    pub total_value_locked: f64,
    /// Total supplied value in USD
    pub total_supplied: f64,
    /// Total borrowed value in USD
    pub total_borrowed: f64,
    /// Number of open obligations
    pub active_obligations: u64,
    /// Number of listed reserves
    pub market_count: u32,
}

/// One supplied or borrowed balance of a wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Reserve the balance belongs to
    pub reserve: String,
    /// Token symbol
    pub symbol: String,
    /// Amount in tokens
    pub amount: f64,
    /// Value in USD
    pub market_value: f64,
}

/// Supplied and borrowed balances of a single wallet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPositions {
    pub supplied: Vec<Position>,
    pub borrowed: Vec<Position>,
}

impl UserPositions {
    /// Total supplied value in USD
    pub fn supplied_value(&self) -> f64 {
        self.supplied.iter().map(|p| p.market_value).sum()
    }

    /// Total borrowed value in USD
    pub fn borrowed_value(&self) -> f64 {
        self.borrowed.iter().map(|p| p.market_value).sum()
    }
}
