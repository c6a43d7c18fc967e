//! Command-line interface for the lendsync status monitor
//!
//! Parses arguments with clap, resolves the engine configuration from the
//! config file plus overrides, and renders snapshots as plain text.

use clap::Parser;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::config::{default_config_path, EngineConfig};
use crate::data::Identity;
use crate::engine::{Snapshot, SyncState};
use crate::error::ConfigError;

/// lendsync - keep lending protocol data in sync from ranked RPC endpoints
#[derive(Parser, Debug)]
#[command(name = "lendsync")]
#[command(about = "Lending protocol data sync with endpoint failover")]
#[command(version)]
pub struct Cli {
    /// Path to the JSON config file (defaults to the XDG config directory)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// RPC endpoint in preference order; repeat to add more
    ///
    /// Replaces the endpoints from the config file.
    #[arg(long = "endpoint", value_name = "URL")]
    pub endpoints: Vec<String>,

    /// Wallet address whose positions are tracked
    #[arg(long, value_name = "ADDRESS")]
    pub wallet: Option<String>,

    /// Print one snapshot after the initial load and exit
    #[arg(long)]
    pub once: bool,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Builds the engine configuration from the config file and flags
    ///
    /// # Returns
    /// * `Ok(EngineConfig)` with `--endpoint` overrides applied
    /// * `Err(ConfigError)` if the file is unreadable or the result is invalid
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let path = self.config.clone().or_else(default_config_path);
        let mut config = match path {
            Some(path) => EngineConfig::load(&path)?,
            None => EngineConfig::default(),
        };

        if !self.endpoints.is_empty() {
            config.endpoints = self.endpoints.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.wallet.as_deref().map(Identity::new)
    }
}

fn state_label(state: SyncState) -> &'static str {
    match state {
        SyncState::Idle => "idle",
        SyncState::Loading => "loading",
        SyncState::Ready => "ready",
        SyncState::Stopped => "stopped",
    }
}

/// Renders a snapshot as a plain-text status report
pub fn format_snapshot(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    let updated = snapshot
        .last_updated
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    let _ = writeln!(
        out,
        "[{}] connection: {}  endpoint: {}  updated: {}",
        state_label(snapshot.state),
        if snapshot.connection_healthy { "healthy" } else { "degraded" },
        snapshot.active_endpoint.as_deref().unwrap_or("none"),
        updated
    );

    if let Some(error) = &snapshot.error {
        let _ = writeln!(out, "error: {}", error.message);
    }

    if let Some(analytics) = &snapshot.analytics {
        let _ = writeln!(
            out,
            "TVL ${:.2}  supplied ${:.2}  borrowed ${:.2}  obligations {}",
            analytics.total_value_locked,
            analytics.total_supplied,
            analytics.total_borrowed,
            analytics.active_obligations
        );
    }

    if !snapshot.markets.is_empty() {
        let _ = writeln!(
            out,
            "{:<8} {:>14} {:>14} {:>8} {:>8} {:>6}",
            "ASSET", "SUPPLY", "BORROWED", "DEPOSIT", "BORROW", "UTIL"
        );
        for market in &snapshot.markets {
            let _ = writeln!(
                out,
                "{:<8} {:>14.2} {:>14.2} {:>7.2}% {:>7.2}% {:>5.1}%",
                market.symbol,
                market.liquidity_supply,
                market.total_borrowed,
                market.deposit_rate * 100.0,
                market.borrow_rate * 100.0,
                market.utilization() * 100.0
            );
        }
    }

    if let Some(identity) = &snapshot.identity {
        let _ = writeln!(
            out,
            "wallet {}: supplied ${:.2}, borrowed ${:.2}",
            identity,
            snapshot.supplied_value(),
            snapshot.borrowed_value()
        );
    }

    out
}
