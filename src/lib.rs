//! lendsync - client-side data synchronization for a lending protocol dashboard
//!
//! The crate keeps market, analytics and wallet position data fresh against a
//! set of ranked JSON-RPC endpoints. `engine::SyncEngine` is the entry point;
//! the other modules are its building blocks and are public for reuse and
//! integration tests.

pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod health;
pub mod pool;
pub mod scheduler;
pub mod shutdown;

pub use config::EngineConfig;
pub use data::{DataSource, Identity, RpcClient};
pub use engine::{Snapshot, SyncEngine, SyncState};
pub use error::{ConfigError, FetchError};
