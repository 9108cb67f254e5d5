//! Public interface of the bridge
//!
//! - `core`: the [`Bridge`] (start/stop, relay entry point)
//! - `config`: [`BridgeConfig`] and validation
//! - `query`: read-only [`QueryService`]
//! - `error`: [`BridgeError`]

mod config;
mod core;
mod error;
mod query;

pub use self::config::{BridgeConfig, ConfigError, TransportConfig};
pub use self::core::{Bridge, STOP_GRACE_PERIOD};
pub use self::error::BridgeError;
pub use self::query::{BridgeStats, QueryService};
