//! Meshbridge Core
//!
//! Bridge between a LoRa mesh radio and a durable store.
//!
//! This is the foundation crate that provides:
//! - Supervision of the single radio link (silence detection, reconnects)
//! - SQLite persistence with provenance-tagged neighbor edges
//! - Per-table retention with amortized compaction
//! - A merged topology view with hop-count inference
//!
//! # Module Structure
//!
//! - `bridge/`: Public interface (Bridge, config, query service)
//! - `tasks/`: Background automation (ingest worker, cleanup)
//! - `link/`: Transports, decoder, health monitor, supervisor
//! - `mesh/`: Node ids, packets, neighbor recorder, topology merge
//! - `data/`: SQLite persistence
//! - `testing/`: Test utilities
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use meshbridge_core::{Bridge, BridgeConfig, TransportConfig};
//!
//! let config = BridgeConfig::default()
//!     .with_transport(TransportConfig::serial("/dev/ttyUSB0"));
//! let bridge = Bridge::start(config).await?;
//!
//! // Topology of the last hour, as JSON
//! let json = bridge
//!     .query()
//!     .export_topology(Duration::from_secs(3600), None)
//!     .await?;
//! println!("{}", json);
//!
//! bridge.stop().await;
//! ```

// Public interface
pub mod bridge;

// Internal modules
pub(crate) mod tasks;

// Infrastructure modules (pub for flexibility)
pub mod data;
pub mod link;
pub mod mesh;
pub mod testing;

// Re-export main API types for convenience
pub use bridge::{
    Bridge,
    BridgeConfig,
    BridgeError,
    BridgeStats,
    ConfigError,
    QueryService,
    TransportConfig,
};
pub use link::{LinkState, LinkStatus};
pub use mesh::{EdgeTag, NodeId, TopologySnapshot};
pub use tasks::{IngestCounters, IngestQueue, IngestStats};
