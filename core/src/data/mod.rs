//! Data layer (SQLite persistence)
//!
//! Provides storage and retrieval for:
//! - Packet log (append-only, pruned by age)
//! - Neighbor edges (upsert by observer/neighbor/source, newest wins)
//! - Per-node statistics (incremental counters + hourly histogram)
//! - Topology reporters (nodes that publish neighbor reports)
//!
//! Every table has its own retention window; see `retention`.

pub mod neighbors;
pub mod node_stats;
pub mod packets;
pub mod retention;
pub mod schema;
pub mod start;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use neighbors::{
    get_neighbor_edge, is_topology_reporter, mark_topology_reporter, query_all_edges,
    query_neighbors, query_topology_reporters, upsert_neighbor_edge, EdgeUpsert, NeighborEdge,
    TopologyReporter, EDGE_RETENTION_SECS,
};
pub use node_stats::{
    query_node_stat, update_node_stat, KindCount, NodeStat, NODE_STAT_RETENTION_SECS,
};
pub use packets::{
    query_hop_counts, query_packets, record_packet, HopObservation, PacketFilter,
    PACKET_RETENTION_SECS,
};
pub use retention::{prune, PruneReport, RetentionError, RetentionPolicy};
pub use schema::create_all_tables;
pub use start::{start_db, start_memory_db, StartError};
pub use store::{StorageHealthSnapshot, Store, StoreError, TableCounts};

/// Get current Unix timestamp
///
/// Returns 0 if system clock is before Unix epoch (should never happen
/// on properly configured systems, but avoids panic).
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
