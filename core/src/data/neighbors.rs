//! Neighbor edge data access layer
//!
//! One row per (observer, neighbor, source). An upsert only lands when its
//! observation time is at least as new as the stored one, so neighbor
//! reports delivered out of order (relay backlog, retransmits) can never
//! roll an edge back to an older state.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::mesh::{NodeId, Provenance};

use super::current_timestamp;

/// Default neighbor edge retention (30 days)
pub const EDGE_RETENTION_SECS: i64 = 30 * 24 * 60 * 60;

/// A stored neighbor observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborEdge {
    pub observer: NodeId,
    pub neighbor: NodeId,
    /// SNR the observer measured for the neighbor
    pub snr: Option<f64>,
    /// Observation time (unix secs)
    pub last_seen: i64,
    /// Neighbor's broadcast interval (secs)
    pub broadcast_interval: Option<u32>,
    pub source: Provenance,
}

/// Result of an edge upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeUpsert {
    /// Row inserted or overwritten
    Applied,
    /// A newer observation is already stored; nothing changed
    Stale,
}

/// Node that has published at least one neighbor report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyReporter {
    pub node: NodeId,
    pub first_reported: i64,
    pub last_reported: i64,
    pub last_source: Provenance,
}

/// Insert or update an edge, keeping the newest observation
///
/// Ties on `timestamp` go to the later arrival.
pub fn upsert_neighbor_edge(
    conn: &Connection,
    observer: NodeId,
    neighbor: NodeId,
    snr: Option<f64>,
    timestamp: i64,
    broadcast_interval: Option<u32>,
    source: Provenance,
) -> rusqlite::Result<EdgeUpsert> {
    let rows = conn.execute(
        "INSERT INTO neighbor_edges
            (observer_id, neighbor_id, source, snr, last_seen, broadcast_interval, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(observer_id, neighbor_id, source) DO UPDATE SET
             snr = excluded.snr,
             last_seen = excluded.last_seen,
             broadcast_interval = COALESCE(excluded.broadcast_interval, neighbor_edges.broadcast_interval),
             updated_at = excluded.updated_at
         WHERE excluded.last_seen >= neighbor_edges.last_seen",
        params![
            observer,
            neighbor,
            source.as_str(),
            snr,
            timestamp,
            broadcast_interval,
            current_timestamp(),
        ],
    )?;

    Ok(if rows > 0 {
        EdgeUpsert::Applied
    } else {
        EdgeUpsert::Stale
    })
}

/// Get one edge by its full key
pub fn get_neighbor_edge(
    conn: &Connection,
    observer: NodeId,
    neighbor: NodeId,
    source: Provenance,
) -> rusqlite::Result<Option<NeighborEdge>> {
    conn.query_row(
        "SELECT observer_id, neighbor_id, snr, last_seen, broadcast_interval, source
         FROM neighbor_edges
         WHERE observer_id = ?1 AND neighbor_id = ?2 AND source = ?3",
        params![observer, neighbor, source.as_str()],
        parse_edge_row,
    )
    .optional()
}

/// Edges reported by `observer` observed at or after `since`
pub fn query_neighbors(
    conn: &Connection,
    observer: NodeId,
    since: i64,
) -> rusqlite::Result<Vec<NeighborEdge>> {
    let mut stmt = conn.prepare(
        "SELECT observer_id, neighbor_id, snr, last_seen, broadcast_interval, source
         FROM neighbor_edges
         WHERE observer_id = ?1 AND last_seen >= ?2
         ORDER BY neighbor_id, source",
    )?;
    let rows = stmt.query_map(params![observer, since], parse_edge_row)?;
    rows.collect()
}

/// Every edge observed at or after `since`
pub fn query_all_edges(conn: &Connection, since: i64) -> rusqlite::Result<Vec<NeighborEdge>> {
    let mut stmt = conn.prepare(
        "SELECT observer_id, neighbor_id, snr, last_seen, broadcast_interval, source
         FROM neighbor_edges
         WHERE last_seen >= ?1
         ORDER BY observer_id, neighbor_id, source",
    )?;
    let rows = stmt.query_map([since], parse_edge_row)?;
    rows.collect()
}

fn parse_edge_row(row: &rusqlite::Row) -> rusqlite::Result<NeighborEdge> {
    let source: String = row.get(5)?;
    let source = Provenance::from_name(&source).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(5, "source".to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(NeighborEdge {
        observer: row.get(0)?,
        neighbor: row.get(1)?,
        snr: row.get(2)?,
        last_seen: row.get(3)?,
        broadcast_interval: row.get(4)?,
        source,
    })
}

/// Delete edges observed before `cutoff`
pub fn prune_edges(conn: &Connection, cutoff: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM neighbor_edges WHERE last_seen < ?1", [cutoff])
}

/// Record that `node` publishes neighbor reports
pub fn mark_topology_reporter(
    conn: &Connection,
    node: NodeId,
    reported_at: i64,
    source: Provenance,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO topology_reporters (node_id, first_reported, last_reported, last_source)
         VALUES (?1, ?2, ?2, ?3)
         ON CONFLICT(node_id) DO UPDATE SET
             first_reported = MIN(first_reported, excluded.first_reported),
             last_source = CASE
                 WHEN excluded.last_reported >= last_reported THEN excluded.last_source
                 ELSE last_source
             END,
             last_reported = MAX(last_reported, excluded.last_reported)",
        params![node, reported_at, source.as_str()],
    )?;
    Ok(())
}

/// Whether `node` has ever been seen publishing neighbor reports
pub fn is_topology_reporter(conn: &Connection, node: NodeId) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM topology_reporters WHERE node_id = ?1",
        [node],
        |row| row.get(0),
    )
}

/// Reporters active at or after `since`
pub fn query_topology_reporters(
    conn: &Connection,
    since: i64,
) -> rusqlite::Result<Vec<TopologyReporter>> {
    let mut stmt = conn.prepare(
        "SELECT node_id, first_reported, last_reported, last_source
         FROM topology_reporters
         WHERE last_reported >= ?1
         ORDER BY node_id",
    )?;
    let rows = stmt.query_map([since], |row| {
        let source: String = row.get(3)?;
        Ok(TopologyReporter {
            node: row.get(0)?,
            first_reported: row.get(1)?,
            last_reported: row.get(2)?,
            last_source: Provenance::from_name(&source).unwrap_or(Provenance::DirectRadio),
        })
    })?;
    rows.collect()
}

/// Delete reporters that have not reported since `cutoff`
pub fn prune_topology_reporters(conn: &Connection, cutoff: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM topology_reporters WHERE last_reported < ?1", [cutoff])
}
