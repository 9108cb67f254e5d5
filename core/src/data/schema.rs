//! Database schema definitions
//!
//! The table layout is a contract with external export tooling: column names
//! and the canonical `!xxxxxxxx` node id text must stay stable.
//!
//! Tables are self-contained (no foreign keys) so each one can be pruned on
//! its own retention window.

use rusqlite::Connection;

/// Creates all required database tables
pub fn create_all_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_packet_table(conn)?;
    create_neighbor_edge_table(conn)?;
    create_node_stat_tables(conn)?;
    create_topology_reporter_table(conn)?;
    Ok(())
}

/// Packet log: one row per received packet, never updated
pub fn create_packet_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS packets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            from_id TEXT NOT NULL,
            to_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            snr REAL,
            rssi INTEGER,
            hops_away INTEGER,
            channel INTEGER,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            payload TEXT,
            source TEXT NOT NULL DEFAULT 'direct_radio'
        )",
        [],
    )?;

    // Retention sweeps and time-window queries
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_packets_timestamp ON packets(timestamp)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_packets_from ON packets(from_id, timestamp)",
        [],
    )?;

    Ok(())
}

/// Neighbor edges: latest observation per (observer, neighbor, source)
///
/// `last_seen` is the observation time, not the insert time, so late
/// arrivals can be compared against it.
pub fn create_neighbor_edge_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS neighbor_edges (
            observer_id TEXT NOT NULL,
            neighbor_id TEXT NOT NULL,
            source TEXT NOT NULL CHECK (source IN ('direct_radio', 'relay_bridge')),
            snr REAL,
            last_seen INTEGER NOT NULL,
            broadcast_interval INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (observer_id, neighbor_id, source)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_neighbor_edges_last_seen ON neighbor_edges(last_seen)",
        [],
    )?;

    Ok(())
}

/// Per-node aggregates
///
/// `node_stats` holds counters per (node, kind); `node_stat_hours` is the
/// hour-of-day histogram (UTC). Each row carries its own `last_seen`.
pub fn create_node_stat_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS node_stats (
            node_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            packet_count INTEGER NOT NULL DEFAULT 0,
            byte_total INTEGER NOT NULL DEFAULT 0,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            PRIMARY KEY (node_id, kind)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_node_stats_last_seen ON node_stats(last_seen)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS node_stat_hours (
            node_id TEXT NOT NULL,
            hour INTEGER NOT NULL CHECK (hour >= 0 AND hour < 24),
            packet_count INTEGER NOT NULL DEFAULT 0,
            last_seen INTEGER NOT NULL,
            PRIMARY KEY (node_id, hour)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_node_stat_hours_last_seen ON node_stat_hours(last_seen)",
        [],
    )?;

    Ok(())
}

/// Nodes that have sent at least one neighbor report
pub fn create_topology_reporter_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS topology_reporters (
            node_id TEXT PRIMARY KEY NOT NULL,
            first_reported INTEGER NOT NULL,
            last_reported INTEGER NOT NULL,
            last_source TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}
