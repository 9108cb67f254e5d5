//! Per-node statistics
//!
//! Counters are mutated in place on every packet. Rows carry their own
//! `last_seen` so a node that goes quiet ages out on the stats window,
//! independent of the packet log.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::mesh::{NodeId, PacketKind};

/// Default node stat retention (30 days)
pub const NODE_STAT_RETENTION_SECS: i64 = 30 * 24 * 60 * 60;

/// Packets and bytes for one packet kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCount {
    pub kind: PacketKind,
    pub packets: u64,
    pub bytes: u64,
}

/// Aggregated view of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub node: NodeId,
    pub first_seen: i64,
    pub last_seen: i64,
    pub packet_count: u64,
    pub byte_total: u64,
    /// Sorted by packet count, busiest first
    pub by_kind: Vec<KindCount>,
    /// Packets per UTC hour of day
    pub hourly: [u64; 24],
}

impl NodeStat {
    /// Hour of day with the most packets
    pub fn busiest_hour(&self) -> Option<usize> {
        let (hour, count) = self
            .hourly
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))?;
        if *count == 0 {
            None
        } else {
            Some(hour)
        }
    }
}

/// UTC hour of day for a unix timestamp
pub fn hour_of_day(timestamp: i64) -> u8 {
    (timestamp.rem_euclid(24 * 60 * 60) / 3600) as u8
}

/// Create-or-increment the aggregate for `node`
///
/// The kind counter and the hour bucket move together or not at all.
pub fn update_node_stat(
    conn: &Connection,
    node: NodeId,
    kind: PacketKind,
    byte_count: u32,
    at: i64,
) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO node_stats (node_id, kind, packet_count, byte_total, first_seen, last_seen)
         VALUES (?1, ?2, 1, ?3, ?4, ?4)
         ON CONFLICT(node_id, kind) DO UPDATE SET
             packet_count = packet_count + 1,
             byte_total = byte_total + excluded.byte_total,
             first_seen = MIN(first_seen, excluded.first_seen),
             last_seen = MAX(last_seen, excluded.last_seen)",
        params![node, kind.as_str(), byte_count, at],
    )?;

    tx.execute(
        "INSERT INTO node_stat_hours (node_id, hour, packet_count, last_seen)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(node_id, hour) DO UPDATE SET
             packet_count = packet_count + 1,
             last_seen = MAX(last_seen, excluded.last_seen)",
        params![node, hour_of_day(at), at],
    )?;

    tx.commit()
}

/// Aggregate for `node`, or `None` if nothing is retained for it
pub fn query_node_stat(conn: &Connection, node: NodeId) -> rusqlite::Result<Option<NodeStat>> {
    let mut stmt = conn.prepare(
        "SELECT kind, packet_count, byte_total, first_seen, last_seen
         FROM node_stats WHERE node_id = ?1
         ORDER BY packet_count DESC, kind",
    )?;
    let rows = stmt
        .query_map([node], |row| {
            let kind: String = row.get(0)?;
            let packets: i64 = row.get(1)?;
            let bytes: i64 = row.get(2)?;
            Ok((
                KindCount {
                    kind: PacketKind::from_name(&kind),
                    packets: packets as u64,
                    bytes: bytes as u64,
                },
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Ok(None);
    }

    let first_seen = rows.iter().map(|r| r.1).min().unwrap_or_default();
    let last_seen = rows.iter().map(|r| r.2).max().unwrap_or_default();
    let by_kind: Vec<KindCount> = rows.into_iter().map(|r| r.0).collect();
    let packet_count = by_kind.iter().map(|k| k.packets).sum();
    let byte_total = by_kind.iter().map(|k| k.bytes).sum();

    let mut hourly = [0u64; 24];
    let mut stmt =
        conn.prepare("SELECT hour, packet_count FROM node_stat_hours WHERE node_id = ?1")?;
    let hours = stmt.query_map([node], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
    for hour in hours {
        let (hour, count) = hour?;
        if let Some(slot) = hourly.get_mut(hour as usize) {
            *slot = count as u64;
        }
    }

    Ok(Some(NodeStat {
        node,
        first_seen,
        last_seen,
        packet_count,
        byte_total,
        by_kind,
        hourly,
    }))
}

/// Nodes with any stat row seen at or after `since`
pub fn list_active_nodes(conn: &Connection, since: i64) -> rusqlite::Result<Vec<NodeId>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT node_id FROM node_stats WHERE last_seen >= ?1 ORDER BY node_id",
    )?;
    let rows = stmt.query_map([since], |row| row.get(0))?;
    rows.collect()
}

/// Delete stat rows last touched before `cutoff`
pub fn prune_node_stats(conn: &Connection, cutoff: i64) -> rusqlite::Result<usize> {
    let kinds = conn.execute("DELETE FROM node_stats WHERE last_seen < ?1", [cutoff])?;
    let hours = conn.execute("DELETE FROM node_stat_hours WHERE last_seen < ?1", [cutoff])?;
    Ok(kinds + hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::start_memory_db;

    fn node(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    #[test]
    fn test_hour_of_day() {
        assert_eq!(hour_of_day(0), 0);
        assert_eq!(hour_of_day(3600 * 5 + 59), 5);
        assert_eq!(hour_of_day(86_400 + 3600 * 23), 23);
        assert_eq!(hour_of_day(-1), 23);
    }

    #[test]
    fn test_first_packet_creates_aggregate() {
        let conn = start_memory_db().unwrap();
        assert!(query_node_stat(&conn, node(1)).unwrap().is_none());

        update_node_stat(&conn, node(1), PacketKind::Position, 40, 7200).unwrap();

        let stat = query_node_stat(&conn, node(1)).unwrap().unwrap();
        assert_eq!(stat.packet_count, 1);
        assert_eq!(stat.byte_total, 40);
        assert_eq!(stat.first_seen, 7200);
        assert_eq!(stat.hourly[2], 1);
        assert_eq!(stat.busiest_hour(), Some(2));
    }

    #[test]
    fn test_increments_by_kind_and_hour() {
        let conn = start_memory_db().unwrap();
        update_node_stat(&conn, node(1), PacketKind::Telemetry, 10, 3600).unwrap();
        update_node_stat(&conn, node(1), PacketKind::Telemetry, 15, 3700).unwrap();
        update_node_stat(&conn, node(1), PacketKind::TextMessage, 100, 90_000).unwrap();
        update_node_stat(&conn, node(2), PacketKind::TextMessage, 5, 3600).unwrap();

        let stat = query_node_stat(&conn, node(1)).unwrap().unwrap();
        assert_eq!(stat.packet_count, 3);
        assert_eq!(stat.byte_total, 125);
        assert_eq!(stat.first_seen, 3600);
        assert_eq!(stat.last_seen, 90_000);
        assert_eq!(stat.by_kind[0].kind, PacketKind::Telemetry);
        assert_eq!(stat.by_kind[0].packets, 2);
        assert_eq!(stat.by_kind[0].bytes, 25);
        assert_eq!(stat.hourly[1], 3, "90000 s is 01:00 the next day");
        assert_eq!(stat.hourly.iter().sum::<u64>(), 3);
    }

    #[test]
    fn test_failed_hour_bucket_rolls_back_kind_counter() {
        let conn = start_memory_db().unwrap();
        conn.execute("DROP TABLE node_stat_hours", []).unwrap();

        assert!(update_node_stat(&conn, node(1), PacketKind::Telemetry, 10, 100).is_err());

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM node_stats", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_prune_node_stats() {
        let conn = start_memory_db().unwrap();
        update_node_stat(&conn, node(1), PacketKind::Telemetry, 10, 100).unwrap();
        update_node_stat(&conn, node(2), PacketKind::Telemetry, 10, 5000).unwrap();

        assert_eq!(list_active_nodes(&conn, 0).unwrap(), vec![node(1), node(2)]);

        let deleted = prune_node_stats(&conn, 1000).unwrap();
        assert_eq!(deleted, 2, "one kind row and one hour row");
        assert!(query_node_stat(&conn, node(1)).unwrap().is_none());
        assert!(query_node_stat(&conn, node(2)).unwrap().is_some());
        assert_eq!(prune_node_stats(&conn, 1000).unwrap(), 0);
    }
}
