//! Packet log data access layer
//!
//! Append-only: rows are inserted on arrival and only ever removed by the
//! retention sweep.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use crate::mesh::{NodeId, PacketKind, PacketPayload, PacketRecord, Provenance};

/// Default packet retention (48 hours)
pub const PACKET_RETENTION_SECS: i64 = 48 * 60 * 60;

/// Optional constraints for [`query_packets`]
#[derive(Debug, Clone, Default)]
pub struct PacketFilter {
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
    pub kind: Option<PacketKind>,
    /// Newest rows first, capped at this many
    pub limit: Option<usize>,
}

impl PacketFilter {
    pub fn from_node(node: NodeId) -> Self {
        Self {
            from: Some(node),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: PacketKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Most recent hop count observed for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopObservation {
    pub node: NodeId,
    pub hops_away: u32,
    /// Timestamp of the packet that carried the hop count
    pub last_heard: i64,
}

/// Append a packet record, returning its row id
pub fn record_packet(conn: &Connection, record: &PacketRecord) -> rusqlite::Result<i64> {
    let payload = match &record.payload {
        Some(p) => match serde_json::to_string(p) {
            Ok(json) => Some(json),
            Err(e) => {
                // Keep the packet, lose only the decoded payload
                debug!(error = %e, "failed to encode packet payload");
                None
            }
        },
        None => None,
    };

    conn.execute(
        "INSERT INTO packets
            (timestamp, from_id, to_id, kind, snr, rssi, hops_away, channel, size_bytes, payload, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.timestamp,
            record.from,
            record.to,
            record.kind.as_str(),
            record.snr,
            record.rssi,
            record.hops_away,
            record.channel,
            record.size_bytes,
            payload,
            record.source.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Packets received at or after `since`, newest first
pub fn query_packets(
    conn: &Connection,
    filter: &PacketFilter,
    since: i64,
) -> rusqlite::Result<Vec<PacketRecord>> {
    let mut sql = String::from(
        "SELECT timestamp, from_id, to_id, kind, snr, rssi, hops_away, channel, size_bytes, payload, source
         FROM packets WHERE timestamp >= ?",
    );
    let mut args: Vec<Value> = vec![Value::Integer(since)];

    if let Some(from) = filter.from {
        sql.push_str(" AND from_id = ?");
        args.push(Value::Text(from.key()));
    }
    if let Some(to) = filter.to {
        sql.push_str(" AND to_id = ?");
        args.push(Value::Text(to.key()));
    }
    if let Some(kind) = filter.kind {
        sql.push_str(" AND kind = ?");
        args.push(Value::Text(kind.as_str().to_string()));
    }
    sql.push_str(" ORDER BY timestamp DESC, id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(" LIMIT ?");
        args.push(Value::Integer(limit as i64));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), parse_packet_row)?;
    rows.collect()
}

fn parse_packet_row(row: &rusqlite::Row) -> rusqlite::Result<PacketRecord> {
    let kind: String = row.get(3)?;
    let payload: Option<String> = row.get(9)?;
    let source: String = row.get(10)?;
    Ok(PacketRecord {
        timestamp: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        kind: PacketKind::from_name(&kind),
        snr: row.get(4)?,
        rssi: row.get(5)?,
        hops_away: row.get(6)?,
        channel: row.get(7)?,
        size_bytes: row.get(8)?,
        payload: payload.and_then(|json| serde_json::from_str::<PacketPayload>(&json).ok()),
        source: Provenance::from_name(&source).unwrap_or(Provenance::DirectRadio),
    })
}

/// Latest hop count per node heard directly by our radio since `since`
///
/// Relayed packets are skipped: their hop count is relative to the relay.
pub fn query_hop_counts(conn: &Connection, since: i64) -> rusqlite::Result<Vec<HopObservation>> {
    // SQLite takes bare columns from the row holding MAX(timestamp)
    let mut stmt = conn.prepare(
        "SELECT from_id, hops_away, MAX(timestamp)
         FROM packets
         WHERE timestamp >= ?1 AND hops_away IS NOT NULL AND source = 'direct_radio'
         GROUP BY from_id
         ORDER BY from_id",
    )?;
    let rows = stmt.query_map([since], |row| {
        Ok(HopObservation {
            node: row.get(0)?,
            hops_away: row.get(1)?,
            last_heard: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Delete packets older than `cutoff`
pub fn prune_packets(conn: &Connection, cutoff: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM packets WHERE timestamp < ?1", [cutoff])
}

/// Total number of stored packets
pub fn count_packets(conn: &Connection) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM packets", [], |row| row.get(0))?;
    Ok(count as u64)
}
