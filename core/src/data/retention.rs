//! Age-based retention
//!
//! Each table has its own window. A sweep deletes everything older than
//! `now - window` in one transaction; compaction is amortized over several
//! sweeps by [`CompactionSchedule`].

use std::time::Duration;

use rusqlite::Connection;
use serde::Serialize;

use super::neighbors::{prune_edges, prune_topology_reporters, EDGE_RETENTION_SECS};
use super::node_stats::{prune_node_stats, NODE_STAT_RETENTION_SECS};
use super::packets::{prune_packets, PACKET_RETENTION_SECS};

/// Retention window per table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub packets: Duration,
    pub neighbor_edges: Duration,
    pub node_stats: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            packets: Duration::from_secs(PACKET_RETENTION_SECS as u64),
            neighbor_edges: Duration::from_secs(EDGE_RETENTION_SECS as u64),
            node_stats: Duration::from_secs(NODE_STAT_RETENTION_SECS as u64),
        }
    }
}

/// Error for an unusable retention window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionError {
    pub table: &'static str,
    pub reason: &'static str,
}

impl std::fmt::Display for RetentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {} retention: {}", self.table, self.reason)
    }
}

impl std::error::Error for RetentionError {}

/// Longest window accepted (10 years); guards against overflow in cutoffs
const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl RetentionPolicy {
    /// Reject zero or absurd windows
    pub fn validate(&self) -> Result<(), RetentionError> {
        for (table, window) in [
            ("packets", self.packets),
            ("neighbor_edges", self.neighbor_edges),
            ("node_stats", self.node_stats),
        ] {
            if window.as_secs() == 0 {
                return Err(RetentionError {
                    table,
                    reason: "window must be at least one second",
                });
            }
            if window.as_secs() > MAX_RETENTION_SECS {
                return Err(RetentionError {
                    table,
                    reason: "window longer than ten years",
                });
            }
        }
        Ok(())
    }

    fn cutoff(now: i64, window: Duration) -> i64 {
        now.saturating_sub(window.as_secs() as i64)
    }
}

/// Rows deleted by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub packets: usize,
    pub neighbor_edges: usize,
    pub node_stats: usize,
    pub topology_reporters: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.packets + self.neighbor_edges + self.node_stats + self.topology_reporters
    }
}

/// Delete rows older than each table's window
///
/// Runs in a single transaction so a sweep is all-or-nothing. Calling it
/// twice with the same `now` deletes nothing the second time.
pub fn prune(
    conn: &mut Connection,
    now: i64,
    policy: &RetentionPolicy,
) -> rusqlite::Result<PruneReport> {
    let tx = conn.transaction()?;
    let edge_cutoff = RetentionPolicy::cutoff(now, policy.neighbor_edges);
    let report = PruneReport {
        packets: prune_packets(&tx, RetentionPolicy::cutoff(now, policy.packets))?,
        neighbor_edges: prune_edges(&tx, edge_cutoff)?,
        node_stats: prune_node_stats(&tx, RetentionPolicy::cutoff(now, policy.node_stats))?,
        topology_reporters: prune_topology_reporters(&tx, edge_cutoff)?,
    };
    tx.commit()?;
    Ok(report)
}

/// Reclaim free pages left behind by deletes
pub fn compact(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA incremental_vacuum;")
}

/// Decides when a sweep should be followed by compaction
///
/// Compaction runs every `every_sweeps` sweeps, or as soon as the rows
/// deleted since the last compaction exceed `row_threshold`.
#[derive(Debug, Clone)]
pub struct CompactionSchedule {
    every_sweeps: u32,
    row_threshold: usize,
    sweeps_since: u32,
    rows_since: usize,
}

impl CompactionSchedule {
    pub fn new(every_sweeps: u32, row_threshold: usize) -> Self {
        Self {
            every_sweeps: every_sweeps.max(1),
            row_threshold,
            sweeps_since: 0,
            rows_since: 0,
        }
    }

    /// Account for a finished sweep; true when compaction is due
    pub fn record_sweep(&mut self, report: &PruneReport) -> bool {
        self.sweeps_since = self.sweeps_since.saturating_add(1);
        self.rows_since = self.rows_since.saturating_add(report.total());
        if self.rows_since == 0 {
            return false;
        }
        self.sweeps_since >= self.every_sweeps || self.rows_since > self.row_threshold
    }

    /// Reset counters after compaction ran
    pub fn compacted(&mut self) {
        self.sweeps_since = 0;
        self.rows_since = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::neighbors::upsert_neighbor_edge;
    use crate::data::node_stats::update_node_stat;
    use crate::data::packets::{count_packets, record_packet};
    use crate::data::start_memory_db;
    use crate::mesh::{NodeId, PacketKind, PacketRecord, Provenance};

    const HOUR: i64 = 3600;

    fn node(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn packet(ts: i64) -> PacketRecord {
        PacketRecord {
            timestamp: ts,
            from: node(1),
            to: NodeId::BROADCAST,
            kind: PacketKind::TextMessage,
            snr: None,
            rssi: None,
            hops_away: None,
            channel: None,
            size_bytes: 10,
            payload: None,
            source: Provenance::DirectRadio,
        }
    }

    #[test]
    fn test_default_windows() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.packets, Duration::from_secs(48 * 3600));
        assert!(policy.neighbor_edges > policy.packets);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_and_huge() {
        let mut policy = RetentionPolicy::default();
        policy.neighbor_edges = Duration::ZERO;
        assert_eq!(policy.validate().unwrap_err().table, "neighbor_edges");

        let mut policy = RetentionPolicy::default();
        policy.packets = Duration::from_secs(MAX_RETENTION_SECS + 1);
        assert_eq!(policy.validate().unwrap_err().table, "packets");
    }

    #[test]
    fn test_packet_retention_window() {
        let mut conn = start_memory_db().unwrap();
        let now = 1_000 * HOUR;
        record_packet(&conn, &packet(now - 50 * HOUR)).unwrap();
        record_packet(&conn, &packet(now - 2 * HOUR)).unwrap();

        let report = prune(&mut conn, now, &RetentionPolicy::default()).unwrap();
        assert_eq!(report.packets, 1);
        assert_eq!(count_packets(&conn).unwrap(), 1);
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut conn = start_memory_db().unwrap();
        let now = 1_000 * HOUR;
        record_packet(&conn, &packet(now - 50 * HOUR)).unwrap();
        upsert_neighbor_edge(
            &conn,
            node(1),
            node(2),
            None,
            now - 40 * 24 * HOUR,
            None,
            Provenance::DirectRadio,
        )
        .unwrap();
        update_node_stat(&conn, node(1), PacketKind::Other, 1, now - 40 * 24 * HOUR).unwrap();

        let policy = RetentionPolicy::default();
        let first = prune(&mut conn, now, &policy).unwrap();
        assert_eq!(first.packets, 1);
        assert_eq!(first.neighbor_edges, 1);
        assert_eq!(first.node_stats, 2);

        let second = prune(&mut conn, now, &policy).unwrap();
        assert_eq!(second, PruneReport::default());
    }

    #[test]
    fn test_windows_are_independent() {
        let mut conn = start_memory_db().unwrap();
        let now = 1_000 * HOUR;
        // Older than the packet window, younger than the edge window
        let ts = now - 72 * HOUR;
        record_packet(&conn, &packet(ts)).unwrap();
        upsert_neighbor_edge(&conn, node(1), node(2), None, ts, None, Provenance::DirectRadio)
            .unwrap();

        let report = prune(&mut conn, now, &RetentionPolicy::default()).unwrap();
        assert_eq!(report.packets, 1);
        assert_eq!(report.neighbor_edges, 0);
    }

    #[test]
    fn test_compact_runs_on_memory_db() {
        let conn = start_memory_db().unwrap();
        compact(&conn).unwrap();
    }

    #[test]
    fn test_compaction_schedule_amortizes() {
        let mut schedule = CompactionSchedule::new(3, 1000);
        let small = PruneReport { packets: 5, ..PruneReport::default() };

        assert!(!schedule.record_sweep(&small));
        assert!(!schedule.record_sweep(&small));
        assert!(schedule.record_sweep(&small));
        schedule.compacted();

        // Big sweep triggers immediately
        let big = PruneReport { packets: 5000, ..PruneReport::default() };
        assert!(schedule.record_sweep(&big));
        schedule.compacted();

        // Nothing deleted, nothing to reclaim
        let empty = PruneReport::default();
        for _ in 0..5 {
            assert!(!schedule.record_sweep(&empty));
        }
    }
}
