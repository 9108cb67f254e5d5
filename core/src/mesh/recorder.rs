//! Neighbor Recorder
//!
//! Turns neighbor reports from either producer (our own radio, or a remote
//! relay/bridge) into edge upserts keyed by canonical node ids.
//!
//! # Recording Flow
//!
//! 1. Normalize the observer id; an unusable observer drops the report
//! 2. Normalize each neighbor id; unusable, broadcast and self entries
//!    are dropped one by one
//! 3. Upsert every surviving edge with the producer's provenance
//! 4. Mark the observer as topology-reporting-capable
//!
//! Steps 3 and 4 share one transaction.

use tracing::{debug, trace};

use crate::data::{mark_topology_reporter, upsert_neighbor_edge, EdgeUpsert, Store, StoreError};

use super::node_id::{NodeId, NodeIdError};
use super::packet::{Provenance, RawNeighborReport};

/// How far into the future an entry's last-rx time may be before we fall
/// back to the receive time (remote clocks drift or are unset)
pub const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Error recording a neighbor report
#[derive(Debug)]
pub enum RecordError {
    /// Observer id could not be normalized
    InvalidObserver(NodeIdError),
    /// Storage failed; the report was not persisted
    Storage(StoreError),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::InvalidObserver(e) => write!(f, "invalid observer: {}", e),
            RecordError::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl std::error::Error for RecordError {}

impl From<StoreError> for RecordError {
    fn from(e: StoreError) -> Self {
        RecordError::Storage(e)
    }
}

/// What happened to one report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub observer: NodeId,
    /// Edges inserted or advanced
    pub applied: usize,
    /// Entries older than what is stored
    pub stale: usize,
    /// Entries rejected before reaching storage
    pub dropped: usize,
}

/// A normalized entry, ready for storage
#[derive(Debug, Clone, PartialEq)]
struct EdgeObservation {
    neighbor: NodeId,
    snr: Option<f64>,
    timestamp: i64,
    broadcast_interval: Option<u32>,
}

/// Records neighbor reports into the store
#[derive(Clone)]
pub struct NeighborRecorder {
    store: Store,
}

impl NeighborRecorder {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Normalize and persist one neighbor report
    pub async fn record_report(
        &self,
        report: &RawNeighborReport,
        received_at: i64,
        source: Provenance,
    ) -> Result<RecordOutcome, RecordError> {
        let (observer, observations, dropped) = normalize_report(report, received_at)?;

        let (applied, stale) = self
            .store
            .write("record_neighbor_report", |conn| {
                let tx = conn.transaction()?;
                let mut applied = 0;
                let mut stale = 0;
                for obs in &observations {
                    match upsert_neighbor_edge(
                        &tx,
                        observer,
                        obs.neighbor,
                        obs.snr,
                        obs.timestamp,
                        obs.broadcast_interval,
                        source,
                    )? {
                        EdgeUpsert::Applied => applied += 1,
                        EdgeUpsert::Stale => stale += 1,
                    }
                }
                mark_topology_reporter(&tx, observer, received_at, source)?;
                tx.commit()?;
                Ok((applied, stale))
            })
            .await?;

        debug!(
            observer = %observer,
            source = %source,
            applied = applied,
            stale = stale,
            dropped = dropped,
            "Recorded neighbor report"
        );

        Ok(RecordOutcome {
            observer,
            applied,
            stale,
            dropped,
        })
    }
}

/// Normalize ids and pick timestamps; returns (observer, kept, dropped)
fn normalize_report(
    report: &RawNeighborReport,
    received_at: i64,
) -> Result<(NodeId, Vec<EdgeObservation>, usize), RecordError> {
    let observer = NodeId::parse(&report.observer).map_err(RecordError::InvalidObserver)?;

    let mut kept = Vec::with_capacity(report.neighbors.len());
    let mut dropped = 0;
    let report_interval = report.broadcast_interval_secs.filter(|i| *i > 0);

    for entry in &report.neighbors {
        let neighbor = match NodeId::parse(&entry.node_id) {
            Ok(id) => id,
            Err(e) => {
                debug!(
                    observer = %observer,
                    raw = %entry.node_id,
                    error = %e,
                    "Dropping neighbor entry with unparseable id"
                );
                dropped += 1;
                continue;
            }
        };

        if neighbor.is_broadcast() || neighbor == observer {
            trace!(observer = %observer, neighbor = %neighbor, "Dropping non-edge neighbor entry");
            dropped += 1;
            continue;
        }

        kept.push(EdgeObservation {
            neighbor,
            snr: entry.snr.filter(|s| s.is_finite()),
            timestamp: observation_time(entry.last_rx_time, received_at),
            broadcast_interval: entry
                .broadcast_interval_secs
                .filter(|i| *i > 0)
                .or(report_interval),
        });
    }

    Ok((observer, kept, dropped))
}

/// Entry last-rx time when plausible, otherwise the receive time
fn observation_time(last_rx_time: Option<i64>, received_at: i64) -> i64 {
    match last_rx_time {
        Some(t) if t > 0 && t <= received_at + MAX_CLOCK_SKEW_SECS => t,
        _ => received_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::packet::RawNeighborEntry;

    fn entry(id: &str, snr: f64, last_rx: Option<i64>) -> RawNeighborEntry {
        RawNeighborEntry {
            node_id: id.to_string(),
            snr: Some(snr),
            last_rx_time: last_rx,
            broadcast_interval_secs: Some(900),
        }
    }

    fn report(observer: &str, neighbors: Vec<RawNeighborEntry>) -> RawNeighborReport {
        RawNeighborReport {
            observer: observer.to_string(),
            broadcast_interval_secs: Some(900),
            neighbors,
        }
    }

    #[test]
    fn test_observation_time() {
        assert_eq!(observation_time(Some(900), 1000), 900);
        assert_eq!(observation_time(None, 1000), 1000);
        assert_eq!(observation_time(Some(0), 1000), 1000);
        assert_eq!(observation_time(Some(1000 + MAX_CLOCK_SKEW_SECS), 1000), 1300);
        assert_eq!(observation_time(Some(1000 + MAX_CLOCK_SKEW_SECS + 1), 1000), 1000);
    }

    #[test]
    fn test_normalize_drops_bad_entries() {
        let raw = report(
            "!16fa4fdc",
            vec![
                entry("0x0000000a", 4.0, None),
                entry("garbage", 1.0, None),
                entry("!ffffffff", 1.0, None),
                entry("385503196", 1.0, None),
            ],
        );
        let (observer, kept, dropped) = normalize_report(&raw, 500).unwrap();
        assert_eq!(observer.key(), "!16fa4fdc");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].neighbor.key(), "!0000000a");
        assert_eq!(dropped, 3, "garbage, broadcast and self");
    }

    #[test]
    fn test_entry_interval_falls_back_to_report() {
        let mut bare = entry("!0000000a", 4.0, None);
        bare.broadcast_interval_secs = None;
        let mut raw = report("!16fa4fdc", vec![bare, entry("!0000000b", 2.0, None)]);
        raw.broadcast_interval_secs = Some(300);

        let (_, kept, _) = normalize_report(&raw, 500).unwrap();
        assert_eq!(kept[0].broadcast_interval, Some(300));
        assert_eq!(kept[1].broadcast_interval, Some(900));

        raw.broadcast_interval_secs = None;
        raw.neighbors[1].broadcast_interval_secs = None;
        let (_, kept, _) = normalize_report(&raw, 500).unwrap();
        assert_eq!(kept[1].broadcast_interval, None);
    }

    #[test]
    fn test_normalize_rejects_bad_observer() {
        let raw = report("", vec![entry("!0000000a", 4.0, None)]);
        assert!(matches!(
            normalize_report(&raw, 500),
            Err(RecordError::InvalidObserver(NodeIdError::Empty))
        ));
    }

    #[tokio::test]
    async fn test_record_under_one_encoding_query_under_another() {
        let store = Store::open_memory().unwrap();
        let recorder = NeighborRecorder::new(store.clone());

        let raw = report("385503196", vec![entry("10", 6.5, Some(100))]);
        let outcome = recorder
            .record_report(&raw, 120, Provenance::DirectRadio)
            .await
            .unwrap();
        assert_eq!(outcome.applied, 1);

        let observer = NodeId::parse("!16fa4fdc").unwrap();
        let edges = store.query_neighbors(observer, 0).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].neighbor, NodeId::parse("0xa").unwrap());
        assert_eq!(edges[0].snr, Some(6.5));
        assert_eq!(edges[0].last_seen, 100);
        assert_eq!(edges[0].broadcast_interval, Some(900));
    }

    #[tokio::test]
    async fn test_every_encoding_lands_on_one_row() {
        let store = Store::open_memory().unwrap();
        let recorder = NeighborRecorder::new(store.clone());

        let encodings = ["385503196", "!16fa4fdc", "0x16FA4FDC", "16fa4fdc", " !16FA4FDC "];
        for (i, enc) in encodings.iter().enumerate() {
            let raw = report(enc, vec![entry(enc_neighbor(i), 1.0, None)]);
            recorder
                .record_report(&raw, 100 + i as i64, Provenance::RelayBridge)
                .await
                .unwrap();
        }

        let counts = store.table_counts().await.unwrap();
        assert_eq!(counts.neighbor_edges, 1);
        assert_eq!(counts.topology_reporters, 1);

        let edge = &store.query_all_edges(0).await.unwrap()[0];
        assert_eq!(edge.last_seen, 104);
    }

    // Same neighbor (0x2a = 42) spelled five different ways
    fn enc_neighbor(i: usize) -> &'static str {
        ["42", "!2a", "0x2A", "2a", "!0000002a"][i]
    }

    #[tokio::test]
    async fn test_out_of_order_reports() {
        let store = Store::open_memory().unwrap();
        let recorder = NeighborRecorder::new(store.clone());

        recorder
            .record_report(&report("!a", vec![entry("!b", 5.0, Some(100))]), 110, Provenance::DirectRadio)
            .await
            .unwrap();
        let late = recorder
            .record_report(&report("!a", vec![entry("!b", 8.0, Some(90))]), 130, Provenance::DirectRadio)
            .await
            .unwrap();
        assert_eq!(late.stale, 1);
        assert_eq!(late.applied, 0);

        let edges = store
            .query_neighbors(NodeId::parse("!a").unwrap(), 0)
            .await
            .unwrap();
        assert_eq!(edges[0].snr, Some(5.0));
        assert_eq!(edges[0].last_seen, 100);
    }

    #[tokio::test]
    async fn test_empty_report_still_marks_reporter() {
        let store = Store::open_memory().unwrap();
        let recorder = NeighborRecorder::new(store.clone());

        let outcome = recorder
            .record_report(&report("!0000beef", vec![]), 100, Provenance::DirectRadio)
            .await
            .unwrap();
        assert_eq!(outcome.applied, 0);

        let reporters = store.query_topology_reporters(0).await.unwrap();
        assert_eq!(reporters.len(), 1);
        assert_eq!(reporters[0].node.key(), "!0000beef");
    }
}
