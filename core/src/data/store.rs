//! Store handle shared by the ingest worker, the retention sweep and the
//! query service
//!
//! All writes go through one connection behind an async mutex, so a sweep
//! can never interleave with an upsert. A file-backed store also opens a
//! read-only connection so topology queries do not queue behind ingestion.
//!
//! Write failures never propagate to the link: they flip the store into a
//! degraded state that is logged once on entry and once on recovery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::mesh::{NodeId, PacketKind, PacketRecord, Provenance};

use super::neighbors::{
    self, EdgeUpsert, NeighborEdge, TopologyReporter,
};
use super::node_stats::{self, NodeStat};
use super::packets::{self, HopObservation, PacketFilter};
use super::retention::{self, CompactionSchedule, PruneReport, RetentionPolicy};
use super::start::{open_reader, start_db, start_memory_db, StartError};

/// Error from a store operation
#[derive(Debug)]
pub enum StoreError {
    /// SQLite error
    Database(rusqlite::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e)
    }
}

/// Write-path health counters
#[derive(Debug, Default)]
pub struct StorageHealth {
    degraded: AtomicBool,
    write_failures: AtomicU64,
    recoveries: AtomicU64,
}

/// Point-in-time copy of [`StorageHealth`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StorageHealthSnapshot {
    pub degraded: bool,
    pub write_failures: u64,
    pub recoveries: u64,
}

impl StorageHealth {
    fn record_failure(&self, op: &str, error: &rusqlite::Error) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                op = op,
                error = %error,
                "Storage degraded: continuing without persistence until writes succeed"
            );
        } else {
            debug!(op = op, error = %error, "Storage write failed while degraded");
        }
    }

    fn record_success(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            self.recoveries.fetch_add(1, Ordering::Relaxed);
            info!(
                failures = self.write_failures.load(Ordering::Relaxed),
                "Storage recovered: persistence resumed"
            );
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StorageHealthSnapshot {
        StorageHealthSnapshot {
            degraded: self.is_degraded(),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle to the persistent store
#[derive(Clone)]
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    reader: Option<Arc<Mutex<Connection>>>,
    health: Arc<StorageHealth>,
    compaction: Arc<Mutex<CompactionSchedule>>,
}

impl Store {
    /// Default number of sweeps between compactions
    pub const DEFAULT_COMPACT_EVERY_SWEEPS: u32 = 24;
    /// Default deleted-row count that forces compaction early
    pub const DEFAULT_COMPACT_ROW_THRESHOLD: usize = 50_000;

    /// Open (or create) a database file with a separate read path
    pub fn open(db_path: &str) -> Result<Self, StartError> {
        let writer = start_db(db_path)?;
        let reader = open_reader(db_path)?;
        Ok(Self::with_connections(writer, Some(reader)))
    }

    /// In-memory store (reads share the writer connection)
    pub fn open_memory() -> Result<Self, StartError> {
        let conn = start_memory_db()?;
        Ok(Self::with_connections(conn, None))
    }

    /// Wrap an already initialized connection
    pub fn from_connection(conn: Connection) -> Self {
        Self::with_connections(conn, None)
    }

    fn with_connections(writer: Connection, reader: Option<Connection>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: reader.map(|r| Arc::new(Mutex::new(r))),
            health: Arc::new(StorageHealth::default()),
            compaction: Arc::new(Mutex::new(CompactionSchedule::new(
                Self::DEFAULT_COMPACT_EVERY_SWEEPS,
                Self::DEFAULT_COMPACT_ROW_THRESHOLD,
            ))),
        }
    }

    /// Override the compaction cadence
    pub fn with_compaction(self, every_sweeps: u32, row_threshold: usize) -> Self {
        Self {
            compaction: Arc::new(Mutex::new(CompactionSchedule::new(every_sweeps, row_threshold))),
            ..self
        }
    }

    pub fn health(&self) -> &StorageHealth {
        &self.health
    }

    /// Run a write under the writer lock, tracking degraded state
    pub async fn write<T>(
        &self,
        op: &str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.writer.lock().await;
        match f(&mut conn) {
            Ok(value) => {
                self.health.record_success();
                Ok(value)
            }
            Err(e) => {
                self.health.record_failure(op, &e);
                Err(StoreError::Database(e))
            }
        }
    }

    /// Run a read on the read path (writer connection for in-memory stores)
    pub async fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let handle = self.reader.as_ref().unwrap_or(&self.writer);
        let conn = handle.lock().await;
        Ok(f(&conn)?)
    }

    /// Append a packet; failures are logged and swallowed
    pub async fn record_packet(&self, record: &PacketRecord) -> Option<i64> {
        self.write("record_packet", |conn| packets::record_packet(conn, record))
            .await
            .ok()
    }

    pub async fn upsert_neighbor_edge(
        &self,
        observer: NodeId,
        neighbor: NodeId,
        snr: Option<f64>,
        timestamp: i64,
        broadcast_interval: Option<u32>,
        source: Provenance,
    ) -> Result<EdgeUpsert, StoreError> {
        self.write("upsert_neighbor_edge", |conn| {
            neighbors::upsert_neighbor_edge(
                conn,
                observer,
                neighbor,
                snr,
                timestamp,
                broadcast_interval,
                source,
            )
        })
        .await
    }

    pub async fn update_node_stat(
        &self,
        node: NodeId,
        kind: PacketKind,
        byte_count: u32,
        at: i64,
    ) -> Result<(), StoreError> {
        self.write("update_node_stat", |conn| {
            node_stats::update_node_stat(conn, node, kind, byte_count, at)
        })
        .await
    }

    /// Sweep every table, compacting when the schedule says so
    pub async fn prune(
        &self,
        now: i64,
        policy: &RetentionPolicy,
    ) -> Result<PruneReport, StoreError> {
        let report = self
            .write("prune", |conn| retention::prune(conn, now, policy))
            .await?;

        let mut schedule = self.compaction.lock().await;
        if schedule.record_sweep(&report) {
            match self.write("compact", |conn| retention::compact(conn)).await {
                Ok(()) => {
                    debug!("Retention: storage compacted");
                    schedule.compacted();
                }
                Err(e) => warn!(error = %e, "Retention: compaction failed"),
            }
        }
        Ok(report)
    }

    pub async fn query_neighbors(
        &self,
        observer: NodeId,
        since: i64,
    ) -> Result<Vec<NeighborEdge>, StoreError> {
        self.read(|conn| neighbors::query_neighbors(conn, observer, since))
            .await
    }

    pub async fn query_all_edges(&self, since: i64) -> Result<Vec<NeighborEdge>, StoreError> {
        self.read(|conn| neighbors::query_all_edges(conn, since)).await
    }

    pub async fn query_packets(
        &self,
        filter: &PacketFilter,
        since: i64,
    ) -> Result<Vec<PacketRecord>, StoreError> {
        self.read(|conn| packets::query_packets(conn, filter, since))
            .await
    }

    pub async fn query_hop_counts(&self, since: i64) -> Result<Vec<HopObservation>, StoreError> {
        self.read(|conn| packets::query_hop_counts(conn, since)).await
    }

    pub async fn query_node_stat(&self, node: NodeId) -> Result<Option<NodeStat>, StoreError> {
        self.read(|conn| node_stats::query_node_stat(conn, node))
            .await
    }

    pub async fn query_topology_reporters(
        &self,
        since: i64,
    ) -> Result<Vec<TopologyReporter>, StoreError> {
        self.read(|conn| neighbors::query_topology_reporters(conn, since))
            .await
    }

    /// Row counts for status output
    pub async fn table_counts(&self) -> Result<TableCounts, StoreError> {
        self.read(|conn| {
            let count = |table: &str| -> rusqlite::Result<u64> {
                let n: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
                Ok(n as u64)
            };
            Ok(TableCounts {
                packets: count("packets")?,
                neighbor_edges: count("neighbor_edges")?,
                node_stats: count("node_stats")?,
                topology_reporters: count("topology_reporters")?,
            })
        })
        .await
    }
}

/// Number of rows per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TableCounts {
    pub packets: u64,
    pub neighbor_edges: u64,
    pub node_stats: u64,
    pub topology_reporters: u64,
}
