//! Ingest queue and worker
//!
//! The link receive loop hands decoded packets to a bounded queue and
//! never waits on storage. One worker drains the queue and performs every
//! store write: packet log, node stats, neighbor edges and the identity
//! directory. A full queue drops the packet and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::data::Store;
use crate::mesh::{
    DecodedPacket, MemoryDirectory, NeighborRecorder, PacketPayload, RecordError,
};

/// Default queue depth between the link and the worker
pub const DEFAULT_INGEST_QUEUE_CAPACITY: usize = 1024;

/// Completion and error counters for ingestion
#[derive(Debug, Default)]
pub struct IngestCounters {
    queued: AtomicU64,
    dropped_full: AtomicU64,
    decode_errors: AtomicU64,
    processed: AtomicU64,
    stored: AtomicU64,
    rejected: AtomicU64,
    storage_errors: AtomicU64,
    neighbor_reports: AtomicU64,
    edges_applied: AtomicU64,
    edges_stale: AtomicU64,
}

/// Point-in-time copy of [`IngestCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Accepted onto the queue
    pub queued: u64,
    /// Dropped because the queue was full
    pub dropped_full: u64,
    /// Link bytes that did not decode into a packet
    pub decode_errors: u64,
    /// Taken off the queue by the worker
    pub processed: u64,
    /// Written to the packet log
    pub stored: u64,
    /// Unusable node id; nothing stored
    pub rejected: u64,
    pub storage_errors: u64,
    pub neighbor_reports: u64,
    pub edges_applied: u64,
    pub edges_stale: u64,
}

impl IngestCounters {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_decode_error(&self) {
        Self::bump(&self.decode_errors);
    }

    pub fn snapshot(&self) -> IngestStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IngestStats {
            queued: load(&self.queued),
            dropped_full: load(&self.dropped_full),
            decode_errors: load(&self.decode_errors),
            processed: load(&self.processed),
            stored: load(&self.stored),
            rejected: load(&self.rejected),
            storage_errors: load(&self.storage_errors),
            neighbor_reports: load(&self.neighbor_reports),
            edges_applied: load(&self.edges_applied),
            edges_stale: load(&self.edges_stale),
        }
    }
}

/// Sending side of the ingest queue
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<DecodedPacket>,
    counters: Arc<IngestCounters>,
}

impl IngestQueue {
    /// Create a queue and the receiver the worker drains
    pub fn channel(
        capacity: usize,
        counters: Arc<IngestCounters>,
    ) -> (Self, mpsc::Receiver<DecodedPacket>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, counters }, rx)
    }

    /// Enqueue without waiting; false if the packet was dropped
    pub fn submit(&self, packet: DecodedPacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => {
                IngestCounters::bump(&self.counters.queued);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = IngestCounters::bump(&self.counters.dropped_full);
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(dropped = dropped, "Ingest queue full: dropping packets");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Ingest queue closed: dropping packet");
                false
            }
        }
    }

    pub fn counters(&self) -> &Arc<IngestCounters> {
        &self.counters
    }
}

/// Performs the store writes for one packet at a time
#[derive(Clone)]
pub struct IngestWorker {
    store: Store,
    recorder: NeighborRecorder,
    directory: Arc<MemoryDirectory>,
    counters: Arc<IngestCounters>,
}

impl IngestWorker {
    pub fn new(store: Store, directory: Arc<MemoryDirectory>, counters: Arc<IngestCounters>) -> Self {
        Self {
            recorder: NeighborRecorder::new(store.clone()),
            store,
            directory,
            counters,
        }
    }

    /// Persist one packet; failures are counted, never returned
    pub async fn process(&self, packet: DecodedPacket) {
        IngestCounters::bump(&self.counters.processed);

        let record = match packet.to_record() {
            Ok(record) => record,
            Err(e) => {
                IngestCounters::bump(&self.counters.rejected);
                warn!(
                    from = %packet.from,
                    to = ?packet.to,
                    error = %e,
                    "Dropping packet with unusable node id"
                );
                return;
            }
        };

        match self.store.record_packet(&record).await {
            Some(_) => {
                IngestCounters::bump(&self.counters.stored);
            }
            None => {
                IngestCounters::bump(&self.counters.storage_errors);
            }
        }

        if let Err(e) = self
            .store
            .update_node_stat(record.from, record.kind, record.size_bytes, record.timestamp)
            .await
        {
            IngestCounters::bump(&self.counters.storage_errors);
            debug!(node = %record.from, error = %e, "Node stat update failed");
        }

        match &record.payload {
            Some(PacketPayload::Position(position)) => {
                self.directory.set_position(record.from, *position);
            }
            Some(PacketPayload::NodeInfo { long_name, short_name }) => {
                self.directory
                    .set_name(record.from, long_name.as_deref(), short_name.as_deref());
            }
            _ => {}
        }

        if let Some(report) = &packet.neighbor_report {
            IngestCounters::bump(&self.counters.neighbor_reports);
            match self
                .recorder
                .record_report(report, packet.received_at, packet.provenance)
                .await
            {
                Ok(outcome) => {
                    self.counters
                        .edges_applied
                        .fetch_add(outcome.applied as u64, Ordering::Relaxed);
                    self.counters
                        .edges_stale
                        .fetch_add(outcome.stale as u64, Ordering::Relaxed);
                }
                Err(RecordError::InvalidObserver(e)) => {
                    IngestCounters::bump(&self.counters.rejected);
                    debug!(observer = %report.observer, error = %e, "Dropping neighbor report");
                }
                Err(RecordError::Storage(e)) => {
                    IngestCounters::bump(&self.counters.storage_errors);
                    debug!(error = %e, "Neighbor report not persisted");
                }
            }
        }
    }
}

/// Drain the queue until shutdown, then flush what is left
pub async fn run_ingest_worker(
    worker: IngestWorker,
    mut rx: mpsc::Receiver<DecodedPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Ingest worker started");

    loop {
        tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => worker.process(packet).await,
                None => break,
            },
            _ = shutdown.changed() => {
                rx.close();
                let mut flushed = 0;
                while let Some(packet) = rx.recv().await {
                    worker.process(packet).await;
                    flushed += 1;
                }
                if flushed > 0 {
                    info!(flushed = flushed, "Ingest worker: flushed queued packets");
                }
                break;
            }
        }
    }

    let stats = worker.counters.snapshot();
    info!(
        processed = stats.processed,
        stored = stats.stored,
        dropped_full = stats.dropped_full,
        storage_errors = stats.storage_errors,
        "Ingest worker stopped"
    );
}
