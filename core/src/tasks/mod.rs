//! Background tasks for the Bridge
//!
//! This module contains the long-running background tasks:
//! - Link supervisor (connect, stabilize, pump, detect silence, reconnect)
//! - Ingest worker (performs every store write, off the receive path)
//! - Cleanup loop (per-table retention sweep with amortized compaction)

mod ingest;
mod maintenance;

pub use ingest::{
    run_ingest_worker, IngestCounters, IngestQueue, IngestStats, IngestWorker,
    DEFAULT_INGEST_QUEUE_CAPACITY,
};

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::bridge::Bridge;
use crate::link::{JsonLinesDecoder, LinkStatus, LinkSupervisor, LinkTransport};
use crate::mesh::DecodedPacket;

impl Bridge {
    /// Start background tasks (ingest worker, cleanup loop, link supervisor)
    pub(crate) async fn start_background_tasks<T>(
        &self,
        transport: Option<T>,
        ingest_rx: mpsc::Receiver<DecodedPacket>,
        status_tx: watch::Sender<LinkStatus>,
    ) where
        T: LinkTransport + 'static,
    {
        let mut tasks = self.tasks.write().await;

        // 1. Ingest worker (sole writer of packets, stats, edges)
        let worker = IngestWorker::new(
            self.store.clone(),
            self.directory.clone(),
            self.counters.clone(),
        );
        let shutdown = self.shutdown_tx.subscribe();
        let ingest_task = tokio::spawn(async move {
            run_ingest_worker(worker, ingest_rx, shutdown).await;
        });
        tasks.push(ingest_task);

        // 2. Cleanup task (per-table retention)
        let store = self.store.clone();
        let policy = self.config.retention();
        let running = self.running.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval_secs);

        let cleanup_task = tokio::spawn(async move {
            Self::run_cleanup_loop(store, policy, running, shutdown, cleanup_interval).await;
        });
        tasks.push(cleanup_task);

        // 3. Link supervisor (only with a radio configured)
        match transport {
            Some(transport) => {
                let supervisor = LinkSupervisor::new(
                    transport,
                    JsonLinesDecoder::new(),
                    self.config.supervisor(),
                    self.ingest.clone(),
                    status_tx,
                );
                let shutdown = self.shutdown_tx.subscribe();
                let link_task = tokio::spawn(async move {
                    supervisor.run(shutdown).await;
                });
                tasks.push(link_task);
            }
            None => {
                info!("No radio configured: accepting relay packets only");
            }
        }

        info!("Background tasks started");
    }
}
