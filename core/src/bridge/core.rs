//! Main Bridge implementation
//!
//! The Bridge owns the store, the ingest queue and the background tasks.
//! Implementation is split across:
//! - `bridge/` (this module): core struct, start/stop, public methods
//! - `tasks/`: background automation (link, ingest, cleanup)
//! - `link/`: the radio connection itself

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::data::Store;
use crate::link::{decode_object, AnyTransport, LinkStatus, LinkTransport};
use crate::mesh::{DecodedPacket, MemoryDirectory, NodeId, Provenance};
use crate::tasks::{IngestCounters, IngestQueue, IngestStats};

use super::config::BridgeConfig;
use super::error::BridgeError;
use super::query::QueryService;

/// How long `stop` waits for tasks to flush before aborting them
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// The mesh bridge
///
/// This is the main entry point: start it with a config, feed relay
/// packets into it, query it, stop it.
pub struct Bridge {
    /// Configuration
    pub(crate) config: BridgeConfig,
    /// Persistent store
    pub(crate) store: Store,
    /// Names and positions learned from ingested packets
    pub(crate) directory: Arc<MemoryDirectory>,
    /// Sending side of the ingest queue
    pub(crate) ingest: IngestQueue,
    /// Ingest counters
    pub(crate) counters: Arc<IngestCounters>,
    /// Latest link status
    status_rx: watch::Receiver<LinkStatus>,
    /// Our own radio
    local_node: Option<NodeId>,
    /// Running flag
    pub(crate) running: Arc<RwLock<bool>>,
    /// Background tasks
    pub(crate) tasks: Arc<RwLock<Vec<tokio::task::JoinHandle<()>>>>,
    /// Shutdown signal
    pub(crate) shutdown_tx: watch::Sender<bool>,
}

impl Bridge {
    /// Start the bridge with the configured transport (if any)
    ///
    /// Configuration and the database are checked before the link is
    /// opened; either failing returns an error and starts nothing.
    pub async fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let transport: Option<AnyTransport> = config
            .transport
            .as_ref()
            .map(|t| t.build(connect_timeout));
        Self::start_with_transport(config, transport).await
    }

    /// Start the bridge over a caller-supplied transport
    pub async fn start_with_transport<T>(
        config: BridgeConfig,
        transport: Option<T>,
    ) -> Result<Self, BridgeError>
    where
        T: LinkTransport + 'static,
    {
        info!("Starting bridge...");
        config.validate()?;
        let local_node = config.local_node_id()?;

        let store = match &config.db_path {
            Some(path) => Store::open(&path.to_string_lossy())?,
            None => Store::open_memory()?,
        }
        .with_compaction(config.compact_every_sweeps, config.compact_row_threshold);
        info!(
            db_path = ?config.db_path,
            local_node = ?local_node.map(|n| n.to_string()),
            "Store opened"
        );

        let counters = Arc::new(IngestCounters::default());
        let (ingest, ingest_rx) = IngestQueue::channel(config.ingest_queue_capacity, counters.clone());
        let (status_tx, status_rx) = watch::channel(LinkStatus::default());
        let (shutdown_tx, _) = watch::channel(false);

        let bridge = Self {
            config,
            store,
            directory: Arc::new(MemoryDirectory::new()),
            ingest,
            counters,
            status_rx,
            local_node,
            running: Arc::new(RwLock::new(true)),
            tasks: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
        };

        bridge
            .start_background_tasks(transport, ingest_rx, status_tx)
            .await;

        info!("Bridge started");
        Ok(bridge)
    }

    /// Stop the bridge
    ///
    /// Signals every task, waits briefly so queued packets are flushed,
    /// then aborts whatever is left.
    pub async fn stop(&self) {
        info!("Stopping bridge...");

        // Signal shutdown
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        self.shutdown_tx.send_replace(true);

        // Wait for background tasks, abort stragglers
        {
            let mut tasks = self.tasks.write().await;
            for mut task in tasks.drain(..) {
                if tokio::time::timeout(STOP_GRACE_PERIOD, &mut task).await.is_err() {
                    warn!("Background task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        info!("Bridge stopped");
    }

    /// Check if the bridge is running
    pub(crate) async fn check_running(&self) -> Result<(), BridgeError> {
        let running = self.running.read().await;
        if !*running {
            return Err(BridgeError::NotRunning);
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Entry point for the relay/bridge producer
    ///
    /// The packet is tagged as relay-collected and queued like any radio
    /// packet. Returns false when the queue was full and it was dropped.
    pub async fn ingest_relay_packet(&self, mut packet: DecodedPacket) -> Result<bool, BridgeError> {
        self.check_running().await?;
        packet.provenance = Provenance::RelayBridge;
        Ok(self.ingest.submit(packet))
    }

    /// Decode one relay JSON object and queue it
    pub async fn ingest_relay_json(&self, line: &str) -> Result<bool, BridgeError> {
        let value: serde_json::Value = serde_json::from_str(line.trim())
            .map_err(|e| BridgeError::InvalidInput(format!("relay packet: {}", e)))?;
        let obj = value
            .as_object()
            .ok_or_else(|| BridgeError::InvalidInput("relay packet is not an object".to_string()))?;
        let packet = decode_object(obj, line.len() as u32, crate::data::current_timestamp())
            .map_err(|e| BridgeError::InvalidInput(format!("relay packet: {}", e)))?;
        self.ingest_relay_packet(packet).await
    }

    /// Read-only query interface
    pub fn query(&self) -> QueryService {
        QueryService::new(
            self.store.clone(),
            self.directory.clone(),
            self.status_rx.clone(),
            self.counters.clone(),
        )
        .with_local_node(self.local_node)
        .with_default_max_distance(self.config.max_distance_km)
    }

    /// Latest link status
    pub fn link_status(&self) -> LinkStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch link status changes
    pub fn subscribe_link_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}
