//! Read-only query interface
//!
//! Everything here reads from the store's read path and never fails
//! towards the caller: a read error is logged and an empty result is
//! returned instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::data::{current_timestamp, NeighborEdge, NodeStat, StorageHealthSnapshot, Store};
use crate::link::LinkStatus;
use crate::mesh::{merge, MergeInput, MergeOptions, NodeDirectory, NodeId, TopologySnapshot};
use crate::tasks::{IngestCounters, IngestStats};

/// Query handle; cheap to clone
#[derive(Clone)]
pub struct QueryService {
    store: Store,
    directory: Arc<dyn NodeDirectory>,
    local_node: Option<NodeId>,
    default_max_distance_km: Option<f64>,
    status: watch::Receiver<LinkStatus>,
    counters: Arc<IngestCounters>,
}

/// Bridge-wide counters for status output
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub link: LinkStatus,
    pub ingest: IngestStats,
    pub storage: StorageHealthSnapshot,
}

impl QueryService {
    pub fn new(
        store: Store,
        directory: Arc<dyn NodeDirectory>,
        status: watch::Receiver<LinkStatus>,
        counters: Arc<IngestCounters>,
    ) -> Self {
        Self {
            store,
            directory,
            local_node: None,
            default_max_distance_km: None,
            status,
            counters,
        }
    }

    /// Our own radio; excluded as an inference target
    pub fn with_local_node(mut self, node: Option<NodeId>) -> Self {
        self.local_node = node;
        self
    }

    /// Distance limit used when a topology query does not give one
    pub fn with_default_max_distance(mut self, km: Option<f64>) -> Self {
        self.default_max_distance_km = km;
        self
    }

    fn since(window: Duration) -> i64 {
        current_timestamp().saturating_sub(window.as_secs() as i64)
    }

    /// Aggregate statistics for one node
    pub async fn get_node_stat(&self, node: NodeId) -> Option<NodeStat> {
        match self.store.query_node_stat(node).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!(node = %node, error = %e, "Query: node stat read failed");
                None
            }
        }
    }

    /// Edges reported by `observer` within the window, every provenance
    pub async fn get_neighbors(&self, observer: NodeId, window: Duration) -> Vec<NeighborEdge> {
        match self.store.query_neighbors(observer, Self::since(window)).await {
            Ok(edges) => edges,
            Err(e) => {
                warn!(observer = %observer, error = %e, "Query: neighbor read failed");
                Vec::new()
            }
        }
    }

    /// Merged topology of the window
    pub async fn get_topology(
        &self,
        window: Duration,
        max_distance_km: Option<f64>,
    ) -> TopologySnapshot {
        self.topology_at(current_timestamp(), window, max_distance_km)
            .await
    }

    /// Topology as of `now`; exposed so callers with their own clock can query
    pub async fn topology_at(
        &self,
        now: i64,
        window: Duration,
        max_distance_km: Option<f64>,
    ) -> TopologySnapshot {
        let since = now.saturating_sub(window.as_secs() as i64);
        let options = MergeOptions {
            local_node: self.local_node,
            max_distance_km: max_distance_km.or(self.default_max_distance_km),
        };

        let loaded = async {
            let edges = self.store.query_all_edges(since).await?;
            let hop_counts = self.store.query_hop_counts(since).await?;
            let reporters = self.store.query_topology_reporters(since).await?;
            Ok::<_, crate::data::StoreError>((edges, hop_counts, reporters))
        }
        .await;

        let (edges, hop_counts, reporters) = match loaded {
            Ok(evidence) => evidence,
            Err(e) => {
                warn!(error = %e, "Query: topology read failed, returning empty topology");
                (Vec::new(), Vec::new(), Vec::new())
            }
        };
        let reporters: Vec<NodeId> = reporters.into_iter().map(|r| r.node).collect();

        let snapshot = merge(
            &MergeInput {
                since,
                edges: &edges,
                hop_counts: &hop_counts,
                reporters: &reporters,
            },
            self.directory.as_ref(),
            &options,
        );
        debug!(
            nodes = snapshot.stats.total_nodes,
            edges = snapshot.edges.len(),
            inferred = snapshot.stats.inferred_edges,
            "Query: topology merged"
        );
        snapshot
    }

    /// Topology as pretty-printed JSON
    pub async fn export_topology(
        &self,
        window: Duration,
        max_distance_km: Option<f64>,
    ) -> serde_json::Result<String> {
        let snapshot = self.get_topology(window, max_distance_km).await;
        serde_json::to_string_pretty(&snapshot)
    }

    /// Latest published link status
    pub fn link_status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    /// Link, ingest and storage counters together
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            link: self.link_status(),
            ingest: self.counters.snapshot(),
            storage: self.store.health().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use crate::mesh::{EdgeTag, MemoryDirectory, PacketKind, PacketRecord, Position, Provenance};

    fn node(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn service(store: &Store, directory: Arc<MemoryDirectory>) -> (QueryService, watch::Sender<LinkStatus>) {
        let (tx, rx) = watch::channel(LinkStatus::default());
        let service = QueryService::new(
            store.clone(),
            directory,
            rx,
            Arc::new(IngestCounters::default()),
        );
        (service, tx)
    }

    async fn heard(store: &Store, from: u32, hops: u32, at: i64) {
        let record = PacketRecord {
            timestamp: at,
            from: node(from),
            to: NodeId::BROADCAST,
            kind: PacketKind::Telemetry,
            snr: None,
            rssi: None,
            hops_away: Some(hops),
            channel: None,
            size_bytes: 10,
            payload: None,
            source: Provenance::DirectRadio,
        };
        assert!(store.record_packet(&record).await.is_some());
    }

    #[tokio::test]
    async fn test_topology_with_inference() {
        let store = Store::open_memory().unwrap();
        let now = current_timestamp();
        heard(&store, 1, 0, now - 30).await;
        heard(&store, 2, 1, now - 20).await;
        heard(&store, 3, 2, now - 10).await;
        store
            .upsert_neighbor_edge(node(2), node(1), Some(5.0), now - 20, None, Provenance::DirectRadio)
            .await
            .unwrap();

        let (service, _tx) = service(&store, Arc::new(MemoryDirectory::new()));
        let snapshot = service.get_topology(Duration::from_secs(3600), None).await;

        assert_eq!(snapshot.edges_tagged(EdgeTag::DirectMeasurement).count(), 1);
        let inferred: Vec<_> = snapshot.edges_tagged(EdgeTag::Inferred).collect();
        assert_eq!(inferred.len(), 1);
        assert_eq!(inferred[0].observer, node(3));
        assert_eq!(inferred[0].neighbor, node(2));
    }

    #[tokio::test]
    async fn test_local_node_is_never_a_target() {
        let store = Store::open_memory().unwrap();
        let now = current_timestamp();
        heard(&store, 5, 1, now - 10).await;
        heard(&store, 6, 2, now - 10).await;

        let (service, _tx) = service(&store, Arc::new(MemoryDirectory::new()));
        let service = service.with_local_node(Some(node(5)));
        let snapshot = service.get_topology(Duration::from_secs(3600), None).await;
        assert_eq!(snapshot.edges_tagged(EdgeTag::Inferred).count(), 0);
    }

    #[tokio::test]
    async fn test_window_excludes_old_evidence() {
        let store = Store::open_memory().unwrap();
        let now = current_timestamp();
        store
            .upsert_neighbor_edge(node(1), node(2), None, now - 7200, None, Provenance::RelayBridge)
            .await
            .unwrap();

        let (service, _tx) = service(&store, Arc::new(MemoryDirectory::new()));
        assert!(service.get_neighbors(node(1), Duration::from_secs(3600)).await.is_empty());
        assert_eq!(
            service.get_neighbors(node(1), Duration::from_secs(3 * 3600)).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_default_distance_applies() {
        let store = Store::open_memory().unwrap();
        let now = current_timestamp();
        store
            .upsert_neighbor_edge(node(1), node(2), None, now - 10, None, Provenance::DirectRadio)
            .await
            .unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        // Berlin and Paris
        directory.set_position(node(1), Position { latitude: 52.52, longitude: 13.405, altitude: None });
        directory.set_position(node(2), Position { latitude: 48.8566, longitude: 2.3522, altitude: None });

        let (service, _tx) = service(&store, directory);
        let service = service.with_default_max_distance(Some(100.0));

        let limited = service.get_topology(Duration::from_secs(3600), None).await;
        assert!(limited.edges.is_empty());
        assert_eq!(limited.stats.dropped_by_distance, 1);

        let widened = service.get_topology(Duration::from_secs(3600), Some(2000.0)).await;
        assert_eq!(widened.edges.len(), 1);
    }

    #[tokio::test]
    async fn test_export_is_json() {
        let store = Store::open_memory().unwrap();
        let now = current_timestamp();
        store
            .upsert_neighbor_edge(node(1), node(2), Some(-3.5), now - 10, None, Provenance::RelayBridge)
            .await
            .unwrap();

        let (service, _tx) = service(&store, Arc::new(MemoryDirectory::new()));
        let json = service.export_topology(Duration::from_secs(3600), None).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["edges"].as_array().unwrap().len(), 1);
        assert_eq!(value["edges"][0]["tag"], "relay_collected");
    }

    #[tokio::test]
    async fn test_missing_node_stat_is_none() {
        let store = Store::open_memory().unwrap();
        let (service, _tx) = service(&store, Arc::new(MemoryDirectory::new()));
        assert!(service.get_node_stat(node(42)).await.is_none());
    }

    #[tokio::test]
    async fn test_link_status_follows_watch() {
        let store = Store::open_memory().unwrap();
        let (service, tx) = service(&store, Arc::new(MemoryDirectory::new()));
        assert_eq!(service.link_status().state, LinkState::Disconnected);

        tx.send_replace(LinkStatus {
            state: LinkState::Live,
            session_packets: 7,
            ..LinkStatus::default()
        });
        let stats = service.stats();
        assert_eq!(stats.link.state, LinkState::Live);
        assert_eq!(stats.link.session_packets, 7);
        assert!(!stats.storage.degraded);
    }
}
