//! Maintenance tasks
//!
//! Periodic retention sweep. Each table is pruned against its own window;
//! compaction is amortized over sweeps by the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{info, trace, warn};

use crate::bridge::Bridge;
use crate::data::{current_timestamp, PruneReport, RetentionPolicy, Store};

/// Run one sweep and log what it removed
pub async fn run_retention_sweep(
    store: &Store,
    policy: &RetentionPolicy,
    now: i64,
) -> Option<PruneReport> {
    match store.prune(now, policy).await {
        Ok(report) if report.total() > 0 => {
            info!(
                deleted = report.total(),
                packets = report.packets,
                neighbor_edges = report.neighbor_edges,
                node_stats = report.node_stats,
                topology_reporters = report.topology_reporters,
                "Cleanup: removed {} expired rows",
                report.total()
            );
            Some(report)
        }
        Ok(report) => {
            trace!("Cleanup: nothing expired");
            Some(report)
        }
        Err(e) => {
            warn!(error = %e, "Cleanup: retention sweep failed");
            None
        }
    }
}

impl Bridge {
    /// Run the retention loop until the bridge stops
    pub(crate) async fn run_cleanup_loop(
        store: Store,
        policy: RetentionPolicy,
        running: Arc<RwLock<bool>>,
        mut shutdown: watch::Receiver<bool>,
        cleanup_interval: Duration,
    ) {
        info!(
            interval_secs = cleanup_interval.as_secs(),
            packet_retention_secs = policy.packets.as_secs(),
            edge_retention_secs = policy.neighbor_edges.as_secs(),
            stat_retention_secs = policy.node_stats.as_secs(),
            "Cleanup loop started"
        );

        loop {
            // Check if we should stop
            if !*running.read().await {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(cleanup_interval) => {}
                _ = shutdown.changed() => break,
            }

            // Skip if stopped during sleep
            if !*running.read().await {
                break;
            }

            run_retention_sweep(&store, &policy, current_timestamp()).await;
        }

        info!("Cleanup loop stopped");
    }
}
