//! Radio bytes in, merged topology out

use std::path::PathBuf;
use std::time::Duration;

use meshbridge_core::testing::ScriptedTransport;
use meshbridge_core::{Bridge, BridgeConfig, EdgeTag, LinkState, NodeId};

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn temp_db(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("meshbridge-{}-{}.db", name, std::process::id()))
}

fn remove_db(path: &PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let mut file = path.clone().into_os_string();
        file.push(suffix);
        let _ = std::fs::remove_file(file);
    }
}

fn node(n: u32) -> NodeId {
    NodeId::new(n).unwrap()
}

#[tokio::test]
async fn test_radio_and_relay_evidence_merge() {
    let (transport, handle) = ScriptedTransport::new();
    let config = BridgeConfig::for_testing().with_local_node("!00000001");
    let bridge = Bridge::start_with_transport(config, Some(transport))
        .await
        .unwrap();

    let mut link = handle.next_link().await;
    let status = bridge.subscribe_link_status();
    wait_until("link to go live", || status.borrow().state == LinkState::Live).await;

    // Our radio hears node 2 one hop away reporting node 1, and node 3
    // two hops away with no report of its own
    link.send(b"boot banner from the radio\n").await;
    link.send(
        br#"{"from": 2, "type": "NEIGHBORINFO_APP", "hopStart": 3, "hopLimit": 2, "payload": {"node_id": "0x2", "neighbors": [{"node_id": "!00000001", "snr": 6.25}]}}"#,
    )
    .await;
    link.send(b"\n").await;
    link.send(
        b"{\"from\": \"!00000003\", \"type\": \"TELEMETRY_APP\", \"hops_away\": 2, \"payload\": {\"device_metrics\": {\"battery_level\": 80}}}\n",
    )
    .await;

    // A relay forwards node 4's report of node 2
    let relayed = r#"{"from": "!00000004", "type": "NEIGHBORINFO_APP", "payload": {"neighbors": [{"node_id": "2", "snr": -1.0}]}}"#;
    assert!(bridge.ingest_relay_json(relayed).await.unwrap());

    wait_until("all packets processed", || bridge.ingest_stats().processed >= 3).await;
    assert_eq!(bridge.link_status().session_packets, 2);
    bridge.stop().await;

    let topology = bridge
        .query()
        .get_topology(Duration::from_secs(3600), None)
        .await;

    let direct: Vec<_> = topology.edges_tagged(EdgeTag::DirectMeasurement).collect();
    assert_eq!(direct.len(), 1);
    assert_eq!((direct[0].observer, direct[0].neighbor), (node(2), node(1)));
    assert_eq!(direct[0].snr, Some(6.25));

    let relay: Vec<_> = topology.edges_tagged(EdgeTag::RelayCollected).collect();
    assert_eq!(relay.len(), 1);
    assert_eq!((relay[0].observer, relay[0].neighbor), (node(4), node(2)));

    let inferred: Vec<_> = topology.edges_tagged(EdgeTag::Inferred).collect();
    assert_eq!(inferred.len(), 1);
    assert_eq!((inferred[0].observer, inferred[0].neighbor), (node(3), node(2)));

    let stat = bridge.query().get_node_stat(node(3)).await.unwrap();
    assert_eq!(stat.packet_count, 1);
    assert_eq!(bridge.ingest_stats().decode_errors, 0);
}

#[tokio::test]
async fn test_store_survives_restart() {
    let path = temp_db("restart");
    remove_db(&path);

    let config = BridgeConfig::for_testing().with_db_path(path.clone());
    let bridge = Bridge::start(config.clone()).await.unwrap();
    let relayed = r#"{"from": "!0000000a", "type": "NEIGHBORINFO_APP", "payload": {"neighbors": [{"node_id": "!0000000b"}, {"node_id": "!0000000c"}]}}"#;
    assert!(bridge.ingest_relay_json(relayed).await.unwrap());
    bridge.stop().await;

    let reopened = Bridge::start(config).await.unwrap();
    let neighbors = reopened
        .query()
        .get_neighbors(node(10), Duration::from_secs(3600))
        .await;
    assert_eq!(neighbors.len(), 2);
    assert_eq!(reopened.store().table_counts().await.unwrap().topology_reporters, 1);
    reopened.stop().await;

    remove_db(&path);
}

#[tokio::test]
async fn test_export_topology_json() {
    let bridge = Bridge::start(BridgeConfig::for_testing()).await.unwrap();
    let relayed = r#"{"from": "!0000000a", "type": "NEIGHBORINFO_APP", "payload": {"neighbors": [{"node_id": "!0000000b", "snr": 2.0}]}}"#;
    bridge.ingest_relay_json(relayed).await.unwrap();
    bridge.stop().await;

    let json = bridge
        .query()
        .export_topology(Duration::from_secs(3600), None)
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["edges"][0]["observer"], "!0000000a");
    assert_eq!(value["edges"][0]["neighbor"], "!0000000b");
    assert_eq!(value["edges"][0]["tag"], "relay_collected");
}
