//! End-to-end rounds over the in-memory network.

use std::time::Duration;

use mix_node::{Activity, Cluster, LocalNetwork, NodeInstance};
use mix_round::failure::{persist_report, read_report};
use mix_types::config::NodeConfig;
use mix_types::{NodeId, PhaseType, RoundErrorReport, Slot};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(20);

fn config(dir: &tempfile::TempDir) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.graph.default_num_threads = 2;
    config.round.phase_timeout_ms = 10_000;
    config.round.gate_timeout_ms = 10_000;
    config.round.error_broadcast_timeout_ms = 2_000;
    config.error_output_path = dir.path().join("round-error.json");
    config
}

fn payloads(batch: &[Slot]) -> Vec<u64> {
    let mut v: Vec<u64> = batch.iter().map(|s| s.payload).collect();
    v.sort_unstable();
    v
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_mix_two_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = Cluster::start(3, &config(&dir)).unwrap();

    for round_id in 1..=2u64 {
        let input: Vec<Slot> = (0..10).map(|i| Slot::new(1_000 + i * 7 + round_id)).collect();
        let batch = cluster.run_round(round_id, input.clone(), TIMEOUT).await.unwrap();
        assert_eq!(batch.round_id, round_id);
        assert_eq!(batch.slots.len(), 10);
        assert_eq!(payloads(&batch.slots), payloads(&input));
    }

    for node in cluster.nodes() {
        let activity = node.await_activity(&[Activity::Completed], TIMEOUT).await.unwrap();
        assert_eq!(activity, Activity::Completed);
        assert!(node.rounds().is_retired(1));
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_batch_size_fails_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Cluster::start(3, &config(&dir)).unwrap();

    cluster.start_round(7, 4).await.unwrap();
    cluster.await_ready(7, TIMEOUT).await.unwrap();
    cluster.post_batch(7, vec![Slot::new(5); 3]).await.unwrap();

    assert!(cluster.await_all_errored(TIMEOUT).await);
    let first = &cluster.nodes()[0];
    let origin = read_report(&first.config().error_output_path).unwrap().unwrap();
    assert_eq!(origin.round_id, 7);
    assert_eq!(origin.phase, Some(PhaseType::RealDecrypt));
    assert_eq!(origin.node_id, *first.id());

    // Peers keep the first node's report as it was sent.
    for node in cluster.nodes() {
        let report = read_report(&node.config().error_output_path)
            .unwrap()
            .expect("report persisted");
        assert_eq!(report, origin);
        assert!(node.rounds().is_empty());
    }

    assert!(cluster.start_round(8, 4).await.is_ok());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first.rounds().contains(8));
    cluster.shutdown().await;
}

#[tokio::test]
async fn previous_error_is_recovered_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let left_behind = RoundErrorReport {
        round_id: 41,
        node_id: NodeId::from("solo"),
        phase: Some(PhaseType::PrecompShare),
        error: "phase PrecompShare timed out".into(),
        timestamp: "2026-03-01T12:00:00+00:00".into(),
    };
    persist_report(&config.error_output_path, &left_behind).unwrap();

    let net = LocalNetwork::new();
    let inbox = net.register(NodeId::from("solo"));
    let (tx, _rx) = mpsc::unbounded_channel();
    let node = NodeInstance::start(
        NodeId::from("solo"),
        config.clone(),
        std::sync::Arc::new(net),
        inbox,
        tx,
    )
    .unwrap();

    assert_eq!(node.recovered_error(), Some(&left_behind));
    assert!(read_report(&config.error_output_path).unwrap().is_none());
    assert_eq!(node.activity(), Activity::Waiting);
    node.shutdown().await;
}
