//! End-to-end sync scenarios over simulated nodes.
//!
//! Every scenario builds the chain past the checksum migration height so
//! that rebuilt and incremental checksums are both exercised.

use std::sync::Arc;
use std::time::Duration;

use syncprobe::{random_height_between, ScenarioError};
use syncprobe_core::KeyPrefix;
use syncprobe_sync::Node;
use syncprobe_testkit::chain;
use syncprobe_testkit::{SimNode, SyncMode, TestNetwork};

const HEIGHT: u64 = 800;
const PERIOD: u64 = 250;

async fn start_all(net: &TestNetwork, nodes: &[&Arc<SimNode>]) {
    for node in nodes {
        net.driver().start_node(node).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_block_sync_converges() {
    let net = TestNetwork::new(HEIGHT, PERIOD).unwrap();
    let driver = net.driver();
    let source = net.producer("source").unwrap();
    let fresh = net.block_sync_node("fresh").unwrap();
    start_all(&net, &[&source, &fresh]).await;

    let _link = driver.bridge(&source, &fresh).unwrap();
    driver.wait_for_node_to_fully_sync(&fresh).await.unwrap();
    assert_eq!(fresh.sync_status().height, HEIGHT);

    driver.assert_converged(&source, &fresh).await.unwrap();
    let report = driver.compare_nodes_by_state(&source, &fresh).await.unwrap();
    assert!(report.is_match());
    driver.verify_node_checksum(&source).await.unwrap();
    driver.verify_node_checksum(&fresh).await.unwrap();

    // Block sync replays every block, so undo records match too.
    driver
        .compare_stores(
            &*source.chain_store(),
            &*fresh.chain_store(),
            &[KeyPrefix::from_byte(chain::UNDO)],
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_restart_and_reconnect() {
    let net = TestNetwork::new(HEIGHT, PERIOD).unwrap();
    let driver = net.driver();
    let source = net.producer("source").unwrap();
    let fresh = net.block_sync_node("fresh").unwrap();
    start_all(&net, &[&source, &fresh]).await;

    let link = driver.bridge(&source, &fresh).unwrap();
    let cut = random_height_between(100, 400).unwrap();
    driver
        .disconnect_at_block_height(&fresh, &link, cut)
        .await
        .unwrap();
    assert!(link.is_severed());

    // Let any batch already received finish applying, then the height
    // must hold still while the link is down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stalled = fresh.sync_status();
    assert!(stalled.height >= cut);
    assert!(stalled.height < HEIGHT);
    assert!(!stalled.fully_current);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fresh.sync_status().height, stalled.height);

    driver.restart_node(&fresh).await.unwrap();
    assert!(fresh.sync_status().height >= stalled.height);
    let _link = driver.bridge(&source, &fresh).unwrap();
    driver.wait_for_node_to_fully_sync(&fresh).await.unwrap();

    driver.assert_converged(&source, &fresh).await.unwrap();
    driver.verify_node_checksum(&fresh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_at_height_reconnects() {
    let net = TestNetwork::new(HEIGHT, PERIOD).unwrap();
    let driver = net.driver();
    let source = net.producer("source").unwrap();
    let fresh = net.block_sync_node("fresh").unwrap();
    start_all(&net, &[&source, &fresh]).await;

    let link = driver.bridge(&source, &fresh).unwrap();
    let link = driver
        .restart_at_height_and_reconnect_node(&fresh, &source, &link, 650)
        .await
        .unwrap();
    assert!(link.is_running());

    driver.wait_for_node_to_fully_sync(&fresh).await.unwrap();
    driver.assert_converged(&source, &fresh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hypersync_restart_mid_snapshot() {
    let net = TestNetwork::new(HEIGHT, PERIOD).unwrap();
    let driver = net.driver();
    let (source, fresh) = net
        .source_and(
            net.node_config("fresh")
                .with_sync_mode(SyncMode::HyperSync)
                .with_snapshot_chunk_bytes(128),
        )
        .await
        .unwrap();
    driver.start_node(&fresh).await.unwrap();

    let link = driver.bridge(&source, &fresh).unwrap();
    let _link = driver
        .restart_at_sync_prefix_and_reconnect_node(
            &fresh,
            &source,
            &link,
            KeyPrefix::from_byte(chain::POSTS),
        )
        .await
        .unwrap();
    driver.wait_for_node_to_fully_sync(&fresh).await.unwrap();

    let progress = fresh.hypersync_progress();
    assert!(progress.iter().all(|p| p.completed));
    assert!(!fresh.sync_status().fully_stored);

    driver.assert_converged(&source, &fresh).await.unwrap();
    let report = driver.compare_nodes_by_state(&source, &fresh).await.unwrap();
    assert!(report.is_match());
    driver.verify_node_checksum(&fresh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_archival_hypersync_stores_history_and_index() {
    let net = TestNetwork::new(HEIGHT, PERIOD).unwrap();
    let driver = net.driver();
    let source = net
        .spawn(
            net.node_config("source")
                .with_block_producer(true)
                .with_tx_index(true),
        )
        .unwrap();
    let fresh = net
        .spawn(
            net.node_config("archive")
                .with_sync_mode(SyncMode::HyperSync)
                .with_archival(true)
                .with_tx_index(true),
        )
        .unwrap();
    start_all(&net, &[&source, &fresh]).await;

    let _link = driver.bridge(&source, &fresh).unwrap();
    driver
        .wait_for_node_to_fully_sync_and_store_all_blocks(&fresh)
        .await
        .unwrap();
    driver
        .wait_for_node_to_fully_sync_tx_index(&fresh)
        .await
        .unwrap();

    driver.assert_converged(&source, &fresh).await.unwrap();
    driver
        .compare_nodes_by_tx_index(&source, &fresh)
        .await
        .unwrap();
    driver
        .compare_stores(
            &*source.chain_store(),
            &*fresh.chain_store(),
            &[KeyPrefix::from_byte(chain::BLOCK_BODIES)],
        )
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_chains_diverge() {
    let net = TestNetwork::new(120, 50).unwrap();
    let driver = net.driver();
    let left = net.producer("left").unwrap();
    let right = net
        .spawn(
            net.node_config("right")
                .with_block_producer(true)
                .with_chain_seed(7),
        )
        .unwrap();
    start_all(&net, &[&left, &right]).await;

    match driver.compare_nodes_by_db(&left, &right).await {
        Err(ScenarioError::Diverged { report }) => {
            let failing = report.failing_prefixes();
            assert!(failing.contains(&KeyPrefix::from_byte(chain::BLOCK_HASHES)));
            assert!(!failing.contains(&KeyPrefix::from_byte(chain::BLOCK_BODIES)));
        }
        other => panic!("expected divergence, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(
        driver.compare_nodes_by_checksum(&left, &right).await,
        Err(ScenarioError::ChecksumMismatch { .. })
    ));
}

#[tokio::test]
async fn test_tx_index_required_for_index_comparison() {
    let net = TestNetwork::new(20, 10).unwrap();
    let driver = net.driver();
    let source = net.producer("source").unwrap();
    let plain = net.producer("plain").unwrap();
    start_all(&net, &[&source, &plain]).await;

    assert!(matches!(
        driver.compare_nodes_by_tx_index(&source, &plain).await,
        Err(ScenarioError::MissingTxIndex(_))
    ));
}

#[tokio::test]
async fn test_lifecycle_preconditions() {
    let net = TestNetwork::new(20, 10).unwrap();
    let driver = net.driver();
    let node = net.producer("source").unwrap();

    assert!(matches!(
        driver.shutdown_node(&node).await,
        Err(ScenarioError::Precondition(_))
    ));
    assert!(matches!(
        driver.restart_node(&node).await,
        Err(ScenarioError::Precondition(_))
    ));

    driver.start_node(&node).await.unwrap();
    assert!(matches!(
        driver.start_node(&node).await,
        Err(ScenarioError::Precondition(_))
    ));

    let idle = net.block_sync_node("idle").unwrap();
    assert!(driver.bridge(&node, &idle).is_err());
    driver.shutdown_node(&node).await.unwrap();
}
