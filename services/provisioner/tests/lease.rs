//! Integration tests for lease renewal.


use std::time::Duration;

use harness::harness;
use mansion_provisioner::lease::SweepStats;
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn test_sweep_renews_online_nodes() {
    let h = harness();
    let node = h.online_node().await;
    let daemon = h.provisioner.lease_daemon();

    tokio::time::advance(Duration::from_secs(30)).await;
    let stats = daemon.sweep().await;

    assert_eq!(
        stats,
        SweepStats {
            renewed: 1,
            ..Default::default()
        }
    );
    assert_eq!(h.broker.created_vms()[0].renew_count(), 1);
    assert_eq!(node.last_renewed(), tokio::time::Instant::now());
}

#[tokio::test(start_paused = true)]
async fn test_offline_node_is_skipped() {
    let h = harness();
    let node = h.online_node().await;
    h.provisioner.on_node_offline(node.id());

    let stats = h.provisioner.lease_daemon().sweep().await;

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.renewed, 0);
    assert_eq!(h.broker.created_vms()[0].renew_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_tolerated_until_stale() {
    let h = harness();
    let node = h.online_node().await;
    let daemon = h.provisioner.lease_daemon();
    h.broker.fail_renew(true);

    tokio::time::advance(Duration::from_secs(29 * 60)).await;
    let stats = daemon.sweep().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.terminated, 0);
    assert!(h.provisioner.node(node.id()).is_some());

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    let stats = daemon.sweep().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.terminated, 1);
    assert!(node.is_terminated());
    assert!(h.provisioner.nodes().is_empty());
    assert!(h.broker.created_vms()[0].is_disposed());
}

#[tokio::test(start_paused = true)]
async fn test_successful_renewal_resets_staleness() {
    let h = harness();
    let node = h.online_node().await;
    let daemon = h.provisioner.lease_daemon();

    tokio::time::advance(Duration::from_secs(20 * 60)).await;
    daemon.sweep().await;

    h.broker.fail_renew(true);
    tokio::time::advance(Duration::from_secs(20 * 60)).await;
    let stats = daemon.sweep().await;

    assert_eq!(stats.terminated, 0);
    assert!(!node.is_terminated());
}

#[tokio::test(start_paused = true)]
async fn test_daemon_renews_every_period() {
    let h = harness();
    h.online_node().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = h.provisioner.lease_daemon();
    let handle = tokio::spawn(async move { daemon.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert_eq!(h.broker.created_vms()[0].renew_count(), 3);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
