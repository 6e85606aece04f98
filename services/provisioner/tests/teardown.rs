//! Integration tests for node teardown and the file-system clan.
//!
//! Teardown snapshots the template's persistent paths into its clan, posts
//! the billing memo and disposes the VM. The next VM of the template on the
//! same host starts from those snapshots.


use std::sync::Arc;

use harness::{build, harness, small};
use mansion_provisioner::broker::FileSystemSource;
use mansion_provisioner::clan::ClanStore;

#[tokio::test(start_paused = true)]
async fn test_teardown_posts_memo_and_disposes() {
    let h = harness();
    let node = h.online_node().await;
    let dispatcher = h.provisioner.dispatcher();

    for number in [1, 2] {
        dispatcher.assign(node.id()).await.unwrap();
        dispatcher
            .complete(node.id(), Some(build("api", number)))
            .unwrap();
    }

    assert!(h.provisioner.terminate(node.id()).await);

    let vm = &h.broker.created_vms()[0];
    let memo = vm.memo().unwrap();
    let builds = memo["builds"].as_array().unwrap();
    assert_eq!(builds.len(), 2);
    assert_eq!(builds[1]["url"], "job/api/2/");
    assert_eq!(builds[1]["userCauses"][0], "alice");
    assert!(vm.is_disposed());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_without_builds_skips_memo() {
    let h = harness();
    let node = h.online_node().await;

    assert!(h.provisioner.terminate(node.id()).await);

    let vm = &h.broker.created_vms()[0];
    assert!(vm.memo().is_none());
    assert!(vm.is_disposed());
}

#[tokio::test(start_paused = true)]
async fn test_teardown_is_idempotent() {
    let h = harness();
    let node = h.online_node().await;

    assert!(h.provisioner.terminate(node.id()).await);
    assert!(!h.provisioner.terminate(node.id()).await);
    assert_eq!(h.broker.taken_snapshots().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_next_vm_starts_from_snapshot() {
    let h = harness();
    let node = h.online_node().await;
    h.provisioner.terminate(node.id()).await;

    let snapshots = h.broker.taken_snapshots();
    assert_eq!(snapshots.len(), 1);
    let store = ClanStore::new(h.dir.path(), h.broker.clone());
    assert!(store.path_for(&small()).exists());

    h.online_node().await;

    let vm = &h.broker.created_vms()[1];
    let spec = &vm.setups()[0];
    assert_eq!(
        spec.file_systems["/workspace"],
        FileSystemSource::Snapshot {
            url: snapshots[0].clone()
        }
    );
    // Configs from the template survive the overlay.
    assert_eq!(spec.configs["env"]["CI"], "true");
}

#[tokio::test(start_paused = true)]
async fn test_snapshots_from_another_host_are_not_applied() {
    let h = harness();
    let node = h.online_node().await;
    h.provisioner.terminate(node.id()).await;

    h.broker.set_host("other.test");
    h.online_node().await;

    let spec = &h.broker.created_vms()[1].setups()[0];
    assert!(!spec.uses_snapshots());
    assert_eq!(spec.file_systems["/workspace"], FileSystemSource::Blank);
}

#[tokio::test(start_paused = true)]
async fn test_successive_teardowns_replace_lineage() {
    let h = harness();
    let first = h.online_node().await;
    h.provisioner.terminate(first.id()).await;
    let second = h.online_node().await;
    h.provisioner.terminate(second.id()).await;

    let taken = h.broker.taken_snapshots();
    assert_eq!(taken.len(), 2);
    assert_eq!(h.broker.disposed_snapshots(), vec![taken[0].clone()]);

    let store = ClanStore::new(h.dir.path(), h.broker.clone());
    let clan = store.try_load(&small()).unwrap();
    assert_eq!(clan.lineages().len(), 1);
    assert_eq!(clan.lineages()[0].snapshot, taken[1]);
}

#[tokio::test(start_paused = true)]
async fn test_wipe_ignores_teardown_of_older_vm() {
    let h = harness();
    let node = h.online_node().await;

    h.provisioner.dispose_clan(&small()).await.unwrap();
    h.provisioner.terminate(node.id()).await;

    assert!(h.broker.taken_snapshots().is_empty());
    assert!(h.broker.created_vms()[0].is_disposed());

    // VMs created after the wipe feed the clan again.
    let node = h.online_node().await;
    h.provisioner.terminate(node.id()).await;
    assert_eq!(h.broker.taken_snapshots().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wipe_waits_for_running_teardown() {
    let h = harness();
    let node = h.online_node().await;
    h.broker.hold_snapshots();

    let teardown = tokio::spawn({
        let provisioner = Arc::clone(&h.provisioner);
        async move { provisioner.terminate(node.id()).await }
    });
    while h.broker.snapshots_started() == 0 {
        tokio::task::yield_now().await;
    }

    let wipe = tokio::spawn({
        let provisioner = Arc::clone(&h.provisioner);
        async move { provisioner.dispose_clan(&small()).await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!wipe.is_finished());

    h.broker.release_snapshots(1);
    assert!(teardown.await.unwrap());
    wipe.await.unwrap().unwrap();

    // The wipe ran last: it disposed the fresh snapshot and its stamp stuck.
    let taken = h.broker.taken_snapshots();
    assert_eq!(taken.len(), 1);
    assert_eq!(h.broker.disposed_snapshots(), taken);
    let store = ClanStore::new(h.dir.path(), h.broker.clone());
    let clan = store.try_load(&small()).unwrap();
    assert!(clan.lineages().is_empty());
    assert!(clan.last_destroyed_at().is_some());

    // Later teardowns of VMs from before the wipe still record nothing.
    let stale = h.online_node().await;
    h.provisioner.dispose_clan(&small()).await.unwrap();
    h.provisioner.terminate(stale.id()).await;
    assert_eq!(h.broker.snapshots_started(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_teardowns_account_for_every_snapshot() {
    let h = harness();
    let first = h.online_node().await;
    let second = h.online_node().await;
    h.broker.hold_snapshots();

    let teardowns: Vec<_> = [first, second]
        .into_iter()
        .map(|node| {
            let provisioner = Arc::clone(&h.provisioner);
            tokio::spawn(async move { provisioner.terminate(node.id()).await })
        })
        .collect();
    while h.broker.snapshots_started() == 0 {
        tokio::task::yield_now().await;
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    // The second teardown waits for the clan.
    assert_eq!(h.broker.snapshots_started(), 1);

    h.broker.release_snapshots(2);
    for teardown in teardowns {
        assert!(teardown.await.unwrap());
    }

    let taken = h.broker.taken_snapshots();
    assert_eq!(taken.len(), 2);
    assert_eq!(h.broker.disposed_snapshots(), vec![taken[0].clone()]);
    let store = ClanStore::new(h.dir.path(), h.broker.clone());
    let clan = store.try_load(&small()).unwrap();
    assert_eq!(clan.lineages().len(), 1);
    assert_eq!(clan.lineages()[0].snapshot, taken[1]);
}
