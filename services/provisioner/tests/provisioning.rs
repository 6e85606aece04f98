//! Integration tests for the provisioning flow.
//!
//! Covers the demand-facing surface of the controller:
//! 1. `provision` starts one allocation per unit of excess workload
//! 2. failures feed the template's backoff and the quota tracker
//! 3. blockages keep further requests from reaching the broker
//! 4. label resolution picks the template and the hardware size


use std::sync::Arc;
use std::time::Duration;

use harness::{harness, harness_with, osx, small};
use mansion_id::{NodeId, TemplateId};
use mansion_provisioner::template::HardwareSize;
use mansion_provisioner::{AllocationStatus, Blockage, BrokerError, ConnectError};
use mansion_throttle::{QuotaProblem, QuotaScope};
use tokio::sync::watch;

#[tokio::test(start_paused = true)]
async fn test_provision_three_small_nodes() {
    let h = harness();

    let pending = h.provisioner.provision(&small(), None, 3);
    assert_eq!(pending.len(), 3);
    for p in &pending {
        assert_eq!(p.allocation().status(), AllocationStatus::Requesting);
        assert_eq!(p.allocation().template().id, small());
    }
    assert_eq!(h.provisioner.registry().len(), 3);

    for p in pending {
        let allocation = p.allocation().clone();
        let node = p.wait().await.unwrap();
        assert_eq!(allocation.status(), AllocationStatus::Online);
        assert!(h.provisioner.node(node).is_some());
    }

    assert_eq!(h.provisioner.nodes().len(), 3);
    assert_eq!(h.broker.created_vms().len(), 3);
    assert_eq!(h.errors(&small()), 0);
    // Online allocations are not noteworthy.
    assert!(h.provisioner.status().allocations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_each_failure_records_one_error() {
    let h = harness();
    for _ in 0..3 {
        h.broker
            .fail_next_create(BrokerError::Auth("expired token".into()));
    }

    let pending = h.provisioner.provision(&small(), None, 3);
    for p in pending {
        let err = p.wait().await.unwrap_err();
        assert_eq!(err.reason_code(), "broker_auth");
    }

    assert_eq!(h.errors(&small()), 3);
    assert_eq!(h.provisioner.status().allocations.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_allocations_finish_independently() {
    let h = harness();
    h.broker
        .fail_next_create(BrokerError::Transport("connection reset".into()));

    let pending = h.provisioner.provision(&small(), None, 3);
    let mut online = 0;
    let mut failed = 0;
    for p in pending {
        match p.wait().await {
            Ok(_) => online += 1,
            Err(_) => failed += 1,
        }
    }

    assert_eq!((online, failed), (2, 1));
    assert_eq!(h.provisioner.nodes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_blocks_until_window_passes() {
    let h = harness();
    h.broker
        .fail_next_create(BrokerError::Transport("connection reset".into()));

    let mut pending = h.provisioner.provision(&small(), None, 1);
    pending.remove(0).wait().await.unwrap_err();
    assert_eq!(h.errors(&small()), 1);

    assert!(h.provisioner.provision(&small(), None, 1).is_empty());
    assert_eq!(h.broker.created_vms().len(), 0);

    tokio::time::advance(Duration::from_secs(3)).await;

    let mut pending = h.provisioner.provision(&small(), None, 1);
    assert_eq!(pending.len(), 1);
    pending.remove(0).wait().await.unwrap();

    // A node coming online lifts the backoff.
    assert_eq!(h.errors(&small()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_now_lifts_backoff() {
    let h = harness();
    let counter = h.provisioner.backoff().get_or_create(&small());
    for _ in 0..5 {
        counter.record_error();
    }
    assert!(h.provisioner.provision(&small(), None, 1).is_empty());

    h.provisioner.retry_now(&small());

    assert_eq!(h.provisioner.provision(&small(), None, 1).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_too_many_vms_blocks_type_until_offline_event() {
    let h = harness();
    h.broker.fail_next_create(BrokerError::TooManyVms {
        scope: QuotaScope::ForType {
            mansion_type: "linux".into(),
        },
        message: "20 VMs running".into(),
    });

    let mut pending = h.provisioner.provision(&small(), None, 1);
    let err = pending.remove(0).wait().await.unwrap_err();
    assert_eq!(err.reason_code(), "too_many_vms");

    // Past the backoff window, the quota problem still blocks linux.
    tokio::time::advance(Duration::from_secs(3)).await;
    match h
        .provisioner
        .can_provision(&small(), &HardwareSize::Large.to_spec())
    {
        Err(Blockage::QuotaBlocked(problem)) => assert!(problem.too_many_vms),
        other => panic!("expected quota blockage, got {other:?}"),
    }
    assert!(h.provisioner.provision(&small(), None, 1).is_empty());

    // Other mansion types are unaffected.
    assert!(h
        .provisioner
        .can_provision(&osx(), &HardwareSize::Large.to_spec())
        .is_ok());

    h.provisioner.on_node_offline(NodeId::new());
    assert!(h
        .provisioner
        .can_provision(&small(), &HardwareSize::Small.to_spec())
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_quota_sweeper_clears_only_too_many_vms() {
    let h = harness();
    let quota = h.provisioner.quota();
    quota.add_too_many_vms_problem(QuotaProblem::new(QuotaScope::Global, "limit reached"));
    quota.add_problem(QuotaProblem::new(
        QuotaScope::ForSize {
            mansion_type: "linux".into(),
            size: "large".into(),
        },
        "no large VMs in this subscription",
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn({
        let provisioner = h.provisioner.clone();
        async move { provisioner.run_quota_sweeper(shutdown_rx).await }
    });

    tokio::time::sleep(Duration::from_secs(301)).await;

    let problems = h.provisioner.quota().problems();
    assert_eq!(problems.len(), 1);
    assert!(!problems[0].too_many_vms);
    assert!(h
        .provisioner
        .can_provision(&small(), &HardwareSize::Small.to_spec())
        .is_ok());
    assert!(h
        .provisioner
        .can_provision(&small(), &HardwareSize::Large.to_spec())
        .is_err());

    h.provisioner.clear_quota_problems();
    assert!(h.provisioner.quota().problems().is_empty());

    shutdown_tx.send(true).unwrap();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_can_provision_blockages() {
    let h = harness();
    let hardware = HardwareSize::Small.to_spec();

    let unknown = TemplateId::parse("windows").unwrap();
    assert_eq!(
        h.provisioner.can_provision(&unknown, &hardware).unwrap_err(),
        Blockage::UnknownTemplate(unknown.clone())
    );

    h.provisioner.catalog().get(&osx()).unwrap().set_enabled(false);
    let blockage = h.provisioner.can_provision(&osx(), &hardware).unwrap_err();
    assert_eq!(blockage, Blockage::Disabled(osx()));
    assert_eq!(blockage.to_string(), "template osx is disabled");

    h.provisioner.backoff().get_or_create(&small()).record_error();
    match h.provisioner.can_provision(&small(), &hardware) {
        Err(Blockage::BackoffInEffect { template, until }) => {
            assert_eq!(template, small());
            assert!(until > tokio::time::Instant::now());
        }
        other => panic!("expected backoff, got {other:?}"),
    }

    h.provisioner.retry_now(&small());
    let template = h.provisioner.can_provision(&small(), &hardware).unwrap();
    assert_eq!(template.display_name, "Linux small");
}

#[tokio::test(start_paused = true)]
async fn test_provision_label_resolves_template_and_size() {
    let h = harness();

    let pending = h.provisioner.provision_label(Some("large"), 1);
    let allocation = pending[0].allocation();
    assert_eq!(allocation.template().id, small());
    assert_eq!(allocation.hardware().size, "large");
    assert_eq!(allocation.label(), "small large standard");

    let pending = h.provisioner.provision_label(Some("osx && xlarge"), 1);
    let allocation = pending[0].allocation();
    assert_eq!(allocation.template().id, osx());
    assert_eq!(allocation.hardware().size, "xlarge");

    // osx requires its name; an empty label falls to small at its default size.
    let pending = h.provisioner.provision_label(None, 1);
    assert_eq!(pending[0].allocation().template().id, small());
    assert_eq!(pending[0].allocation().hardware().size, "small");

    assert!(h.provisioner.provision_label(Some("windows"), 1).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_vm_is_created() {
    let h = harness();
    h.broker.set_create_delay(Duration::from_secs(30));

    let mut pending = h.provisioner.provision(&small(), None, 1);
    let pending = pending.remove(0);
    let allocation = pending.allocation().clone();
    tokio::task::yield_now().await;

    pending.cancel();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(allocation.status(), AllocationStatus::Failed);
    assert!(allocation.is_dismissed());
    assert!(h.broker.created_vms().is_empty());
    assert_eq!(h.errors(&small()), 0);
    assert!(h.provisioner.status().allocations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_connecting_tears_node_down() {
    let h = harness_with(|config| config.connect.retry_delay = Duration::from_secs(60));
    h.connector.fail_always(ConnectError::Io("refused".into()));

    let pending = h.provisioner.provision(&small(), None, 1).remove(0);
    let allocation = Arc::clone(pending.allocation());
    while allocation.resulting_node().is_none() {
        tokio::task::yield_now().await;
    }
    assert_eq!(allocation.status(), AllocationStatus::Connecting);
    let node_id = allocation.resulting_node().unwrap();

    pending.cancel();
    assert!(h.provisioner.node(node_id).is_none());

    // Nothing keeps the VM alive after the cancel.
    tokio::time::sleep(Duration::from_secs(60 * 60)).await;
    let vm = &h.broker.created_vms()[0];
    assert!(vm.is_disposed());
    assert_eq!(vm.renew_count(), 0);
    assert!(h.provisioner.retention().check_all().await.is_empty());
    assert!(h.provisioner.status().allocations.is_empty());
    assert_eq!(h.errors(&small()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dismiss_hides_failure() {
    let h = harness();
    h.broker
        .fail_next_create(BrokerError::Other("out of capacity".into()));

    let mut pending = h.provisioner.provision(&small(), None, 1);
    let pending = pending.remove(0);
    let id = pending.id();
    pending.wait().await.unwrap_err();

    let status = h.provisioner.status();
    assert_eq!(status.allocations.len(), 1);
    assert_eq!(status.allocations[0].reason, Some("broker_error"));
    assert_eq!(status.last_error.as_deref(), Some("out of capacity"));

    assert!(h.provisioner.dismiss(id));
    let status = h.provisioner.status();
    assert!(status.allocations.is_empty());
    assert!(status.last_error.is_none());
    // Dismissal does not forgive the error.
    assert_eq!(h.errors(&small()), 1);
}
