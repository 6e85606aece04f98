//! Integration tests for the operator status view.


use std::time::Duration;

use harness::{harness, harness_with, small};
use mansion_provisioner::{AllocationStatus, BrokerError};
use mansion_throttle::{QuotaProblem, QuotaScope};

#[tokio::test(start_paused = true)]
async fn test_status_reports_failures_and_quota() {
    let h = harness();
    h.broker.fail_next_create(BrokerError::TooManyVms {
        scope: QuotaScope::ForType {
            mansion_type: "linux".into(),
        },
        message: "20 VMs running".into(),
    });
    let mut pending = h.provisioner.provision(&small(), None, 1);
    pending.remove(0).wait().await.unwrap_err();
    h.provisioner.quota().add_problem(QuotaProblem::new(
        QuotaScope::ForSize {
            mansion_type: "mac".into(),
            size: "xlarge".into(),
        },
        "not in plan",
    ));

    let status = h.provisioner.status();

    assert_eq!(status.allocations.len(), 1);
    let failed = &status.allocations[0];
    assert_eq!(failed.status, AllocationStatus::Failed);
    assert_eq!(failed.display_name, "Linux small");
    assert_eq!(failed.reason, Some("too_many_vms"));
    assert_eq!(failed.problem.as_deref(), Some("too many VMs: 20 VMs running"));
    assert!(!failed.dismissed);

    let messages: Vec<_> = status
        .quota_problems
        .iter()
        .map(|p| p.message.as_str())
        .collect();
    assert_eq!(
        messages,
        [
            "Unable to provision xlarge from: mac : not in plan",
            "Unable to provision linux : 20 VMs running (Will retry automatically)",
        ]
    );

    assert_eq!(status.backoff.len(), 1);
    assert_eq!(status.backoff[0].template, small());
    assert_eq!(status.backoff[0].errors, 1);
    assert_eq!(status.backoff[0].remaining_secs, 2);

    assert_eq!(status.in_provisioning, 0);
    assert_eq!(
        status.last_error.as_deref(),
        Some("too many VMs: 20 VMs running")
    );

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["allocations"][0]["status"], "failed");
    assert_eq!(json["quota_problems"][0]["scope"], "for_size");
    assert_eq!(json["quota_problems"][0]["size"], "xlarge");
    assert_eq!(json["quota_problems"][1]["scope"], "for_type");
    assert_eq!(json["quota_problems"][1]["too_many_vms"], true);
    assert_eq!(json["backoff"][0]["template"], "small");
}

#[tokio::test(start_paused = true)]
async fn test_status_lists_nodes_and_in_flight_allocations() {
    let h = harness();
    let node = h.online_node().await;

    h.broker.set_create_delay(Duration::from_secs(30));
    let _pending = h.provisioner.provision(&small(), None, 1);
    tokio::task::yield_now().await;

    let status = h.provisioner.status();
    assert_eq!(status.in_provisioning, 1);
    assert_eq!(status.allocations.len(), 1);
    assert_eq!(status.allocations[0].status, AllocationStatus::Requesting);
    assert!(status.allocations[0].problem.is_none());

    assert_eq!(status.nodes.len(), 1);
    assert_eq!(status.nodes[0].id, node.id());
    assert_eq!(status.nodes[0].name, "vm-0");
    assert_eq!(status.nodes[0].label, "small small");
    assert!(status.nodes[0].accepting_tasks);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["nodes"][0]["connection"], "online");
}

#[tokio::test(start_paused = true)]
async fn test_failures_leave_the_view_after_retention() {
    let h = harness_with(|config| {
        config.registry.problem_retention = Duration::from_secs(60 * 60);
    });
    h.broker
        .fail_next_create(BrokerError::Transport("connection reset".into()));
    let mut pending = h.provisioner.provision(&small(), None, 1);
    pending.remove(0).wait().await.unwrap_err();

    tokio::time::advance(Duration::from_secs(59 * 60)).await;
    assert_eq!(h.provisioner.status().allocations.len(), 1);

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    let status = h.provisioner.status();
    assert!(status.allocations.is_empty());
    assert!(status.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failure_cap_keeps_newest() {
    let h = harness_with(|config| {
        config.registry.failure_cap = 2;
    });
    let mut ids = Vec::new();
    for i in 0..4 {
        h.provisioner.retry_now(&small());
        h.broker
            .fail_next_create(BrokerError::Other(format!("failure {i}")));
        let mut pending = h.provisioner.provision(&small(), None, 1);
        let pending = pending.remove(0);
        ids.push(pending.id());
        pending.wait().await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    let status = h.provisioner.status();
    let kept: Vec<_> = status.allocations.iter().map(|a| a.id).collect();
    assert_eq!(kept, ids[2..]);
    assert_eq!(status.last_error.as_deref(), Some("failure 3"));
}
