// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for node takeover through the node monitor.
//!
//! Node A accepted a fleet creation and died before running it. Node B's
//! monitor notices the stale heartbeat, absorbs node A and finishes the
//! provisioning.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use fleetplane_core::persistence::{FleetRecord, NewWorkflow, ScalingGroupRecord};
use fleetplane_core::state::{
    FleetState, NodeState, ScalingGroupState, TaskType, WorkflowState,
};
use fleetplane_core::{ExecutionContext, NodeRegistry};
use fleetplane_environment::node_monitor::{NodeMonitor, NodeMonitorConfig};
use fleetplane_environment::steps::keys;
use fleetplane_environment::workflows::{CreateFleetParams, TenantScope};

fn monitor(node: &TestNode, node_id: &str) -> NodeMonitor {
    NodeMonitor::new(
        NodeRegistry::new(node.persistence.clone(), node_id),
        node.executor.clone(),
        NodeMonitorConfig {
            poll_interval: Duration::from_millis(10),
            stale_after: Duration::from_secs(30),
        },
    )
}

/// Records `create_fleet` would have written on node A before it crashed.
async fn orphaned_creation(node: &TestNode, owner: &str) -> (String, String) {
    let now = Utc::now();
    let fleet_id = "fleet-1".to_string();
    let group_id = "group-1".to_string();
    let scope = TenantScope {
        tenant_id: "tenant-1".into(),
        role_id: "role-1".into(),
        region: "eu-west-1".into(),
    };

    node.persistence
        .create_fleet(&FleetRecord {
            fleet_id: fleet_id.clone(),
            tenant_id: scope.tenant_id.clone(),
            role_id: scope.role_id.clone(),
            name: "arena".into(),
            region: scope.region.clone(),
            image_id: "img-base".into(),
            instance_type: "c5.large".into(),
            state: FleetState::Creating.as_str().into(),
            last_error: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    node.persistence
        .create_scaling_group(&ScalingGroupRecord {
            group_id: group_id.clone(),
            fleet_id: fleet_id.clone(),
            region: scope.region.clone(),
            remote_group_id: None,
            min_size: 0,
            max_size: 4,
            desired_size: 2,
            state: ScalingGroupState::Creating.as_str().into(),
            cool_down_secs: 0,
            enable_auto_scaling: false,
            visible: true,
            last_scaled_at: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let params = CreateFleetParams {
        fleet_id: fleet_id.clone(),
        group_id: group_id.clone(),
        image_id: "img-base".into(),
        instance_type: "c5.large".into(),
        scope,
    };
    node.persistence
        .create_workflow(
            &NewWorkflow {
                workflow_id: "wf-1".into(),
                resource_id: fleet_id.clone(),
                task_type: TaskType::CreateFleet,
                params: serde_json::to_vec(&params).unwrap(),
                context: ExecutionContext::new().with(keys::REGION, "eu-west-1"),
                owner_node_id: owner.into(),
            },
            now,
        )
        .await
        .unwrap();

    (fleet_id, group_id)
}

#[tokio::test]
async fn test_survivor_takes_over_and_finishes_provisioning() {
    let node_b = TestNode::new("node-b").await;
    node_b
        .persistence
        .register_node("node-a", Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
    let (fleet_id, group_id) = orphaned_creation(&node_b, "node-a").await;

    let monitor = monitor(&node_b, "node-b");
    NodeRegistry::new(node_b.persistence.clone(), "node-b")
        .register()
        .await
        .unwrap();
    monitor.tick().await.unwrap();

    node_b.wait_for_fleet(&fleet_id, FleetState::Active).await;

    let workflow = node_b.service.workflow_status("wf-1").await.unwrap();
    assert_eq!(workflow.owner_node_id, "node-b");
    assert_eq!(workflow.state().unwrap(), WorkflowState::Finished);

    let group = node_b.service.get_scaling_group(&group_id).await.unwrap();
    assert!(group.remote_group_id.is_some());

    let dead = node_b.persistence.get_node("node-a").await.unwrap().unwrap();
    assert_ne!(dead.state().unwrap(), NodeState::Running);
}

#[tokio::test]
async fn test_live_peer_is_left_alone() {
    let node_b = TestNode::new("node-b").await;
    NodeRegistry::new(node_b.persistence.clone(), "node-a")
        .register()
        .await
        .unwrap();
    orphaned_creation(&node_b, "node-a").await;

    NodeRegistry::new(node_b.persistence.clone(), "node-b")
        .register()
        .await
        .unwrap();
    monitor(&node_b, "node-b").tick().await.unwrap();

    let workflow = node_b.service.workflow_status("wf-1").await.unwrap();
    assert_eq!(workflow.owner_node_id, "node-a");
    assert_eq!(workflow.state().unwrap(), WorkflowState::Create);
    assert_eq!(node_b.executor.in_flight().await, 0);
}

#[tokio::test]
async fn test_absorbed_node_registers_again() {
    let node_b = TestNode::new("node-b").await;
    let node_a = node_b.peer("node-a").await;
    node_b
        .persistence
        .register_node("node-a", Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();

    let survivor = NodeRegistry::new(node_b.persistence.clone(), "node-b");
    survivor.register().await.unwrap();
    let report = survivor.sweep(Duration::from_secs(30)).await.unwrap();
    assert_eq!(report.taken_over, 1);

    // Node A wakes up after the takeover completed
    monitor(&node_a, "node-a").tick().await.unwrap();

    let node = node_b.persistence.get_node("node-a").await.unwrap().unwrap();
    assert_eq!(node.state().unwrap(), NodeState::Running);
}

#[tokio::test]
async fn test_outcome_written_before_crash_reaches_fleet() {
    let node_b = TestNode::new("node-b").await;
    node_b
        .persistence
        .register_node("node-a", Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
    let (fleet_id, group_id) = orphaned_creation(&node_b, "node-a").await;

    // Node A rolled the workflow back and died before updating the fleet
    let persistence = &node_b.persistence;
    persistence
        .try_transition_workflow("wf-1", "node-a", WorkflowState::Create, WorkflowState::Running, None)
        .await
        .unwrap();
    persistence
        .begin_workflow_rollback("wf-1", "node-a", 0, 1, "step 'prepare-vpc' failed: quota", Utc::now())
        .await
        .unwrap();
    persistence
        .try_transition_workflow(
            "wf-1",
            "node-a",
            WorkflowState::RollingBack,
            WorkflowState::RolledBack,
            None,
        )
        .await
        .unwrap();

    NodeRegistry::new(node_b.persistence.clone(), "node-b")
        .register()
        .await
        .unwrap();
    monitor(&node_b, "node-b").tick().await.unwrap();

    let fleet = node_b.wait_for_fleet(&fleet_id, FleetState::Error).await;
    assert!(fleet.last_error.unwrap().contains("quota"));
    let group = node_b
        .persistence
        .get_scaling_group(&group_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.state().unwrap(), ScalingGroupState::Error);

    // Settled: later cycles leave it alone
    assert!(node_b.executor.wait_idle(Duration::from_secs(5)).await);
    assert_eq!(node_b.executor.resume_owned().await.unwrap(), 0);
}
