// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end fleet lifecycle against the in-memory cloud.
//!
//! Create a fleet, let the reconciler bring it to size, then delete it and
//! check nothing is left behind.

mod common;

use std::time::Duration;

use common::*;
use fleetplane_core::state::{FleetState, ScalingGroupState, WorkflowState};
use fleetplane_environment::cloud::{CloudError, MockCloud, ResourceCounts};
use fleetplane_environment::reconciler::{
    ReconcileOutcome, Reconciler, ReconcilerConfig, ScalingDecision,
};
use fleetplane_environment::service::Capacity;

#[tokio::test]
async fn test_create_scale_and_delete_fleet() {
    let node = TestNode::new("node-a").await;

    let created = node
        .service
        .create_fleet(fleet_request(0, 5, 3))
        .await
        .unwrap();
    node.wait_for_fleet(&created.fleet_id, FleetState::Active)
        .await;

    let group = node
        .service
        .get_scaling_group(&created.group_id)
        .await
        .unwrap();
    assert_eq!(group.state().unwrap(), ScalingGroupState::Stable);
    let remote_group_id = group.remote_group_id.clone().unwrap();

    let reconciler = Reconciler::new(
        node.persistence.clone(),
        node.access.clone(),
        ReconcilerConfig::default(),
    );
    let outcome = reconciler.reconcile_group(&created.group_id).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Decided(ScalingDecision::ScaleOut {
            current: 0,
            count: 3
        })
    );
    assert_eq!(node.cloud.live_instances(&remote_group_id).await, 3);

    // Converged: a second pass changes nothing
    let outcome = reconciler.reconcile_group(&created.group_id).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Decided(ScalingDecision::None { current: 3 })
    );

    let deleted = node.service.delete_fleet(&created.fleet_id).await.unwrap();
    node.wait_for_fleet(&created.fleet_id, FleetState::Deleted)
        .await;

    let group = node
        .persistence
        .get_scaling_group(&created.group_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.state().unwrap(), ScalingGroupState::Deleted);
    assert!(!group.visible);
    assert!(node.service.get_scaling_group(&created.group_id).await.is_err());

    assert_eq!(node.cloud.live_instances(&remote_group_id).await, 0);
    assert_eq!(node.cloud.resource_counts().await, ResourceCounts::default());

    let workflow = node
        .service
        .workflow_status(&deleted.workflow_id)
        .await
        .unwrap();
    assert_eq!(workflow.state().unwrap(), WorkflowState::Finished);
    assert!(node.service.list_fleets().await.unwrap().is_empty());
    assert_eq!(
        node.service
            .list_workflows(&created.fleet_id)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_failed_creation_rolls_back_and_surfaces_error() {
    let node = TestNode::new("node-a").await;
    node.cloud
        .fail_next(
            "create_group",
            CloudError::Rejected("instance limit exceeded".into()),
        )
        .await;

    let created = node
        .service
        .create_fleet(fleet_request(0, 5, 1))
        .await
        .unwrap();
    let fleet = node
        .wait_for_fleet(&created.fleet_id, FleetState::Error)
        .await;

    assert!(
        fleet
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("instance limit exceeded"))
    );
    let workflow = node
        .service
        .workflow_status(&created.workflow_id)
        .await
        .unwrap();
    assert_eq!(workflow.state().unwrap(), WorkflowState::RolledBack);

    // Network created before the failure was rolled back
    assert_eq!(node.cloud.resource_counts().await, ResourceCounts::default());

    // The internal error state hides the group from callers
    assert!(node.service.get_scaling_group(&created.group_id).await.is_err());

    // An errored fleet can still be deleted
    node.service.delete_fleet(&created.fleet_id).await.unwrap();
    node.wait_for_fleet(&created.fleet_id, FleetState::Deleted)
        .await;
}

#[tokio::test]
async fn test_resource_of_failed_step_is_rolled_back() {
    // Subnets never become active within the wait budget
    let node = TestNode::with_cloud("node-a", MockCloud::with_ready_after(10_000)).await;

    let created = node
        .service
        .create_fleet(fleet_request(0, 5, 1))
        .await
        .unwrap();
    let fleet = node
        .wait_for_fleet(&created.fleet_id, FleetState::Error)
        .await;
    assert!(fleet.last_error.as_deref().is_some_and(|e| e.contains("timed out")));

    let workflow = node
        .service
        .workflow_status(&created.workflow_id)
        .await
        .unwrap();
    assert_eq!(workflow.state().unwrap(), WorkflowState::RolledBack);
    assert_eq!(workflow.step_index, 0);

    // The pending subnet went first, so the vpc could follow
    assert_eq!(node.cloud.resource_counts().await, ResourceCounts::default());
    assert_eq!(node.cloud.calls("delete_subnet").await, 1);
}

#[tokio::test]
async fn test_group_update_validation_and_lock() {
    let node = TestNode::new("node-a").await;
    let created = node
        .service
        .create_fleet(fleet_request(1, 4, 2))
        .await
        .unwrap();
    node.wait_for_fleet(&created.fleet_id, FleetState::Active)
        .await;

    let err = node
        .service
        .update_scaling_group(
            &created.group_id,
            Capacity {
                min_size: 1,
                max_size: 4,
                desired_size: 9,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    // Another change holds the group
    assert!(
        node.persistence
            .try_transition_group(
                &created.group_id,
                ScalingGroupState::Stable,
                ScalingGroupState::Scaling,
            )
            .await
            .unwrap()
    );
    let err = node
        .service
        .update_scaling_group(
            &created.group_id,
            Capacity {
                min_size: 1,
                max_size: 6,
                desired_size: 5,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "LOCKED");

    node.persistence
        .try_transition_group(
            &created.group_id,
            ScalingGroupState::Scaling,
            ScalingGroupState::Stable,
        )
        .await
        .unwrap();
    let group = node
        .service
        .update_scaling_group(
            &created.group_id,
            Capacity {
                min_size: 1,
                max_size: 6,
                desired_size: 5,
            },
        )
        .await
        .unwrap();
    assert_eq!((group.min_size, group.max_size, group.desired_size), (1, 6, 5));
    assert_eq!(group.state().unwrap(), ScalingGroupState::Stable);

    let err = node
        .service
        .put_scaling_policy(&created.group_id, None, "cpu", 0.5)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    let policy = node
        .service
        .put_scaling_policy(&created.group_id, None, "session_utilization", 0.7)
        .await
        .unwrap();
    node.service
        .set_auto_scaling(&created.group_id, true)
        .await
        .unwrap();
    assert_eq!(
        node.service
            .list_scaling_policies(&created.group_id)
            .await
            .unwrap()
            .len(),
        1
    );
    node.service
        .delete_scaling_policy(&created.group_id, &policy.policy_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_releases_abandoned_scaling_lock() {
    let node = TestNode::new("node-a").await;
    let created = node
        .service
        .create_fleet(fleet_request(0, 4, 0))
        .await
        .unwrap();
    node.wait_for_fleet(&created.fleet_id, FleetState::Active)
        .await;

    // Locked by a reconciler that never came back
    assert!(
        node.persistence
            .try_transition_group(
                &created.group_id,
                ScalingGroupState::Stable,
                ScalingGroupState::Scaling,
            )
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    node.service.delete_fleet(&created.fleet_id).await.unwrap();
    node.wait_for_fleet(&created.fleet_id, FleetState::Deleted)
        .await;
    let group = node
        .persistence
        .get_scaling_group(&created.group_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.state().unwrap(), ScalingGroupState::Deleted);
}

#[tokio::test]
async fn test_delete_requires_settled_fleet() {
    let node = TestNode::new("node-a").await;
    let err = node.service.delete_fleet("missing").await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");

    let err = node
        .service
        .create_fleet(fleet_request(3, 2, 2))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}
