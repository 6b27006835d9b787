// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the scaling group reconciler.
//!
//! Covers the bounded decision retry when the remote group keeps changing,
//! recovery after a few expirations, group lock contention and expiry, the
//! shared cool-down and target tracking on session utilization.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use fleetplane_core::persistence::ProcessRecord;
use fleetplane_core::state::{FleetState, ScalingGroupState};
use fleetplane_environment::error::Error;
use fleetplane_environment::reconciler::{
    ReconcileOutcome, Reconciler, ReconcilerConfig, ScalingDecision,
};
use fleetplane_environment::service::{Capacity, FleetOperation};

async fn active_fleet(node: &TestNode, desired: i32) -> (FleetOperation, String) {
    let created = node
        .service
        .create_fleet(fleet_request(0, 10, desired))
        .await
        .unwrap();
    node.wait_for_fleet(&created.fleet_id, FleetState::Active)
        .await;
    let remote = node
        .persistence
        .get_scaling_group(&created.group_id)
        .await
        .unwrap()
        .unwrap()
        .remote_group_id
        .unwrap();
    (created, remote)
}

fn reconciler(node: &TestNode) -> Reconciler {
    Reconciler::new(
        node.persistence.clone(),
        node.access.clone(),
        ReconcilerConfig::default(),
    )
}

#[tokio::test]
async fn test_decision_retried_exactly_three_times_then_group_errors() {
    let node = TestNode::new("node-a").await;
    let (created, remote) = active_fleet(&node, 2).await;
    node.cloud.always_expire().await;

    let err = reconciler(&node)
        .reconcile_group(&created.group_id)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::DecisionRetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(err.error_code(), "DECISION_EXPIRED");
    assert_eq!(node.cloud.calls("scale_out").await, 3);
    assert_eq!(node.cloud.live_instances(&remote).await, 0);

    let group = node
        .persistence
        .get_scaling_group(&created.group_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.state().unwrap(), ScalingGroupState::Error);
}

#[tokio::test]
async fn test_decision_recovers_after_expirations() {
    let node = TestNode::new("node-a").await;
    let (created, remote) = active_fleet(&node, 2).await;
    node.cloud.expire_next(2).await;

    let outcome = reconciler(&node)
        .reconcile_group(&created.group_id)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Decided(ScalingDecision::ScaleOut {
            current: 0,
            count: 2
        })
    );
    assert_eq!(node.cloud.calls("scale_out").await, 3);
    assert_eq!(node.cloud.live_instances(&remote).await, 2);

    let group = node
        .service
        .get_scaling_group(&created.group_id)
        .await
        .unwrap();
    assert_eq!(group.state().unwrap(), ScalingGroupState::Stable);
}

#[tokio::test]
async fn test_locked_group_is_skipped_not_queued() {
    let node = TestNode::new("node-a").await;
    let (created, _) = active_fleet(&node, 2).await;

    // Held by a concurrent change
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

    let outcome = reconciler(&node)
        .reconcile_group(&created.group_id)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Skipped);
    assert_eq!(node.cloud.calls("scale_out").await, 0);

    let changed = reconciler(&node).reconcile_all().await.unwrap();
    assert_eq!(changed, 0);
}

#[tokio::test]
async fn test_concurrent_reconcilers_only_one_wins() {
    let node = TestNode::new("node-a").await;
    let (created, remote) = active_fleet(&node, 3).await;
    let peer = node.peer("node-b").await;

    let reconciler_a = reconciler(&node);
    let reconciler_b = reconciler(&peer);
    let (a, b) = tokio::join!(
        reconciler_a.reconcile_group(&created.group_id),
        reconciler_b.reconcile_group(&created.group_id),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let decided = outcomes
        .iter()
        .filter(|o| matches!(o, ReconcileOutcome::Decided(ScalingDecision::ScaleOut { .. })))
        .count();
    assert_eq!(decided, 1);
    assert_eq!(node.cloud.live_instances(&remote).await, 3);
}

#[tokio::test]
async fn test_target_tracking_follows_session_load() {
    let node = TestNode::new("node-a").await;
    let (created, remote) = active_fleet(&node, 2).await;
    let reconciler = reconciler(&node);
    reconciler.reconcile_group(&created.group_id).await.unwrap();
    assert_eq!(node.cloud.live_instances(&remote).await, 2);

    // Two processes at 90% load against a 50% target
    for id in ["p1", "p2"] {
        node.persistence
            .register_process(&ProcessRecord {
                process_id: id.into(),
                fleet_id: created.fleet_id.clone(),
                instance_id: format!("i-{id}"),
                address: format!("{id}:7777"),
                state: "active".into(),
                max_sessions: 10,
                current_sessions: 9,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    node.service
        .put_scaling_policy(&created.group_id, None, "session_utilization", 0.5)
        .await
        .unwrap();
    node.service
        .set_auto_scaling(&created.group_id, true)
        .await
        .unwrap();

    let outcome = reconciler.reconcile_group(&created.group_id).await.unwrap();

    // ceil(2 * 0.9 / 0.5) = 4
    assert_eq!(
        outcome,
        ReconcileOutcome::Decided(ScalingDecision::ScaleOut {
            current: 2,
            count: 2
        })
    );
    assert_eq!(node.cloud.live_instances(&remote).await, 4);
}

#[tokio::test]
async fn test_abandoned_lock_is_released_and_group_reconciled() {
    let node = TestNode::new("node-a").await;
    let (created, remote) = active_fleet(&node, 2).await;

    // A peer locked the group and died mid-decision
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
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reconciler = Reconciler::new(
        node.persistence.clone(),
        node.access.clone(),
        ReconcilerConfig {
            lock_timeout: Duration::from_millis(50),
            ..ReconcilerConfig::default()
        },
    );
    let changed = reconciler.reconcile_all().await.unwrap();

    assert_eq!(changed, 1);
    assert_eq!(node.cloud.live_instances(&remote).await, 2);
    let group = node
        .service
        .get_scaling_group(&created.group_id)
        .await
        .unwrap();
    assert_eq!(group.state().unwrap(), ScalingGroupState::Stable);
}

#[tokio::test]
async fn test_fresh_lock_survives_release_pass() {
    let node = TestNode::new("node-a").await;
    let (created, _) = active_fleet(&node, 2).await;
    node.persistence
        .try_transition_group(
            &created.group_id,
            ScalingGroupState::Stable,
            ScalingGroupState::Scaling,
        )
        .await
        .unwrap();

    assert_eq!(reconciler(&node).release_stale_locks().await.unwrap(), 0);
    let group = node
        .persistence
        .get_scaling_group(&created.group_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group.state().unwrap(), ScalingGroupState::Scaling);
}

#[tokio::test]
async fn test_cool_down_is_shared_between_nodes() {
    let node = TestNode::new("node-a").await;
    let mut request = fleet_request(0, 10, 2);
    request.cool_down_secs = 600;
    let created = node.service.create_fleet(request).await.unwrap();
    node.wait_for_fleet(&created.fleet_id, FleetState::Active)
        .await;

    let outcome = reconciler(&node)
        .reconcile_group(&created.group_id)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ReconcileOutcome::Decided(ScalingDecision::ScaleOut { count: 2, .. })
    ));
    let group = node
        .service
        .update_scaling_group(
            &created.group_id,
            Capacity {
                min_size: 0,
                max_size: 10,
                desired_size: 4,
            },
        )
        .await
        .unwrap();
    assert!(group.last_scaled_at.is_some());

    // A different node, with its own reconciler, still waits
    let peer = node.peer("node-b").await;
    let outcome = reconciler(&peer)
        .reconcile_group(&created.group_id)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Skipped);
    assert_eq!(node.cloud.calls("scale_out").await, 1);
}
