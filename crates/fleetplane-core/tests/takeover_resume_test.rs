// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for takeover followed by pipeline resumption.
//!
//! Two simulated work nodes share one database. Node A starts a workflow and
//! stops heartbeating mid-pipeline; node B detects it, takes the workflow
//! over and finishes it from the last checkpoint.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::*;
use fleetplane_core::state::WorkflowState;
use fleetplane_core::{
    ExecutionContext, NodeRegistry, Pipeline, PipelineEngine, Step, WorkflowOutcome,
};

const STALE: Duration = Duration::from_secs(60);

fn provisioning(infra: &FakeInfra) -> Pipeline {
    Pipeline::new("create-fleet")
        .step(EnsureResource {
            name: "vpc",
            infra: infra.clone(),
        })
        .step(EnsureResource {
            name: "subnet",
            infra: infra.clone(),
        })
        .step(EnsureResource {
            name: "group",
            infra: infra.clone(),
        })
}

#[tokio::test]
async fn test_survivor_resumes_from_last_checkpoint() {
    let persistence = persistence().await;
    let infra = FakeInfra::default();

    register_stale_node(&persistence, "node-a").await;
    create_workflow(&persistence, "wf-1", "node-a").await;

    // Node A got through the first step and crashed after the vpc checkpoint,
    // and also created the subnet without checkpointing it.
    persistence
        .try_transition_workflow("wf-1", "node-a", WorkflowState::Create, WorkflowState::Running, None)
        .await
        .unwrap();
    let ctx = ExecutionContext::new()
        .with("region", "eu-west-1")
        .with("vpc_id", "vpc");
    persistence
        .checkpoint_workflow(
            "wf-1",
            "node-a",
            WorkflowState::Running,
            0,
            1,
            &ctx.to_bytes().unwrap(),
            Utc::now(),
        )
        .await
        .unwrap();
    for name in ["vpc", "subnet"] {
        let step = EnsureResource {
            name,
            infra: infra.clone(),
        };
        step.execute(&ExecutionContext::new()).await.unwrap();
    }
    assert_eq!(infra.create_calls(), 2);

    let node_b = NodeRegistry::new(persistence.clone(), "node-b");
    node_b.register().await.unwrap();
    let report = node_b.sweep(STALE).await.unwrap();
    assert_eq!(report.reassigned, 1);

    let resumable = node_b.resumable_workflows().await.unwrap();
    assert_eq!(resumable.len(), 1);

    let engine = PipelineEngine::new(persistence.clone(), "node-b");
    let outcome = engine
        .run(&resumable[0].workflow_id, &provisioning(&infra))
        .await
        .unwrap();

    let WorkflowOutcome::Finished(ctx) = outcome else {
        panic!("expected finished, got {outcome:?}");
    };
    assert_eq!(ctx.get_str("group_id"), Some("group"));
    // The subnet step re-ran but found its own prior effect
    assert_eq!(infra.resources(), vec!["vpc", "subnet", "group"]);
    assert_eq!(infra.create_calls(), 3);
}

#[tokio::test]
async fn test_old_owner_is_fenced_after_takeover() {
    let persistence = persistence().await;
    let infra = FakeInfra::default();

    register_stale_node(&persistence, "node-a").await;
    create_workflow(&persistence, "wf-1", "node-a").await;

    let node_b = NodeRegistry::new(persistence.clone(), "node-b");
    node_b.register().await.unwrap();
    node_b.sweep(STALE).await.unwrap();

    // Node A was only slow; it comes back and tries to run its workflow
    let stale_engine = PipelineEngine::new(persistence.clone(), "node-a");
    let outcome = stale_engine
        .run("wf-1", &provisioning(&infra))
        .await
        .unwrap();

    assert_eq!(outcome, WorkflowOutcome::OwnershipLost);
    assert!(infra.resources().is_empty());

    let record = persistence.get_workflow("wf-1").await.unwrap().unwrap();
    assert_eq!(record.owner_node_id, "node-b");
    assert_eq!(record.state().unwrap(), WorkflowState::Create);
}

#[tokio::test]
async fn test_takeover_preserves_workflow_count() {
    let persistence = persistence().await;
    register_stale_node(&persistence, "node-a").await;
    for i in 0..5 {
        create_workflow(&persistence, &format!("wf-{i}"), "node-a").await;
    }
    create_workflow(&persistence, "unrelated", "node-c").await;

    let node_b = NodeRegistry::new(persistence.clone(), "node-b");
    node_b.register().await.unwrap();
    node_b.sweep(STALE).await.unwrap();

    assert!(
        persistence
            .list_workflows_by_owner("node-a")
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        persistence
            .list_workflows_by_owner("node-b")
            .await
            .unwrap()
            .len(),
        5
    );
    assert_eq!(
        persistence
            .list_workflows_by_owner("node-c")
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_failed_pipeline_rolls_back_after_resume() {
    let persistence = persistence().await;
    let infra = FakeInfra::default();
    register_stale_node(&persistence, "node-a").await;
    create_workflow(&persistence, "wf-1", "node-a").await;

    let node_b = NodeRegistry::new(persistence.clone(), "node-b");
    node_b.register().await.unwrap();
    node_b.sweep(STALE).await.unwrap();

    let pipeline = Pipeline::new("create-fleet")
        .step(EnsureResource {
            name: "vpc",
            infra: infra.clone(),
        })
        .step(AlwaysFails);

    let outcome = PipelineEngine::new(persistence.clone(), "node-b")
        .run("wf-1", &pipeline)
        .await
        .unwrap();

    assert!(matches!(outcome, WorkflowOutcome::RolledBack { .. }));
    assert!(infra.resources().is_empty());
    let record = persistence.get_workflow("wf-1").await.unwrap().unwrap();
    assert_eq!(record.state().unwrap(), WorkflowState::RolledBack);
    assert!(
        record
            .last_error
            .unwrap()
            .contains("instance limit exceeded")
    );
}

#[tokio::test]
async fn test_crash_after_step_failure_is_resumed() {
    let persistence = persistence().await;
    let infra = FakeInfra::default();
    register_stale_node(&persistence, "node-a").await;
    create_workflow(&persistence, "wf-1", "node-a").await;

    // Node A created the vpc, then the subnet step created its subnet and
    // failed. Node A recorded the failure and died before undoing anything.
    persistence
        .try_transition_workflow("wf-1", "node-a", WorkflowState::Create, WorkflowState::Running, None)
        .await
        .unwrap();
    let ctx = ExecutionContext::new()
        .with("region", "eu-west-1")
        .with("vpc_id", "vpc");
    persistence
        .checkpoint_workflow(
            "wf-1",
            "node-a",
            WorkflowState::Running,
            0,
            1,
            &ctx.to_bytes().unwrap(),
            Utc::now(),
        )
        .await
        .unwrap();
    for name in ["vpc", "subnet"] {
        let step = EnsureResource {
            name,
            infra: infra.clone(),
        };
        step.execute(&ExecutionContext::new()).await.unwrap();
    }
    assert!(
        persistence
            .begin_workflow_rollback("wf-1", "node-a", 1, 2, "step 'subnet' failed", Utc::now())
            .await
            .unwrap()
    );

    let node_b = NodeRegistry::new(persistence.clone(), "node-b");
    node_b.register().await.unwrap();
    node_b.sweep(STALE).await.unwrap();

    let resumable = node_b.resumable_workflows().await.unwrap();
    assert_eq!(resumable.len(), 1);
    assert_eq!(resumable[0].state().unwrap(), WorkflowState::RollingBack);

    let outcome = PipelineEngine::new(persistence.clone(), "node-b")
        .run("wf-1", &provisioning(&infra))
        .await
        .unwrap();

    let WorkflowOutcome::RolledBack { error } = outcome else {
        panic!("expected rolled back, got {outcome:?}");
    };
    assert!(error.contains("subnet"));
    assert!(infra.resources().is_empty());
}
