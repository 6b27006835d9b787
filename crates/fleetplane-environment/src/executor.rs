// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runs workflows owned by this node and finalizes the resources they act on.
//!
//! Each workflow executes in its own tokio task. A workflow already in
//! flight on this node is never started a second time, so the node monitor
//! can hand over everything it owns on every cycle without duplicating work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleetplane_core::persistence::{Persistence, WorkflowRecord};
use fleetplane_core::state::{FleetState, ScalingGroupState, TaskType};
use fleetplane_core::{CoreError, PipelineEngine, WorkflowOutcome};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::workflows::{CreateFleetParams, DeleteFleetParams, PipelineFactory};

/// Spawns and resumes workflow executions.
#[derive(Clone)]
pub struct WorkflowExecutor {
    persistence: Arc<dyn Persistence>,
    engine: Arc<PipelineEngine>,
    factory: Arc<PipelineFactory>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl WorkflowExecutor {
    /// Create an executor acting as `node_id`.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        factory: Arc<PipelineFactory>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            engine: Arc::new(PipelineEngine::new(persistence.clone(), node_id)),
            persistence,
            factory,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The node this executor runs as.
    pub fn node_id(&self) -> &str {
        self.engine.node_id()
    }

    /// Start a workflow in the background. Returns false if it is already running here.
    pub async fn spawn(&self, workflow_id: &str) -> bool {
        if !self.in_flight.lock().await.insert(workflow_id.to_string()) {
            debug!(workflow_id, "Workflow already in flight");
            return false;
        }

        let executor = self.clone();
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = executor.execute(&workflow_id).await {
                error!(workflow_id = %workflow_id, error = %e, "Workflow execution failed");
            }
            executor.in_flight.lock().await.remove(&workflow_id);
        });
        true
    }

    /// Spawn every resumable workflow this node owns, plus terminal ones
    /// whose outcome never reached their fleet. Returns how many were started.
    pub async fn resume_owned(&self) -> Result<usize> {
        let owned = self
            .persistence
            .list_workflows_by_owner(self.node_id())
            .await?;

        let mut started = 0;
        for record in owned {
            let wanted = record.state()?.is_resumable() || self.awaits_finalize(&record).await?;
            if wanted && self.spawn(&record.workflow_id).await {
                started += 1;
            }
        }
        if started > 0 {
            info!(node_id = %self.node_id(), started, "Resumed owned workflows");
        }
        Ok(started)
    }

    /// Run a workflow to the end in the current task and finalize its resource.
    pub async fn execute(&self, workflow_id: &str) -> Result<WorkflowOutcome> {
        let record = self
            .persistence
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workflow", workflow_id))?;

        let pipeline = self.factory.build(&record).await?;
        let outcome = self.engine.run(workflow_id, &pipeline).await?;

        match &outcome {
            WorkflowOutcome::Finished(_) => info!(workflow_id, "Workflow finished"),
            WorkflowOutcome::RolledBack { error } => {
                warn!(workflow_id, error = %error, "Workflow rolled back")
            }
            WorkflowOutcome::Failed { error } => {
                error!(workflow_id, error = %error, "Workflow failed during rollback")
            }
            WorkflowOutcome::OwnershipLost => {
                warn!(workflow_id, node_id = %self.node_id(), "Workflow taken over by another node");
                return Ok(outcome);
            }
        }

        self.finalize(&record, &outcome).await?;
        Ok(outcome)
    }

    /// Number of workflows currently executing on this node.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Wait until nothing is executing, or `timeout` passes. Returns true if idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.in_flight().await > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// A terminal workflow whose fleet still shows it in progress: the owner
    /// died between the last workflow write and `finalize`.
    async fn awaits_finalize(&self, record: &WorkflowRecord) -> Result<bool> {
        let pending = match record.task_type()? {
            TaskType::CreateFleet => FleetState::Creating,
            TaskType::DeleteFleet => FleetState::Deleting,
            TaskType::BuildImage => return Ok(false),
        };
        let Some(fleet) = self.persistence.get_fleet(&record.resource_id).await? else {
            return Ok(false);
        };
        if fleet.state()? != pending {
            return Ok(false);
        }

        // A later workflow on the same fleet owns its state now
        let latest = self
            .persistence
            .list_workflows_for_resource(&record.resource_id)
            .await?
            .into_iter()
            .last();
        let unfinalized = latest.is_some_and(|w| w.workflow_id == record.workflow_id);
        if unfinalized {
            info!(
                workflow_id = %record.workflow_id,
                fleet_id = %record.resource_id,
                "Finalizing workflow left behind by a crash"
            );
        }
        Ok(unfinalized)
    }

    /// Reflect the outcome on the fleet (and group) the workflow acted on.
    async fn finalize(&self, record: &WorkflowRecord, outcome: &WorkflowOutcome) -> Result<()> {
        let failure = match outcome {
            WorkflowOutcome::Finished(_) => None,
            WorkflowOutcome::RolledBack { error } | WorkflowOutcome::Failed { error } => {
                Some(error.as_str())
            }
            WorkflowOutcome::OwnershipLost => return Ok(()),
        };

        match record.task_type()? {
            TaskType::CreateFleet => {
                let params: CreateFleetParams = record.params()?;
                match failure {
                    None => {
                        self.fleet_transition(
                            &params.fleet_id,
                            FleetState::Creating,
                            FleetState::Active,
                            None,
                        )
                        .await?
                    }
                    Some(error) => {
                        self.persistence
                            .try_transition_group(
                                &params.group_id,
                                ScalingGroupState::Creating,
                                ScalingGroupState::Error,
                            )
                            .await?;
                        self.fleet_transition(
                            &params.fleet_id,
                            FleetState::Creating,
                            FleetState::Error,
                            Some(error),
                        )
                        .await?
                    }
                }
            }
            TaskType::DeleteFleet => {
                let params: DeleteFleetParams = record.params()?;
                match failure {
                    None => {
                        self.fleet_transition(
                            &params.fleet_id,
                            FleetState::Deleting,
                            FleetState::Deleted,
                            None,
                        )
                        .await?
                    }
                    Some(error) => {
                        self.fleet_transition(
                            &params.fleet_id,
                            FleetState::Deleting,
                            FleetState::Error,
                            Some(error),
                        )
                        .await?
                    }
                }
            }
            TaskType::BuildImage => {}
        }
        Ok(())
    }

    async fn fleet_transition(
        &self,
        fleet_id: &str,
        from: FleetState,
        to: FleetState,
        error: Option<&str>,
    ) -> Result<()> {
        if self
            .persistence
            .try_transition_fleet(fleet_id, from, to, error)
            .await?
        {
            info!(fleet_id, from = %from, to = %to, "Fleet state changed");
        } else {
            warn!(fleet_id, from = %from, to = %to, "Fleet was not in the expected state");
        }
        Ok(())
    }
}
