// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Produced control-plane API.
//!
//! Thin transport layers (HTTP controllers, CLIs) call into [`FleetService`]
//! and map its errors to responses via [`Error::error_code`].
//!
//! Scaling group changes take the group lock (`stable -> scaling`) for the
//! duration of the write. A caller that loses that race gets `LOCKED` and
//! must retry; requests are never queued behind each other.
//!
//! [`Error::error_code`]: crate::error::Error::error_code

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetplane_core::persistence::{
    FleetRecord, NewWorkflow, Persistence, ProcessRecord, ScalingGroupRecord,
    ScalingPolicyRecord, SessionRecord, WorkflowRecord,
};
use fleetplane_core::state::{FleetState, ProcessState, ScalingGroupState, SessionState, TaskType};
use fleetplane_core::{CoreError, ExecutionContext};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::executor::WorkflowExecutor;
use crate::reconciler::SESSION_UTILIZATION;
use crate::steps::keys;
use crate::workflows::{BuildImageParams, CreateFleetParams, DeleteFleetParams, TenantScope};

/// Default scaling group cool-down.
pub const DEFAULT_COOL_DOWN_SECS: i64 = 300;

/// Request to create a fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFleetRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Delegated role exchanged for cloud credentials.
    pub role_id: String,
    /// Human-readable name.
    pub name: String,
    /// Cloud region.
    pub region: String,
    /// Image instances boot from.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Instance bounds.
    pub capacity: Capacity,
    /// Minimum seconds between two scaling actions.
    #[serde(default = "default_cool_down")]
    pub cool_down_secs: i64,
}

fn default_cool_down() -> i64 {
    DEFAULT_COOL_DOWN_SECS
}

/// Instance count bounds of a scaling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Lower bound.
    pub min_size: i32,
    /// Upper bound.
    pub max_size: i32,
    /// Wanted count when not auto-scaling.
    pub desired_size: i32,
}

impl Capacity {
    /// Check `0 <= min <= desired <= max`.
    pub fn validate(&self) -> std::result::Result<(), CoreError> {
        if self.min_size < 0 {
            return Err(CoreError::validation("min_size", "must not be negative"));
        }
        if self.max_size < self.min_size {
            return Err(CoreError::validation("max_size", "must be at least min_size"));
        }
        if self.desired_size < self.min_size || self.desired_size > self.max_size {
            return Err(CoreError::validation(
                "desired_size",
                format!(
                    "must be within [{}, {}]",
                    self.min_size, self.max_size
                ),
            ));
        }
        Ok(())
    }
}

/// Handle to a started fleet workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetOperation {
    /// Fleet acted on.
    pub fleet_id: String,
    /// Its scaling group.
    pub group_id: String,
    /// Workflow doing the work.
    pub workflow_id: String,
}

/// Request to build a machine image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildImageRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Delegated role exchanged for cloud credentials.
    pub role_id: String,
    /// Cloud region.
    pub region: String,
    /// Name of the image to produce.
    pub image_name: String,
    /// Image the builder boots from.
    pub base_image_id: String,
    /// Builder instance type.
    pub instance_type: String,
}

/// Request to register a server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterProcessRequest {
    /// Fleet the process runs in.
    pub fleet_id: String,
    /// Instance the process runs on.
    pub instance_id: String,
    /// Address used to reach the process.
    pub address: String,
    /// Session capacity.
    pub max_sessions: i32,
}

/// The produced fleet, scaling group and session API.
#[derive(Clone)]
pub struct FleetService {
    persistence: Arc<dyn Persistence>,
    executor: WorkflowExecutor,
    placement_timeout: Duration,
}

impl FleetService {
    /// Create the service. Workflows it starts are owned by the executor's node.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        executor: WorkflowExecutor,
        placement_timeout: Duration,
    ) -> Self {
        Self {
            persistence,
            executor,
            placement_timeout,
        }
    }

    // ------------------------------------------------------------------
    // Fleets
    // ------------------------------------------------------------------

    /// Persist a fleet and its scaling group, and start provisioning them.
    pub async fn create_fleet(&self, request: CreateFleetRequest) -> Result<FleetOperation> {
        for (field, value) in [
            ("tenant_id", &request.tenant_id),
            ("role_id", &request.role_id),
            ("name", &request.name),
            ("region", &request.region),
            ("image_id", &request.image_id),
            ("instance_type", &request.instance_type),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::validation(field, "must not be empty").into());
            }
        }
        request.capacity.validate()?;
        if request.cool_down_secs < 0 {
            return Err(CoreError::validation("cool_down_secs", "must not be negative").into());
        }

        let now = Utc::now();
        let fleet_id = uuid::Uuid::new_v4().to_string();
        let group_id = uuid::Uuid::new_v4().to_string();

        self.persistence
            .create_fleet(&FleetRecord {
                fleet_id: fleet_id.clone(),
                tenant_id: request.tenant_id.clone(),
                role_id: request.role_id.clone(),
                name: request.name.clone(),
                region: request.region.clone(),
                image_id: request.image_id.clone(),
                instance_type: request.instance_type.clone(),
                state: FleetState::Creating.as_str().to_string(),
                last_error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        self.persistence
            .create_scaling_group(&ScalingGroupRecord {
                group_id: group_id.clone(),
                fleet_id: fleet_id.clone(),
                region: request.region.clone(),
                remote_group_id: None,
                min_size: request.capacity.min_size,
                max_size: request.capacity.max_size,
                desired_size: request.capacity.desired_size,
                state: ScalingGroupState::Creating.as_str().to_string(),
                cool_down_secs: request.cool_down_secs,
                enable_auto_scaling: false,
                visible: true,
                last_scaled_at: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let params = CreateFleetParams {
            fleet_id: fleet_id.clone(),
            group_id: group_id.clone(),
            image_id: request.image_id,
            instance_type: request.instance_type,
            scope: TenantScope {
                tenant_id: request.tenant_id,
                role_id: request.role_id,
                region: request.region,
            },
        };
        let workflow_id = self
            .start_workflow(&fleet_id, TaskType::CreateFleet, &params, &params.scope)
            .await?;

        info!(fleet_id = %fleet_id, group_id = %group_id, workflow_id = %workflow_id, "Fleet creation started");
        Ok(FleetOperation {
            fleet_id,
            group_id,
            workflow_id,
        })
    }

    /// Start tearing a fleet down. Allowed from `active` and `error`.
    pub async fn delete_fleet(&self, fleet_id: &str) -> Result<FleetOperation> {
        let fleet = self.fleet(fleet_id).await?;
        let group = self
            .persistence
            .get_scaling_group_by_fleet(fleet_id)
            .await?
            .ok_or_else(|| CoreError::not_found("scaling group", fleet_id))?;

        let mut moved = false;
        for from in [FleetState::Active, FleetState::Error] {
            if self
                .persistence
                .try_transition_fleet(fleet_id, from, FleetState::Deleting, None)
                .await?
            {
                moved = true;
                break;
            }
        }
        if !moved {
            let actual = self.fleet(fleet_id).await?.state;
            return Err(CoreError::InvalidState {
                kind: "fleet",
                id: fleet_id.to_string(),
                expected: "active or error".to_string(),
                actual,
            }
            .into());
        }

        let params = DeleteFleetParams {
            fleet_id: fleet_id.to_string(),
            group_id: group.group_id.clone(),
            scope: TenantScope {
                tenant_id: fleet.tenant_id,
                role_id: fleet.role_id,
                region: fleet.region,
            },
        };
        let workflow_id = self
            .start_workflow(fleet_id, TaskType::DeleteFleet, &params, &params.scope)
            .await?;

        info!(fleet_id, workflow_id = %workflow_id, "Fleet deletion started");
        Ok(FleetOperation {
            fleet_id: fleet_id.to_string(),
            group_id: group.group_id,
            workflow_id,
        })
    }

    /// Get a fleet.
    pub async fn get_fleet(&self, fleet_id: &str) -> Result<FleetRecord> {
        self.fleet(fleet_id).await
    }

    /// Fleets that have not been deleted.
    pub async fn list_fleets(&self) -> Result<Vec<FleetRecord>> {
        Ok(self.persistence.list_fleets(false).await?)
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    /// Start building a machine image. Returns the workflow id.
    pub async fn build_image(&self, request: BuildImageRequest) -> Result<String> {
        if request.image_name.trim().is_empty() {
            return Err(CoreError::validation("image_name", "must not be empty").into());
        }
        let params = BuildImageParams {
            image_name: request.image_name.clone(),
            base_image_id: request.base_image_id,
            instance_type: request.instance_type,
            scope: TenantScope {
                tenant_id: request.tenant_id,
                role_id: request.role_id,
                region: request.region,
            },
        };
        let workflow_id = self
            .start_workflow(&request.image_name, TaskType::BuildImage, &params, &params.scope)
            .await?;
        info!(image_name = %request.image_name, workflow_id = %workflow_id, "Image build started");
        Ok(workflow_id)
    }

    /// Current status of a workflow.
    pub async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowRecord> {
        Ok(self
            .persistence
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workflow", workflow_id))?)
    }

    /// Workflows that acted on a resource, oldest first.
    pub async fn list_workflows(&self, resource_id: &str) -> Result<Vec<WorkflowRecord>> {
        Ok(self
            .persistence
            .list_workflows_for_resource(resource_id)
            .await?)
    }

    async fn start_workflow<P: Serialize>(
        &self,
        resource_id: &str,
        task_type: TaskType,
        params: &P,
        scope: &TenantScope,
    ) -> Result<String> {
        let workflow_id = uuid::Uuid::new_v4().to_string();
        self.persistence
            .create_workflow(
                &NewWorkflow {
                    workflow_id: workflow_id.clone(),
                    resource_id: resource_id.to_string(),
                    task_type,
                    params: serde_json::to_vec(params)?,
                    context: ExecutionContext::new().with(keys::REGION, scope.region.as_str()),
                    owner_node_id: self.executor.node_id().to_string(),
                },
                Utc::now(),
            )
            .await?;
        self.executor.spawn(&workflow_id).await;
        Ok(workflow_id)
    }

    // ------------------------------------------------------------------
    // Scaling groups
    // ------------------------------------------------------------------

    /// Get a scaling group. Internal states and soft-deleted groups are hidden.
    pub async fn get_scaling_group(&self, group_id: &str) -> Result<ScalingGroupRecord> {
        let group = self
            .persistence
            .get_scaling_group(group_id)
            .await?
            .filter(|g| g.visible)
            .ok_or_else(|| CoreError::not_found("scaling group", group_id))?;
        if group.state()?.is_internal() {
            return Err(CoreError::not_found("scaling group", group_id).into());
        }
        Ok(group)
    }

    /// Change a group's bounds.
    pub async fn update_scaling_group(
        &self,
        group_id: &str,
        capacity: Capacity,
    ) -> Result<ScalingGroupRecord> {
        capacity.validate()?;
        self.lock_group(group_id).await?;
        let written = self
            .persistence
            .update_group_capacity(
                group_id,
                capacity.min_size,
                capacity.max_size,
                capacity.desired_size,
            )
            .await;
        self.unlock_group(group_id).await?;

        if !written? {
            return Err(CoreError::locked("scaling group", group_id).into());
        }
        info!(group_id, ?capacity, "Scaling group bounds updated");
        self.get_scaling_group(group_id).await
    }

    /// Turn target tracking on or off.
    pub async fn set_auto_scaling(&self, group_id: &str, enabled: bool) -> Result<()> {
        self.lock_group(group_id).await?;
        let written = self
            .persistence
            .set_group_auto_scaling(group_id, enabled)
            .await;
        self.unlock_group(group_id).await?;

        if !written? {
            return Err(CoreError::locked("scaling group", group_id).into());
        }
        info!(group_id, enabled, "Scaling group auto-scaling changed");
        Ok(())
    }

    /// Add or replace a target tracking policy.
    pub async fn put_scaling_policy(
        &self,
        group_id: &str,
        policy_id: Option<String>,
        metric: &str,
        target_value: f64,
    ) -> Result<ScalingPolicyRecord> {
        if metric != SESSION_UTILIZATION {
            return Err(CoreError::validation(
                "metric",
                format!("unsupported metric '{metric}', expected '{SESSION_UTILIZATION}'"),
            )
            .into());
        }
        if !(target_value > 0.0 && target_value <= 1.0) {
            return Err(CoreError::validation("target_value", "must be in (0, 1]").into());
        }

        let policy = ScalingPolicyRecord {
            policy_id: policy_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            group_id: group_id.to_string(),
            metric: metric.to_string(),
            target_value,
            created_at: Utc::now(),
        };

        self.lock_group(group_id).await?;
        let written = self.persistence.put_scaling_policy(&policy).await;
        self.unlock_group(group_id).await?;
        written?;

        info!(group_id, policy_id = %policy.policy_id, target_value, "Scaling policy saved");
        Ok(policy)
    }

    /// Remove a policy from a group.
    pub async fn delete_scaling_policy(&self, group_id: &str, policy_id: &str) -> Result<()> {
        let owned = self
            .persistence
            .list_scaling_policies(group_id)
            .await?
            .iter()
            .any(|p| p.policy_id == policy_id);
        if !owned {
            return Err(CoreError::not_found("scaling policy", policy_id).into());
        }

        self.lock_group(group_id).await?;
        let deleted = self.persistence.delete_scaling_policy(policy_id).await;
        self.unlock_group(group_id).await?;

        if !deleted? {
            return Err(CoreError::not_found("scaling policy", policy_id).into());
        }
        Ok(())
    }

    /// Policies attached to a group.
    pub async fn list_scaling_policies(&self, group_id: &str) -> Result<Vec<ScalingPolicyRecord>> {
        self.get_scaling_group(group_id).await?;
        Ok(self.persistence.list_scaling_policies(group_id).await?)
    }

    async fn lock_group(&self, group_id: &str) -> Result<()> {
        // Hidden groups cannot be locked; report them as missing
        self.get_scaling_group(group_id).await?;
        if !self
            .persistence
            .try_transition_group(group_id, ScalingGroupState::Stable, ScalingGroupState::Scaling)
            .await?
        {
            return Err(CoreError::locked("scaling group", group_id).into());
        }
        Ok(())
    }

    async fn unlock_group(&self, group_id: &str) -> Result<()> {
        if !self
            .persistence
            .try_transition_group(group_id, ScalingGroupState::Scaling, ScalingGroupState::Stable)
            .await?
        {
            warn!(group_id, "Scaling group left 'scaling' while held");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Processes and sessions
    // ------------------------------------------------------------------

    /// Register a server process able to host sessions.
    pub async fn register_process(&self, request: RegisterProcessRequest) -> Result<ProcessRecord> {
        if request.max_sessions <= 0 {
            return Err(CoreError::validation("max_sessions", "must be positive").into());
        }
        self.fleet(&request.fleet_id).await?;

        let process = ProcessRecord {
            process_id: uuid::Uuid::new_v4().to_string(),
            fleet_id: request.fleet_id,
            instance_id: request.instance_id,
            address: request.address,
            state: ProcessState::Active.as_str().to_string(),
            max_sessions: request.max_sessions,
            current_sessions: 0,
            created_at: Utc::now(),
        };
        self.persistence.register_process(&process).await?;
        info!(process_id = %process.process_id, fleet_id = %process.fleet_id, "Process registered");
        Ok(process)
    }

    /// Stop routing new sessions to a process.
    pub async fn drain_process(&self, process_id: &str) -> Result<()> {
        if !self
            .persistence
            .set_process_state(process_id, ProcessState::Draining)
            .await?
        {
            return Err(CoreError::not_found("process", process_id).into());
        }
        Ok(())
    }

    /// Request a session. It stays `creating` until the dispatcher places it
    /// or the placement deadline passes.
    pub async fn create_session(&self, fleet_id: &str, max_clients: i32) -> Result<SessionRecord> {
        if max_clients <= 0 {
            return Err(CoreError::validation("max_clients", "must be positive").into());
        }
        let fleet = self.fleet(fleet_id).await?;
        if fleet.state()? != FleetState::Active {
            return Err(CoreError::InvalidState {
                kind: "fleet",
                id: fleet_id.to_string(),
                expected: FleetState::Active.as_str().to_string(),
                actual: fleet.state,
            }
            .into());
        }

        let now = Utc::now();
        let placement = chrono::Duration::from_std(self.placement_timeout)
            .map_err(|e| CoreError::validation("placement_timeout", e.to_string()))?;
        let session = SessionRecord {
            session_id: uuid::Uuid::new_v4().to_string(),
            fleet_id: fleet_id.to_string(),
            state: SessionState::Creating.as_str().to_string(),
            process_id: None,
            max_clients,
            current_clients: 0,
            deadline_at: now + placement,
            reason: None,
            created_at: now,
            updated_at: now,
        };
        self.persistence.create_session(&session).await?;
        Ok(session)
    }

    /// Get a session.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        Ok(self
            .persistence
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoreError::not_found("session", session_id))?)
    }

    /// End a session, releasing its process slot.
    pub async fn terminate_session(&self, session_id: &str) -> Result<()> {
        let now = Utc::now();
        for from in [SessionState::Active, SessionState::Activating] {
            if self
                .persistence
                .try_transition_session(
                    session_id,
                    from,
                    SessionState::Terminated,
                    Some("terminated by request"),
                    now,
                )
                .await?
            {
                info!(session_id, "Session terminated");
                return Ok(());
            }
        }

        let session = self.get_session(session_id).await?;
        Err(CoreError::InvalidState {
            kind: "session",
            id: session_id.to_string(),
            expected: "active or activating".to_string(),
            actual: session.state,
        }
        .into())
    }

    /// Take one client slot on an active session.
    pub async fn reserve_client_slot(&self, session_id: &str) -> Result<()> {
        if self.persistence.reserve_client_slot(session_id).await? {
            return Ok(());
        }

        let session = self.get_session(session_id).await?;
        if session.state()? != SessionState::Active {
            return Err(CoreError::InvalidState {
                kind: "session",
                id: session_id.to_string(),
                expected: SessionState::Active.as_str().to_string(),
                actual: session.state,
            }
            .into());
        }
        Err(CoreError::validation(
            "session",
            format!("all {} client slots are taken", session.max_clients),
        )
        .into())
    }

    async fn fleet(&self, fleet_id: &str) -> Result<FleetRecord> {
        Ok(self
            .persistence
            .get_fleet(fleet_id)
            .await?
            .ok_or_else(|| CoreError::not_found("fleet", fleet_id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bounds() {
        let ok = Capacity {
            min_size: 1,
            max_size: 5,
            desired_size: 3,
        };
        assert!(ok.validate().is_ok());

        let desired_high = Capacity {
            desired_size: 6,
            ..ok
        };
        let err = desired_high.validate().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("desired_size"));

        let inverted = Capacity {
            min_size: 4,
            max_size: 2,
            desired_size: 3,
        };
        assert!(inverted.validate().is_err());

        let negative = Capacity {
            min_size: -1,
            max_size: 2,
            desired_size: 0,
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_create_request_defaults_cool_down() {
        let request: CreateFleetRequest = serde_json::from_value(serde_json::json!({
            "tenant_id": "t1",
            "role_id": "r1",
            "name": "arena",
            "region": "eu-west-1",
            "image_id": "img-1",
            "instance_type": "c5.large",
            "capacity": {"min_size": 0, "max_size": 4, "desired_size": 2}
        }))
        .unwrap();

        assert_eq!(request.cool_down_secs, DEFAULT_COOL_DOWN_SECS);
    }
}
