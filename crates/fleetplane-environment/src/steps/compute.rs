// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scaling group and builder instance steps.

use std::sync::Arc;

use async_trait::async_trait;
use fleetplane_core::persistence::Persistence;
use fleetplane_core::state::ScalingGroupState;
use fleetplane_core::{ExecutionContext, RetryPolicy, Step, StepError, WaitBudget, wait_until};
use tracing::info;

use super::{gone_ok, keys, required};
use crate::cloud::{ComputeApi, InstanceSpec, InstanceStatus, RemoteGroupSpec, ScalingApi};

/// Find or create the remote scaling group and link it to the local record.
pub struct PrepareScalingGroup {
    scaling: Arc<dyn ScalingApi>,
    persistence: Arc<dyn Persistence>,
    group_id: String,
    name: String,
    image_id: String,
    instance_type: String,
    retry: RetryPolicy,
}

impl PrepareScalingGroup {
    /// Step for the local group `group_id`, remote name `name`.
    pub fn new(
        scaling: Arc<dyn ScalingApi>,
        persistence: Arc<dyn Persistence>,
        group_id: impl Into<String>,
        name: impl Into<String>,
        image_id: impl Into<String>,
        instance_type: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            scaling,
            persistence,
            group_id: group_id.into(),
            name: name.into(),
            image_id: image_id.into(),
            instance_type: instance_type.into(),
            retry,
        }
    }
}

#[async_trait]
impl Step for PrepareScalingGroup {
    fn name(&self) -> &str {
        "prepare-scaling-group"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let remote = match self.scaling.find_group(&self.name).await? {
            Some(remote) => remote,
            None => {
                let spec = RemoteGroupSpec {
                    name: self.name.clone(),
                    image_id: self.image_id.clone(),
                    instance_type: self.instance_type.clone(),
                    subnet_id: required(ctx, keys::SUBNET_ID)?.to_string(),
                    security_group_id: required(ctx, keys::SECURITY_GROUP_ID)?.to_string(),
                };
                let remote = self.scaling.create_group(&spec).await?;
                info!(
                    group_id = %self.group_id,
                    remote_group_id = %remote.group_id,
                    "Created remote scaling group"
                );
                remote
            }
        };

        self.persistence
            .set_remote_group_id(&self.group_id, Some(&remote.group_id))
            .await?;

        Ok(ExecutionContext::new().with(keys::REMOTE_GROUP_ID, remote.group_id))
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<Vec<String>, StepError> {
        let remote_id = match ctx.get_str(keys::REMOTE_GROUP_ID) {
            Some(id) => Some(id.to_string()),
            None => self.scaling.find_group(&self.name).await?.map(|g| g.group_id),
        };
        if let Some(remote_id) = remote_id {
            gone_ok(self.scaling.delete_group(&remote_id).await)?;
        }
        self.persistence
            .set_remote_group_id(&self.group_id, None)
            .await?;
        Ok(vec![keys::REMOTE_GROUP_ID.to_string()])
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Move the local group from `creating` to `stable`, opening it to reconciliation.
pub struct ActivateScalingGroup {
    persistence: Arc<dyn Persistence>,
    group_id: String,
}

impl ActivateScalingGroup {
    /// Step for the local group `group_id`.
    pub fn new(persistence: Arc<dyn Persistence>, group_id: impl Into<String>) -> Self {
        Self {
            persistence,
            group_id: group_id.into(),
        }
    }
}

#[async_trait]
impl Step for ActivateScalingGroup {
    fn name(&self) -> &str {
        "activate-scaling-group"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let activated = self
            .persistence
            .try_transition_group(
                &self.group_id,
                ScalingGroupState::Creating,
                ScalingGroupState::Stable,
            )
            .await?;
        if activated {
            info!(group_id = %self.group_id, "Scaling group is stable");
            return Ok(ExecutionContext::new());
        }

        // A replay after a crash finds the group already activated
        let group = self
            .persistence
            .get_scaling_group(&self.group_id)
            .await?
            .ok_or_else(|| StepError::Terminal(format!("scaling group '{}' is gone", self.group_id)))?;
        match group.state()? {
            ScalingGroupState::Stable | ScalingGroupState::Scaling => Ok(ExecutionContext::new()),
            other => Err(StepError::Terminal(format!(
                "scaling group '{}' cannot be activated from '{}'",
                self.group_id, other
            ))),
        }
    }
}

/// Find or launch the image builder instance and wait for it to run.
pub struct PrepareBuilderInstance {
    compute: Arc<dyn ComputeApi>,
    name: String,
    base_image_id: String,
    instance_type: String,
    wait: WaitBudget,
    retry: RetryPolicy,
}

impl PrepareBuilderInstance {
    /// Step for the builder instance called `name`.
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        name: impl Into<String>,
        base_image_id: impl Into<String>,
        instance_type: impl Into<String>,
        wait: WaitBudget,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            compute,
            name: name.into(),
            base_image_id: base_image_id.into(),
            instance_type: instance_type.into(),
            wait,
            retry,
        }
    }
}

#[async_trait]
impl Step for PrepareBuilderInstance {
    fn name(&self) -> &str {
        "prepare-builder-instance"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let instance = match self.compute.find_instance(&self.name).await? {
            Some(instance) => instance,
            None => {
                let spec = InstanceSpec {
                    name: self.name.clone(),
                    image_id: self.base_image_id.clone(),
                    instance_type: self.instance_type.clone(),
                    subnet_id: required(ctx, keys::SUBNET_ID)?.to_string(),
                    security_group_id: required(ctx, keys::SECURITY_GROUP_ID)?.to_string(),
                };
                let instance = self.compute.create_instance(&spec).await?;
                info!(instance_id = %instance.instance_id, "Launched builder instance");
                instance
            }
        };

        let instance_id = instance.instance_id;
        let what = format!("instance {instance_id} to run");
        wait_until(self.wait, &what, || {
            let compute = self.compute.clone();
            let instance_id = instance_id.clone();
            async move {
                let instance = compute.get_instance(&instance_id).await?;
                match instance.status {
                    InstanceStatus::Running => Ok(Some(())),
                    InstanceStatus::Pending => Ok(None),
                    other => Err(StepError::Terminal(format!(
                        "builder instance '{instance_id}' is {other:?}"
                    ))),
                }
            }
        })
        .await?;

        Ok(ExecutionContext::new().with(keys::BUILDER_INSTANCE_ID, instance_id))
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<Vec<String>, StepError> {
        let instance_id = match ctx.get_str(keys::BUILDER_INSTANCE_ID) {
            Some(id) => Some(id.to_string()),
            None => self
                .compute
                .find_instance(&self.name)
                .await?
                .map(|i| i.instance_id),
        };
        if let Some(id) = instance_id {
            gone_ok(self.compute.delete_instance(&id).await)?;
            info!(instance_id = %id, "Deleted builder instance");
        }
        Ok(vec![keys::BUILDER_INSTANCE_ID.to_string()])
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Stop the builder instance and wait until it is shut off.
pub struct StopBuilderInstance {
    compute: Arc<dyn ComputeApi>,
    wait: WaitBudget,
}

impl StopBuilderInstance {
    /// Step stopping the context's builder instance.
    pub fn new(compute: Arc<dyn ComputeApi>, wait: WaitBudget) -> Self {
        Self { compute, wait }
    }
}

#[async_trait]
impl Step for StopBuilderInstance {
    fn name(&self) -> &str {
        "stop-builder-instance"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let instance_id = required(ctx, keys::BUILDER_INSTANCE_ID)?.to_string();

        if self.compute.get_instance(&instance_id).await?.status.is_live() {
            self.compute.stop_instance(&instance_id).await?;
        }

        let what = format!("instance {instance_id} to stop");
        wait_until(self.wait, &what, || {
            let compute = self.compute.clone();
            let instance_id = instance_id.clone();
            async move {
                match compute.get_instance(&instance_id).await?.status {
                    InstanceStatus::Stopped => Ok(Some(())),
                    InstanceStatus::Error => Err(StepError::Terminal(format!(
                        "builder instance '{instance_id}' failed while stopping"
                    ))),
                    _ => Ok(None),
                }
            }
        })
        .await?;

        Ok(ExecutionContext::new())
    }
}

/// Delete the builder instance once the image exists.
pub struct DeleteBuilderInstance {
    compute: Arc<dyn ComputeApi>,
}

impl DeleteBuilderInstance {
    /// Step deleting the context's builder instance.
    pub fn new(compute: Arc<dyn ComputeApi>) -> Self {
        Self { compute }
    }
}

#[async_trait]
impl Step for DeleteBuilderInstance {
    fn name(&self) -> &str {
        "delete-builder-instance"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let instance_id = required(ctx, keys::BUILDER_INSTANCE_ID)?;
        gone_ok(self.compute.delete_instance(instance_id).await)?;
        info!(instance_id, "Deleted builder instance");
        Ok(ExecutionContext::new())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use fleetplane_core::SqlitePersistence;
    use fleetplane_core::persistence::ScalingGroupRecord;

    use super::*;

    async fn group_record(persistence: &Arc<dyn Persistence>, state: ScalingGroupState) {
        let now = Utc::now();
        persistence
            .create_scaling_group(&ScalingGroupRecord {
                group_id: "g1".into(),
                fleet_id: "f1".into(),
                region: "eu-west-1".into(),
                remote_group_id: None,
                min_size: 0,
                max_size: 5,
                desired_size: 1,
                state: state.as_str().into(),
                cool_down_secs: 60,
                enable_auto_scaling: false,
                visible: true,
                last_scaled_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_activation_is_idempotent() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        group_record(&persistence, ScalingGroupState::Creating).await;
        let step = ActivateScalingGroup::new(persistence.clone(), "g1");

        step.execute(&ExecutionContext::new()).await.unwrap();
        step.execute(&ExecutionContext::new()).await.unwrap();

        let group = persistence.get_scaling_group("g1").await.unwrap().unwrap();
        assert_eq!(group.state().unwrap(), ScalingGroupState::Stable);
    }

    #[tokio::test]
    async fn test_activation_refuses_deleting_group() {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        group_record(&persistence, ScalingGroupState::Deleting).await;

        let err = ActivateScalingGroup::new(persistence, "g1")
            .execute(&ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Terminal(_)));
    }
}
