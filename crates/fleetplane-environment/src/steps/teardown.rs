// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet teardown steps.
//!
//! Teardown has no inverse: a failed delete leaves the fleet in `error`
//! for an operator, and a new delete picks up where the last one stopped
//! because every step finds its targets by name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetplane_core::persistence::Persistence;
use fleetplane_core::state::ScalingGroupState;
use fleetplane_core::{ExecutionContext, RetryPolicy, Step, StepError, WaitBudget, wait_until};
use tracing::{debug, info, warn};

use super::{ResourceNames, gone_ok, keys};
use crate::cloud::{CloudError, InstanceStatus, NetworkApi, ScalingApi};
use crate::reconciler::lock_cutoff;

/// Lock the local group into `deleting` so reconciliation leaves it alone.
pub struct MarkGroupDeleting {
    persistence: Arc<dyn Persistence>,
    group_id: String,
    retry: RetryPolicy,
    lock_timeout: Duration,
}

impl MarkGroupDeleting {
    /// Step for the local group `group_id`. `retry` governs waiting out a
    /// scaling decision that currently holds the group; a hold older than
    /// `lock_timeout` is released instead.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        group_id: impl Into<String>,
        retry: RetryPolicy,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            persistence,
            group_id: group_id.into(),
            retry,
            lock_timeout,
        }
    }
}

#[async_trait]
impl Step for MarkGroupDeleting {
    fn name(&self) -> &str {
        "mark-group-deleting"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        if let Some(cutoff) = lock_cutoff(self.lock_timeout) {
            if self
                .persistence
                .release_stale_group_lock(&self.group_id, cutoff)
                .await?
            {
                warn!(group_id = %self.group_id, "Released abandoned scaling lock before deletion");
            }
        }

        for from in [
            ScalingGroupState::Stable,
            ScalingGroupState::Error,
            ScalingGroupState::Creating,
        ] {
            if self
                .persistence
                .try_transition_group(&self.group_id, from, ScalingGroupState::Deleting)
                .await?
            {
                info!(group_id = %self.group_id, from = %from, "Scaling group marked for deletion");
                return Ok(ExecutionContext::new());
            }
        }

        let Some(group) = self.persistence.get_scaling_group(&self.group_id).await? else {
            return Ok(ExecutionContext::new());
        };
        match group.state()? {
            ScalingGroupState::Deleting | ScalingGroupState::Deleted => Ok(ExecutionContext::new()),
            ScalingGroupState::Scaling => Err(StepError::Conflict(format!(
                "scaling group '{}' is locked by a scaling decision",
                self.group_id
            ))),
            // Lost a race against a concurrent transition; the next attempt re-reads
            other => Err(StepError::Conflict(format!(
                "scaling group '{}' changed to '{}' while locking",
                self.group_id, other
            ))),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Stop the remote group from launching anything new.
pub struct PauseRemoteGroup {
    scaling: Arc<dyn ScalingApi>,
    persistence: Arc<dyn Persistence>,
    group_id: String,
    retry: RetryPolicy,
}

impl PauseRemoteGroup {
    /// Step pausing the remote side of local group `group_id`.
    pub fn new(
        scaling: Arc<dyn ScalingApi>,
        persistence: Arc<dyn Persistence>,
        group_id: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            scaling,
            persistence,
            group_id: group_id.into(),
            retry,
        }
    }
}

#[async_trait]
impl Step for PauseRemoteGroup {
    fn name(&self) -> &str {
        "pause-remote-group"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let remote_id = self
            .persistence
            .get_scaling_group(&self.group_id)
            .await?
            .and_then(|g| g.remote_group_id);
        let Some(remote_id) = remote_id else {
            debug!(group_id = %self.group_id, "No remote group to pause");
            return Ok(ExecutionContext::new());
        };

        gone_ok(self.scaling.pause_group(&remote_id).await)?;
        info!(group_id = %self.group_id, remote_group_id = %remote_id, "Remote group paused");
        Ok(ExecutionContext::new().with(keys::REMOTE_GROUP_ID, remote_id))
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Scale the remote group to zero and wait for every member to shut off.
pub struct DrainRemoteGroup {
    scaling: Arc<dyn ScalingApi>,
    wait: WaitBudget,
    retry: RetryPolicy,
}

impl DrainRemoteGroup {
    /// Step draining the context's remote group.
    pub fn new(scaling: Arc<dyn ScalingApi>, wait: WaitBudget, retry: RetryPolicy) -> Self {
        Self {
            scaling,
            wait,
            retry,
        }
    }
}

#[async_trait]
impl Step for DrainRemoteGroup {
    fn name(&self) -> &str {
        "drain-remote-group"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let Some(remote_id) = ctx.get_str(keys::REMOTE_GROUP_ID) else {
            return Ok(ExecutionContext::new().with(keys::DRAINED, true));
        };

        let group = match self.scaling.get_group(remote_id).await {
            Ok(group) => group,
            Err(CloudError::NotFound { .. }) => {
                return Ok(ExecutionContext::new().with(keys::DRAINED, true));
            }
            Err(e) => return Err(e.into()),
        };

        let victims: Vec<String> = self
            .scaling
            .list_instances(remote_id)
            .await?
            .into_iter()
            .filter(|i| i.status.is_live())
            .map(|i| i.instance_id)
            .collect();
        if !victims.is_empty() {
            // An expired decision surfaces as a conflict and the step is retried
            self.scaling
                .scale_in(remote_id, &victims, group.revision)
                .await?;
            info!(remote_group_id = remote_id, count = victims.len(), "Scaling group to zero");
        }

        let what = format!("instances of group {remote_id} to shut off");
        wait_until(self.wait, &what, || {
            let scaling = self.scaling.clone();
            let remote_id = remote_id.to_string();
            async move {
                let members = scaling.list_instances(&remote_id).await?;
                let done = members
                    .iter()
                    .all(|m| matches!(m.status, InstanceStatus::Stopped | InstanceStatus::Error));
                Ok(done.then_some(()))
            }
        })
        .await?;

        Ok(ExecutionContext::new().with(keys::DRAINED, true))
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Delete the drained remote group and unlink it.
pub struct DeleteRemoteGroup {
    scaling: Arc<dyn ScalingApi>,
    persistence: Arc<dyn Persistence>,
    group_id: String,
    retry: RetryPolicy,
}

impl DeleteRemoteGroup {
    /// Step deleting the remote side of local group `group_id`.
    pub fn new(
        scaling: Arc<dyn ScalingApi>,
        persistence: Arc<dyn Persistence>,
        group_id: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            scaling,
            persistence,
            group_id: group_id.into(),
            retry,
        }
    }
}

#[async_trait]
impl Step for DeleteRemoteGroup {
    fn name(&self) -> &str {
        "delete-remote-group"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        if let Some(remote_id) = ctx.get_str(keys::REMOTE_GROUP_ID) {
            gone_ok(self.scaling.delete_group(remote_id).await)?;
            info!(group_id = %self.group_id, remote_group_id = remote_id, "Remote group deleted");
        }
        self.persistence
            .set_remote_group_id(&self.group_id, None)
            .await?;
        Ok(ExecutionContext::new())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Which network resource a [`DeleteNetwork`] step removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkResource {
    /// The security group.
    SecurityGroup,
    /// The subnet.
    Subnet,
    /// The VPC itself; must come last.
    Vpc,
}

/// Delete one network resource, found by name.
pub struct DeleteNetwork {
    network: Arc<dyn NetworkApi>,
    names: ResourceNames,
    resource: NetworkResource,
    retry: RetryPolicy,
}

impl DeleteNetwork {
    /// Step deleting `resource` out of the network named by `names`.
    pub fn new(
        network: Arc<dyn NetworkApi>,
        names: ResourceNames,
        resource: NetworkResource,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            network,
            names,
            resource,
            retry,
        }
    }
}

#[async_trait]
impl Step for DeleteNetwork {
    fn name(&self) -> &str {
        match self.resource {
            NetworkResource::SecurityGroup => "delete-security-group",
            NetworkResource::Subnet => "delete-subnet",
            NetworkResource::Vpc => "delete-vpc",
        }
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let Some(vpc) = self.network.find_vpc(&self.names.vpc).await? else {
            return Ok(ExecutionContext::new());
        };

        match self.resource {
            NetworkResource::SecurityGroup => {
                if let Some(sg) = self
                    .network
                    .find_security_group(&vpc.vpc_id, &self.names.security_group)
                    .await?
                {
                    gone_ok(self.network.delete_security_group(&sg.security_group_id).await)?;
                }
            }
            NetworkResource::Subnet => {
                if let Some(subnet) = self
                    .network
                    .find_subnet(&vpc.vpc_id, &self.names.subnet)
                    .await?
                {
                    gone_ok(self.network.delete_subnet(&subnet.subnet_id).await)?;
                }
            }
            NetworkResource::Vpc => {
                gone_ok(self.network.delete_vpc(&vpc.vpc_id).await)?;
                info!(vpc_id = %vpc.vpc_id, "VPC deleted");
            }
        }
        Ok(ExecutionContext::new())
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// `deleting -> deleted` on the local group, hiding it.
pub struct SoftDeleteGroup {
    persistence: Arc<dyn Persistence>,
    group_id: String,
}

impl SoftDeleteGroup {
    /// Step for the local group `group_id`.
    pub fn new(persistence: Arc<dyn Persistence>, group_id: impl Into<String>) -> Self {
        Self {
            persistence,
            group_id: group_id.into(),
        }
    }
}

#[async_trait]
impl Step for SoftDeleteGroup {
    fn name(&self) -> &str {
        "soft-delete-group"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        if self.persistence.soft_delete_group(&self.group_id).await? {
            info!(group_id = %self.group_id, "Scaling group deleted");
            return Ok(ExecutionContext::new());
        }
        match self.persistence.get_scaling_group(&self.group_id).await? {
            None => Ok(ExecutionContext::new()),
            Some(group) if group.state()? == ScalingGroupState::Deleted => {
                Ok(ExecutionContext::new())
            }
            Some(group) => Err(StepError::Terminal(format!(
                "scaling group '{}' is '{}', expected 'deleting'",
                self.group_id, group.state
            ))),
        }
    }
}
