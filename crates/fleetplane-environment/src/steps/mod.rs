// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idempotent provisioning and teardown steps.
//!
//! Every step looks for its own earlier effect before acting: creates start
//! with a lookup by name, deletes treat "not found" as done. That is what
//! makes re-running a step after a crash (or after a takeover) safe.

pub mod compute;
pub mod image;
pub mod network;
pub mod teardown;

use std::time::Duration;

use fleetplane_core::{ExecutionContext, RetryPolicy, StepError, WaitBudget};

use crate::cloud::{CloudError, CloudResult};
use crate::config::Config;

pub use compute::{
    ActivateScalingGroup, DeleteBuilderInstance, PrepareBuilderInstance, PrepareScalingGroup,
    StopBuilderInstance,
};
pub use image::CreateImage;
pub use network::{PrepareSecurityGroup, PrepareSubnet, PrepareVpc};
pub use teardown::{
    DeleteNetwork, DeleteRemoteGroup, DrainRemoteGroup, MarkGroupDeleting, NetworkResource,
    PauseRemoteGroup, SoftDeleteGroup,
};

/// Context keys written by the steps.
pub mod keys {
    /// Cloud region, seeded when the workflow is created.
    pub const REGION: &str = "region";
    /// VPC id.
    pub const VPC_ID: &str = "vpc_id";
    /// Subnet id.
    pub const SUBNET_ID: &str = "subnet_id";
    /// Security group id.
    pub const SECURITY_GROUP_ID: &str = "security_group_id";
    /// Remote scaling group id.
    pub const REMOTE_GROUP_ID: &str = "remote_group_id";
    /// Image builder instance id.
    pub const BUILDER_INSTANCE_ID: &str = "builder_instance_id";
    /// Built image id.
    pub const IMAGE_ID: &str = "image_id";
    /// Set once the remote group has been drained.
    pub const DRAINED: &str = "drained";
}

/// Wait budgets and retry policy shared by all steps.
#[derive(Debug, Clone, Copy)]
pub struct StepSettings {
    /// Subnet activation and instance boot.
    pub resource_wait: WaitBudget,
    /// Instances shutting off.
    pub shutdown_wait: WaitBudget,
    /// Image builds.
    pub image_wait: WaitBudget,
    /// Retries for transient and conflicting cloud errors.
    pub retry: RetryPolicy,
    /// Age after which a scaling group lock is presumed abandoned.
    pub lock_timeout: Duration,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            resource_wait: WaitBudget::new(Duration::from_secs(5), 60),
            shutdown_wait: WaitBudget::new(Duration::from_secs(10), 60),
            image_wait: WaitBudget::new(Duration::from_secs(30), 120),
            retry: RetryPolicy::default(),
            lock_timeout: Duration::from_secs(300),
        }
    }
}

impl StepSettings {
    /// Budgets from the service configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            resource_wait: config.resource_wait,
            shutdown_wait: config.shutdown_wait,
            image_wait: config.image_wait,
            retry: RetryPolicy::default(),
            lock_timeout: config.scaling_lock_timeout,
        }
    }
}

/// Cloud resource names derived from the resource a workflow acts on.
///
/// Names are the idempotency keys: a re-run finds what an earlier run made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// VPC name.
    pub vpc: String,
    /// Subnet name.
    pub subnet: String,
    /// Security group name.
    pub security_group: String,
    /// Remote scaling group name.
    pub scaling_group: String,
    /// Image builder instance name.
    pub builder: String,
}

impl ResourceNames {
    /// Names for a fleet's infrastructure.
    pub fn for_fleet(fleet_id: &str) -> Self {
        Self::with_prefix(&format!("fp-{fleet_id}"))
    }

    /// Names for an image build's scratch infrastructure.
    pub fn for_image(image_name: &str) -> Self {
        Self::with_prefix(&format!("fp-img-{image_name}"))
    }

    fn with_prefix(prefix: &str) -> Self {
        Self {
            vpc: format!("{prefix}-vpc"),
            subnet: format!("{prefix}-subnet"),
            security_group: format!("{prefix}-sg"),
            scaling_group: format!("{prefix}-asg"),
            builder: format!("{prefix}-builder"),
        }
    }
}

/// A string the step needs from the context.
pub(crate) fn required<'a>(ctx: &'a ExecutionContext, key: &str) -> Result<&'a str, StepError> {
    ctx.get_str(key)
        .ok_or_else(|| StepError::Terminal(format!("missing '{key}' in workflow context")))
}

/// Treat "not found" as success for deletes.
pub(crate) fn gone_ok(result: CloudResult<()>) -> Result<(), StepError> {
    match result {
        Ok(()) | Err(CloudError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
