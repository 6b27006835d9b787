// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VPC, subnet and security group steps.

use std::sync::Arc;

use async_trait::async_trait;
use fleetplane_core::{ExecutionContext, RetryPolicy, Step, StepError, WaitBudget, wait_until};
use tracing::{debug, info};

use super::{gone_ok, keys, required};
use crate::cloud::{NetworkApi, SubnetStatus};

/// Find or create the VPC.
pub struct PrepareVpc {
    network: Arc<dyn NetworkApi>,
    name: String,
    cidr: String,
    retry: RetryPolicy,
}

impl PrepareVpc {
    /// Step for the VPC called `name`.
    pub fn new(
        network: Arc<dyn NetworkApi>,
        name: impl Into<String>,
        cidr: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            network,
            name: name.into(),
            cidr: cidr.into(),
            retry,
        }
    }
}

#[async_trait]
impl Step for PrepareVpc {
    fn name(&self) -> &str {
        "prepare-vpc"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let vpc = match self.network.find_vpc(&self.name).await? {
            Some(vpc) => {
                debug!(vpc_id = %vpc.vpc_id, name = %self.name, "VPC already exists");
                vpc
            }
            None => {
                let vpc = self.network.create_vpc(&self.name, &self.cidr).await?;
                info!(vpc_id = %vpc.vpc_id, name = %self.name, "Created VPC");
                vpc
            }
        };
        Ok(ExecutionContext::new().with(keys::VPC_ID, vpc.vpc_id))
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<Vec<String>, StepError> {
        let vpc_id = match ctx.get_str(keys::VPC_ID) {
            Some(id) => Some(id.to_string()),
            None => self.network.find_vpc(&self.name).await?.map(|v| v.vpc_id),
        };
        if let Some(vpc_id) = vpc_id {
            gone_ok(self.network.delete_vpc(&vpc_id).await)?;
            info!(vpc_id = %vpc_id, "Deleted VPC");
        }
        Ok(vec![keys::VPC_ID.to_string()])
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Find or create the subnet, then wait for it to become active.
pub struct PrepareSubnet {
    network: Arc<dyn NetworkApi>,
    name: String,
    cidr: String,
    wait: WaitBudget,
    retry: RetryPolicy,
}

impl PrepareSubnet {
    /// Step for the subnet called `name` inside the context's VPC.
    pub fn new(
        network: Arc<dyn NetworkApi>,
        name: impl Into<String>,
        cidr: impl Into<String>,
        wait: WaitBudget,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            network,
            name: name.into(),
            cidr: cidr.into(),
            wait,
            retry,
        }
    }
}

#[async_trait]
impl Step for PrepareSubnet {
    fn name(&self) -> &str {
        "prepare-subnet"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let vpc_id = required(ctx, keys::VPC_ID)?;

        let subnet = match self.network.find_subnet(vpc_id, &self.name).await? {
            Some(subnet) => subnet,
            None => {
                let subnet = self
                    .network
                    .create_subnet(vpc_id, &self.name, &self.cidr)
                    .await?;
                info!(subnet_id = %subnet.subnet_id, vpc_id, "Created subnet");
                subnet
            }
        };

        let subnet_id = subnet.subnet_id;
        let what = format!("subnet {subnet_id}");
        wait_until(self.wait, &what, || {
            let network = self.network.clone();
            let subnet_id = subnet_id.clone();
            async move {
                let subnet = network.get_subnet(&subnet_id).await?;
                match subnet.status {
                    SubnetStatus::Active => Ok(Some(())),
                    SubnetStatus::Pending => Ok(None),
                    SubnetStatus::Error => Err(StepError::Terminal(format!(
                        "subnet '{subnet_id}' failed to activate"
                    ))),
                }
            }
        })
        .await?;

        Ok(ExecutionContext::new().with(keys::SUBNET_ID, subnet_id))
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<Vec<String>, StepError> {
        // A step that failed while waiting never recorded its id
        let subnet_id = match (ctx.get_str(keys::SUBNET_ID), ctx.get_str(keys::VPC_ID)) {
            (Some(id), _) => Some(id.to_string()),
            (None, Some(vpc_id)) => self
                .network
                .find_subnet(vpc_id, &self.name)
                .await?
                .map(|s| s.subnet_id),
            (None, None) => None,
        };
        if let Some(subnet_id) = subnet_id {
            gone_ok(self.network.delete_subnet(&subnet_id).await)?;
            info!(subnet_id = %subnet_id, "Deleted subnet");
        }
        Ok(vec![keys::SUBNET_ID.to_string()])
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Find or create the security group.
pub struct PrepareSecurityGroup {
    network: Arc<dyn NetworkApi>,
    name: String,
    retry: RetryPolicy,
}

impl PrepareSecurityGroup {
    /// Step for the security group called `name` inside the context's VPC.
    pub fn new(network: Arc<dyn NetworkApi>, name: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            network,
            name: name.into(),
            retry,
        }
    }
}

#[async_trait]
impl Step for PrepareSecurityGroup {
    fn name(&self) -> &str {
        "prepare-security-group"
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let vpc_id = required(ctx, keys::VPC_ID)?;
        let group = match self.network.find_security_group(vpc_id, &self.name).await? {
            Some(group) => group,
            None => {
                let group = self.network.create_security_group(vpc_id, &self.name).await?;
                info!(
                    security_group_id = %group.security_group_id,
                    vpc_id,
                    "Created security group"
                );
                group
            }
        };
        Ok(ExecutionContext::new().with(keys::SECURITY_GROUP_ID, group.security_group_id))
    }

    async fn rollback(&self, ctx: &ExecutionContext) -> Result<Vec<String>, StepError> {
        let id = match (ctx.get_str(keys::SECURITY_GROUP_ID), ctx.get_str(keys::VPC_ID)) {
            (Some(id), _) => Some(id.to_string()),
            (None, Some(vpc_id)) => self
                .network
                .find_security_group(vpc_id, &self.name)
                .await?
                .map(|g| g.security_group_id),
            (None, None) => None,
        };
        if let Some(id) = id {
            gone_ok(self.network.delete_security_group(&id).await)?;
        }
        Ok(vec![keys::SECURITY_GROUP_ID.to_string()])
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}
