// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pipelines for each workflow task type.
//!
//! | Task | Steps |
//! |------|-------|
//! | `create-fleet` | vpc, subnet, security group, remote scaling group, activate |
//! | `delete-fleet` | lock group, pause, drain to zero, delete remote group, security group, subnet, vpc, soft delete |
//! | `build-image` | vpc, subnet, security group, builder instance, stop builder, snapshot, delete builder |

use std::sync::Arc;

use fleetplane_core::persistence::{Persistence, WorkflowRecord};
use fleetplane_core::state::TaskType;
use fleetplane_core::{Pipeline, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::cloud::CloudClients;
use crate::credentials::CloudAccess;
use crate::error::Result;
use crate::steps::{
    ActivateScalingGroup, CreateImage, DeleteBuilderInstance, DeleteNetwork, DeleteRemoteGroup,
    DrainRemoteGroup, MarkGroupDeleting, NetworkResource, PauseRemoteGroup, PrepareBuilderInstance,
    PrepareScalingGroup, PrepareSecurityGroup, PrepareSubnet, PrepareVpc, ResourceNames,
    SoftDeleteGroup, StepSettings, StopBuilderInstance,
};

const VPC_CIDR: &str = "10.0.0.0/16";
const SUBNET_CIDR: &str = "10.0.1.0/24";

/// Whose cloud account a workflow runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScope {
    /// Owning tenant.
    pub tenant_id: String,
    /// Delegated role exchanged for credentials.
    pub role_id: String,
    /// Cloud region.
    pub region: String,
}

/// Parameters of a `create-fleet` workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFleetParams {
    /// Fleet being provisioned.
    pub fleet_id: String,
    /// Local scaling group record.
    pub group_id: String,
    /// Image instances boot from.
    pub image_id: String,
    /// Instance type of group members.
    pub instance_type: String,
    /// Cloud account.
    #[serde(flatten)]
    pub scope: TenantScope,
}

/// Parameters of a `delete-fleet` workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFleetParams {
    /// Fleet being torn down.
    pub fleet_id: String,
    /// Local scaling group record.
    pub group_id: String,
    /// Cloud account.
    #[serde(flatten)]
    pub scope: TenantScope,
}

/// Parameters of a `build-image` workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildImageParams {
    /// Name of the image to produce.
    pub image_name: String,
    /// Image the builder instance boots from.
    pub base_image_id: String,
    /// Builder instance type.
    pub instance_type: String,
    /// Cloud account.
    #[serde(flatten)]
    pub scope: TenantScope,
}

/// Builds the pipeline a persisted workflow runs.
pub struct PipelineFactory {
    persistence: Arc<dyn Persistence>,
    access: Arc<CloudAccess>,
    settings: StepSettings,
}

impl PipelineFactory {
    /// Create a factory.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        access: Arc<CloudAccess>,
        settings: StepSettings,
    ) -> Self {
        Self {
            persistence,
            access,
            settings,
        }
    }

    /// Pipeline for `record`, with cloud clients for its tenant.
    pub async fn build(&self, record: &WorkflowRecord) -> Result<Pipeline> {
        let pipeline = match record.task_type()? {
            TaskType::CreateFleet => {
                let params: CreateFleetParams = record.params()?;
                let clients = self.clients(&params.scope).await?;
                self.create_fleet(&clients, &params)
            }
            TaskType::DeleteFleet => {
                let params: DeleteFleetParams = record.params()?;
                let clients = self.clients(&params.scope).await?;
                self.delete_fleet(&clients, &params)
            }
            TaskType::BuildImage => {
                let params: BuildImageParams = record.params()?;
                let clients = self.clients(&params.scope).await?;
                self.build_image(&clients, &params)
            }
        };
        Ok(pipeline)
    }

    async fn clients(&self, scope: &TenantScope) -> Result<CloudClients> {
        Ok(self
            .access
            .clients(&scope.tenant_id, &scope.role_id, &scope.region)
            .await?)
    }

    /// Provision a fleet's network and scaling group.
    pub fn create_fleet(&self, clients: &CloudClients, params: &CreateFleetParams) -> Pipeline {
        let names = ResourceNames::for_fleet(&params.fleet_id);
        let s = self.settings;

        Pipeline::new(TaskType::CreateFleet.as_str())
            .step(PrepareVpc::new(
                clients.network.clone(),
                &names.vpc,
                VPC_CIDR,
                s.retry,
            ))
            .step(PrepareSubnet::new(
                clients.network.clone(),
                &names.subnet,
                SUBNET_CIDR,
                s.resource_wait,
                s.retry,
            ))
            .step(PrepareSecurityGroup::new(
                clients.network.clone(),
                &names.security_group,
                s.retry,
            ))
            .step(PrepareScalingGroup::new(
                clients.scaling.clone(),
                self.persistence.clone(),
                &params.group_id,
                &names.scaling_group,
                &params.image_id,
                &params.instance_type,
                s.retry,
            ))
            .step(ActivateScalingGroup::new(
                self.persistence.clone(),
                &params.group_id,
            ))
    }

    /// Drain and tear down a fleet.
    pub fn delete_fleet(&self, clients: &CloudClients, params: &DeleteFleetParams) -> Pipeline {
        let names = ResourceNames::for_fleet(&params.fleet_id);
        let s = self.settings;
        // Waiting out an in-flight scaling decision takes longer than a cloud hiccup
        let lock_retry = RetryPolicy {
            max_attempts: s.retry.max_attempts.saturating_mul(4),
            backoff: s.retry.backoff,
        };
        let network = |resource| {
            DeleteNetwork::new(clients.network.clone(), names.clone(), resource, s.retry)
        };

        Pipeline::new(TaskType::DeleteFleet.as_str())
            .step(MarkGroupDeleting::new(
                self.persistence.clone(),
                &params.group_id,
                lock_retry,
                s.lock_timeout,
            ))
            .step(PauseRemoteGroup::new(
                clients.scaling.clone(),
                self.persistence.clone(),
                &params.group_id,
                s.retry,
            ))
            .step(DrainRemoteGroup::new(
                clients.scaling.clone(),
                s.shutdown_wait,
                s.retry,
            ))
            .step(DeleteRemoteGroup::new(
                clients.scaling.clone(),
                self.persistence.clone(),
                &params.group_id,
                s.retry,
            ))
            .step(network(NetworkResource::SecurityGroup))
            .step(network(NetworkResource::Subnet))
            .step(network(NetworkResource::Vpc))
            .step(SoftDeleteGroup::new(
                self.persistence.clone(),
                &params.group_id,
            ))
    }

    /// Bake an image from a temporary builder instance.
    pub fn build_image(&self, clients: &CloudClients, params: &BuildImageParams) -> Pipeline {
        let names = ResourceNames::for_image(&params.image_name);
        let s = self.settings;

        Pipeline::new(TaskType::BuildImage.as_str())
            .step(PrepareVpc::new(
                clients.network.clone(),
                &names.vpc,
                VPC_CIDR,
                s.retry,
            ))
            .step(PrepareSubnet::new(
                clients.network.clone(),
                &names.subnet,
                SUBNET_CIDR,
                s.resource_wait,
                s.retry,
            ))
            .step(PrepareSecurityGroup::new(
                clients.network.clone(),
                &names.security_group,
                s.retry,
            ))
            .step(PrepareBuilderInstance::new(
                clients.compute.clone(),
                &names.builder,
                &params.base_image_id,
                &params.instance_type,
                s.resource_wait,
                s.retry,
            ))
            .step(StopBuilderInstance::new(
                clients.compute.clone(),
                s.shutdown_wait,
            ))
            .step(CreateImage::new(
                clients.image.clone(),
                &params.image_name,
                s.image_wait,
                s.retry,
            ))
            .step(DeleteBuilderInstance::new(clients.compute.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{MockCloud, MockConnector};
    use crate::credentials::{CredentialCache, StaticCredentialProvider};
    use fleetplane_core::SqlitePersistence;

    async fn factory() -> (PipelineFactory, CloudClients) {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let cloud = Arc::new(MockCloud::new());
        let access = Arc::new(CloudAccess::new(
            CredentialCache::new(Arc::new(StaticCredentialProvider::default())),
            Arc::new(MockConnector::new(cloud.clone())),
        ));
        (
            PipelineFactory::new(persistence, access, StepSettings::default()),
            CloudClients::from_provider(cloud),
        )
    }

    fn scope() -> TenantScope {
        TenantScope {
            tenant_id: "t1".into(),
            role_id: "r1".into(),
            region: "eu-west-1".into(),
        }
    }

    #[tokio::test]
    async fn test_pipeline_shapes() {
        let (factory, clients) = factory().await;

        let create = factory.create_fleet(
            &clients,
            &CreateFleetParams {
                fleet_id: "f1".into(),
                group_id: "g1".into(),
                image_id: "img".into(),
                instance_type: "small".into(),
                scope: scope(),
            },
        );
        assert_eq!(
            create.step_names(),
            vec![
                "prepare-vpc",
                "prepare-subnet",
                "prepare-security-group",
                "prepare-scaling-group",
                "activate-scaling-group"
            ]
        );

        let delete = factory.delete_fleet(
            &clients,
            &DeleteFleetParams {
                fleet_id: "f1".into(),
                group_id: "g1".into(),
                scope: scope(),
            },
        );
        assert_eq!(delete.step_names().first(), Some(&"mark-group-deleting"));
        assert_eq!(delete.step_names().last(), Some(&"soft-delete-group"));

        let build = factory.build_image(
            &clients,
            &BuildImageParams {
                image_name: "game-v2".into(),
                base_image_id: "base".into(),
                instance_type: "large".into(),
                scope: scope(),
            },
        );
        assert_eq!(build.len(), 7);
    }

    #[test]
    fn test_params_flatten_scope() {
        let params = DeleteFleetParams {
            fleet_id: "f1".into(),
            group_id: "g1".into(),
            scope: scope(),
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["tenant_id"], "t1");
        assert_eq!(json["region"], "eu-west-1");
    }
}
