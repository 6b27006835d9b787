// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud provider contracts.
//!
//! The control plane only depends on these traits. Concrete vendor clients
//! live outside this crate; [`mock::MockCloud`] implements every trait in
//! memory for local runs and tests.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetplane_core::StepError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::Credentials;

pub use mock::{MockCloud, MockConnector, ResourceCounts};

/// Errors from cloud API calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CloudError {
    /// The resource does not exist (or no longer exists).
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Resource id or name.
        id: String,
    },

    /// A create collided with an existing resource.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Resource id or name.
        id: String,
    },

    /// The scaling group changed between read and write.
    #[error("scaling decision expired for group '{0}'")]
    DecisionExpired(String),

    /// Network error, throttling or timeout.
    #[error("transient cloud error: {0}")]
    Transient(String),

    /// The provider refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl CloudError {
    /// Shorthand for [`CloudError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this is a not-found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<CloudError> for StepError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Transient(_) => StepError::Transient(err.to_string()),
            CloudError::DecisionExpired(_) | CloudError::AlreadyExists { .. } => {
                StepError::Conflict(err.to_string())
            }
            other => StepError::Terminal(other.to_string()),
        }
    }
}

/// Result type for cloud calls.
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vpc {
    /// Provider id.
    pub vpc_id: String,
    /// Unique name.
    pub name: String,
    /// Address range.
    pub cidr: String,
}

/// Subnet readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetStatus {
    /// Being created.
    Pending,
    /// Usable.
    Active,
    /// Creation failed.
    Error,
}

/// Subnet inside a VPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Provider id.
    pub subnet_id: String,
    /// Owning VPC.
    pub vpc_id: String,
    /// Name, unique within the VPC.
    pub name: String,
    /// Address range.
    pub cidr: String,
    /// Readiness.
    pub status: SubnetStatus,
}

/// Security group inside a VPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    /// Provider id.
    pub security_group_id: String,
    /// Owning VPC.
    pub vpc_id: String,
    /// Name, unique within the VPC.
    pub name: String,
}

/// Compute instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Booting.
    Pending,
    /// Up.
    Running,
    /// Shutting down.
    Stopping,
    /// Shut off.
    Stopped,
    /// Failed.
    Error,
}

impl InstanceStatus {
    /// Whether the instance counts towards a group's capacity.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Provider id.
    pub instance_id: String,
    /// Unique name.
    pub name: String,
    /// Image it booted from.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Subnet it runs in.
    pub subnet_id: String,
    /// Lifecycle status.
    pub status: InstanceStatus,
}

/// Parameters for a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Unique name, used for idempotent lookup.
    pub name: String,
    /// Image to boot.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Subnet to place it in.
    pub subnet_id: String,
    /// Security group to attach.
    pub security_group_id: String,
}

/// Image build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    /// Snapshot in progress.
    Building,
    /// Ready to boot.
    Available,
    /// Build failed.
    Error,
}

/// Machine image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Provider id.
    pub image_id: String,
    /// Unique name.
    pub name: String,
    /// Build status.
    pub status: ImageStatus,
}

/// Scaling group as seen by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteGroup {
    /// Provider id.
    pub group_id: String,
    /// Unique name.
    pub name: String,
    /// Bumped on every change; writes must present the current value.
    pub revision: u64,
    /// Paused groups accept no scale-out.
    pub paused: bool,
}

/// Parameters for a new remote scaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteGroupSpec {
    /// Unique name, used for idempotent lookup.
    pub name: String,
    /// Image new instances boot from.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Subnet for new instances.
    pub subnet_id: String,
    /// Security group for new instances.
    pub security_group_id: String,
}

/// Member of a remote scaling group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInstance {
    /// Provider id.
    pub instance_id: String,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Launch time.
    pub launched_at: DateTime<Utc>,
}

/// Virtual network, subnet and security group operations.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Look a VPC up by name.
    async fn find_vpc(&self, name: &str) -> CloudResult<Option<Vpc>>;
    /// Create a VPC.
    async fn create_vpc(&self, name: &str, cidr: &str) -> CloudResult<Vpc>;
    /// Delete a VPC.
    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()>;

    /// Look a subnet up by name within a VPC.
    async fn find_subnet(&self, vpc_id: &str, name: &str) -> CloudResult<Option<Subnet>>;
    /// Create a subnet. It starts `pending`.
    async fn create_subnet(&self, vpc_id: &str, name: &str, cidr: &str) -> CloudResult<Subnet>;
    /// Read a subnet's current status.
    async fn get_subnet(&self, subnet_id: &str) -> CloudResult<Subnet>;
    /// Delete a subnet.
    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()>;

    /// Look a security group up by name within a VPC.
    async fn find_security_group(
        &self,
        vpc_id: &str,
        name: &str,
    ) -> CloudResult<Option<SecurityGroup>>;
    /// Create a security group.
    async fn create_security_group(&self, vpc_id: &str, name: &str) -> CloudResult<SecurityGroup>;
    /// Delete a security group.
    async fn delete_security_group(&self, security_group_id: &str) -> CloudResult<()>;
}

/// Compute instance operations.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Look an instance up by name. Deleted instances are not returned.
    async fn find_instance(&self, name: &str) -> CloudResult<Option<Instance>>;
    /// Launch an instance. It starts `pending`.
    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<Instance>;
    /// Read an instance's current status.
    async fn get_instance(&self, instance_id: &str) -> CloudResult<Instance>;
    /// Begin shutting an instance down.
    async fn stop_instance(&self, instance_id: &str) -> CloudResult<()>;
    /// Delete an instance.
    async fn delete_instance(&self, instance_id: &str) -> CloudResult<()>;
}

/// Machine image operations.
#[async_trait]
pub trait ImageApi: Send + Sync {
    /// Look an image up by name.
    async fn find_image(&self, name: &str) -> CloudResult<Option<Image>>;
    /// Snapshot a stopped instance into an image. It starts `building`.
    async fn create_image(&self, name: &str, instance_id: &str) -> CloudResult<Image>;
    /// Read an image's current status.
    async fn get_image(&self, image_id: &str) -> CloudResult<Image>;
    /// Delete an image.
    async fn delete_image(&self, image_id: &str) -> CloudResult<()>;
}

/// Remote scaling group operations.
#[async_trait]
pub trait ScalingApi: Send + Sync {
    /// Look a group up by name.
    async fn find_group(&self, name: &str) -> CloudResult<Option<RemoteGroup>>;
    /// Create an empty group.
    async fn create_group(&self, spec: &RemoteGroupSpec) -> CloudResult<RemoteGroup>;
    /// Read a group with its current revision.
    async fn get_group(&self, group_id: &str) -> CloudResult<RemoteGroup>;
    /// Stop the group from launching instances.
    async fn pause_group(&self, group_id: &str) -> CloudResult<()>;
    /// Delete the group.
    async fn delete_group(&self, group_id: &str) -> CloudResult<()>;
    /// Members of the group, including ones shutting down.
    async fn list_instances(&self, group_id: &str) -> CloudResult<Vec<GroupInstance>>;
    /// Launch `count` instances if the group is still at `revision`.
    async fn scale_out(&self, group_id: &str, count: u32, revision: u64) -> CloudResult<()>;
    /// Shut the named instances down if the group is still at `revision`.
    async fn scale_in(&self, group_id: &str, victims: &[String], revision: u64)
    -> CloudResult<()>;
}

/// One handle per cloud API, bound to one tenant's credentials.
#[derive(Clone)]
pub struct CloudClients {
    /// Network API.
    pub network: Arc<dyn NetworkApi>,
    /// Compute API.
    pub compute: Arc<dyn ComputeApi>,
    /// Image API.
    pub image: Arc<dyn ImageApi>,
    /// Scaling API.
    pub scaling: Arc<dyn ScalingApi>,
}

impl CloudClients {
    /// Use one provider object for every API.
    pub fn from_provider<P>(provider: Arc<P>) -> Self
    where
        P: NetworkApi + ComputeApi + ImageApi + ScalingApi + 'static,
    {
        Self {
            network: provider.clone(),
            compute: provider.clone(),
            image: provider.clone(),
            scaling: provider,
        }
    }
}

/// Builds region-scoped clients from short-lived credentials.
#[async_trait]
pub trait CloudConnector: Send + Sync {
    /// Build clients for `region` using `credentials`.
    async fn connect(&self, region: &str, credentials: &Credentials) -> CloudResult<CloudClients>;
}
