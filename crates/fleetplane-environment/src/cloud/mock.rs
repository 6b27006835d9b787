// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cloud provider for local runs and tests.
//!
//! Asynchronous resources (subnets, instances, images, group members) become
//! ready after a configurable number of status reads. Every call is counted,
//! and failures can be queued per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CloudClients, CloudConnector, CloudError, CloudResult, ComputeApi, GroupInstance, Image,
    ImageApi, ImageStatus, Instance, InstanceSpec, InstanceStatus, NetworkApi, RemoteGroup,
    RemoteGroupSpec, ScalingApi, SecurityGroup, Subnet, SubnetStatus, Vpc,
};
use crate::credentials::Credentials;

/// Snapshot of how many resources of each kind exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    /// VPCs.
    pub vpcs: usize,
    /// Subnets.
    pub subnets: usize,
    /// Security groups.
    pub security_groups: usize,
    /// Standalone instances.
    pub instances: usize,
    /// Images.
    pub images: usize,
    /// Remote scaling groups.
    pub groups: usize,
}

/// A resource whose status advances after some reads.
#[derive(Debug, Clone)]
struct Progressing<T> {
    value: T,
    reads_left: u32,
}

impl<T> Progressing<T> {
    fn new(value: T, reads_left: u32) -> Self {
        Self { value, reads_left }
    }

    /// Count one read; returns true when the resource should advance.
    fn tick(&mut self) -> bool {
        if self.reads_left == 0 {
            return true;
        }
        self.reads_left -= 1;
        false
    }
}

#[derive(Debug)]
struct MockGroup {
    group: RemoteGroup,
    members: Vec<Progressing<GroupInstance>>,
}

#[derive(Default)]
struct CloudState {
    vpcs: HashMap<String, Vpc>,
    subnets: HashMap<String, Progressing<Subnet>>,
    security_groups: HashMap<String, SecurityGroup>,
    instances: HashMap<String, Progressing<Instance>>,
    images: HashMap<String, Progressing<Image>>,
    groups: HashMap<String, MockGroup>,
    calls: HashMap<&'static str, u32>,
    faults: HashMap<&'static str, VecDeque<CloudError>>,
    forced_expirations: u32,
}

impl CloudState {
    /// Count the call and pop a queued fault for it, if any.
    fn enter(&mut self, op: &'static str) -> CloudResult<()> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn group_mut(&mut self, group_id: &str) -> CloudResult<&mut MockGroup> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| CloudError::not_found("scaling group", group_id))
    }

    /// Apply the revision check every scaling write goes through.
    fn check_decision(&mut self, group_id: &str, revision: u64) -> CloudResult<()> {
        if self.forced_expirations > 0 {
            if self.forced_expirations != u32::MAX {
                self.forced_expirations -= 1;
            }
            return Err(CloudError::DecisionExpired(group_id.to_string()));
        }
        let group = self.group_mut(group_id)?;
        if group.group.revision != revision {
            return Err(CloudError::DecisionExpired(group_id.to_string()));
        }
        Ok(())
    }
}

fn new_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..12])
}

/// In-memory implementation of every cloud API.
pub struct MockCloud {
    state: Mutex<CloudState>,
    ready_after: u32,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    /// Resources become ready on the second status read.
    pub fn new() -> Self {
        Self::with_ready_after(1)
    }

    /// Resources become ready after `reads` not-ready status reads.
    pub fn with_ready_after(reads: u32) -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            ready_after: reads,
        }
    }

    /// Make every scaling write fail with [`CloudError::DecisionExpired`].
    pub async fn always_expire(&self) {
        self.state.lock().await.forced_expirations = u32::MAX;
    }

    /// Make the next `n` scaling writes fail with [`CloudError::DecisionExpired`].
    pub async fn expire_next(&self, n: u32) {
        self.state.lock().await.forced_expirations = n;
    }

    /// Queue an error for the next call of `op` (e.g. `"create_subnet"`).
    pub async fn fail_next(&self, op: &'static str, err: CloudError) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// How many times `op` was called.
    pub async fn calls(&self, op: &str) -> u32 {
        self.state
            .lock()
            .await
            .calls
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    /// Current resource counts.
    pub async fn resource_counts(&self) -> ResourceCounts {
        let state = self.state.lock().await;
        ResourceCounts {
            vpcs: state.vpcs.len(),
            subnets: state.subnets.len(),
            security_groups: state.security_groups.len(),
            instances: state.instances.len(),
            images: state.images.len(),
            groups: state.groups.len(),
        }
    }

    /// Members of a group that are pending or running, without advancing them.
    pub async fn live_instances(&self, group_id: &str) -> usize {
        self.state
            .lock()
            .await
            .groups
            .get(group_id)
            .map(|g| {
                g.members
                    .iter()
                    .filter(|m| m.value.status.is_live())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Simulate a concurrent edit of a group by another client.
    pub async fn touch_group(&self, group_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.group_mut(group_id)?.group.revision += 1;
        Ok(())
    }
}

#[async_trait]
impl NetworkApi for MockCloud {
    async fn find_vpc(&self, name: &str) -> CloudResult<Option<Vpc>> {
        let mut state = self.state.lock().await;
        state.enter("find_vpc")?;
        Ok(state.vpcs.values().find(|v| v.name == name).cloned())
    }

    async fn create_vpc(&self, name: &str, cidr: &str) -> CloudResult<Vpc> {
        let mut state = self.state.lock().await;
        state.enter("create_vpc")?;
        if state.vpcs.values().any(|v| v.name == name) {
            return Err(CloudError::AlreadyExists {
                kind: "vpc",
                id: name.to_string(),
            });
        }
        let vpc = Vpc {
            vpc_id: new_id("vpc"),
            name: name.to_string(),
            cidr: cidr.to_string(),
        };
        state.vpcs.insert(vpc.vpc_id.clone(), vpc.clone());
        Ok(vpc)
    }

    async fn delete_vpc(&self, vpc_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("delete_vpc")?;
        let has_dependents = state.subnets.values().any(|s| s.value.vpc_id == vpc_id)
            || state.security_groups.values().any(|g| g.vpc_id == vpc_id);
        if has_dependents {
            return Err(CloudError::Rejected(format!(
                "vpc '{vpc_id}' still has dependent resources"
            )));
        }
        state
            .vpcs
            .remove(vpc_id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("vpc", vpc_id))
    }

    async fn find_subnet(&self, vpc_id: &str, name: &str) -> CloudResult<Option<Subnet>> {
        let mut state = self.state.lock().await;
        state.enter("find_subnet")?;
        Ok(state
            .subnets
            .values()
            .find(|s| s.value.vpc_id == vpc_id && s.value.name == name)
            .map(|s| s.value.clone()))
    }

    async fn create_subnet(&self, vpc_id: &str, name: &str, cidr: &str) -> CloudResult<Subnet> {
        let mut state = self.state.lock().await;
        state.enter("create_subnet")?;
        if !state.vpcs.contains_key(vpc_id) {
            return Err(CloudError::not_found("vpc", vpc_id));
        }
        if state
            .subnets
            .values()
            .any(|s| s.value.vpc_id == vpc_id && s.value.name == name)
        {
            return Err(CloudError::AlreadyExists {
                kind: "subnet",
                id: name.to_string(),
            });
        }
        let subnet = Subnet {
            subnet_id: new_id("subnet"),
            vpc_id: vpc_id.to_string(),
            name: name.to_string(),
            cidr: cidr.to_string(),
            status: SubnetStatus::Pending,
        };
        state.subnets.insert(
            subnet.subnet_id.clone(),
            Progressing::new(subnet.clone(), self.ready_after),
        );
        Ok(subnet)
    }

    async fn get_subnet(&self, subnet_id: &str) -> CloudResult<Subnet> {
        let mut state = self.state.lock().await;
        state.enter("get_subnet")?;
        let entry = state
            .subnets
            .get_mut(subnet_id)
            .ok_or_else(|| CloudError::not_found("subnet", subnet_id))?;
        if entry.value.status == SubnetStatus::Pending && entry.tick() {
            entry.value.status = SubnetStatus::Active;
        }
        Ok(entry.value.clone())
    }

    async fn delete_subnet(&self, subnet_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("delete_subnet")?;
        state
            .subnets
            .remove(subnet_id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("subnet", subnet_id))
    }

    async fn find_security_group(
        &self,
        vpc_id: &str,
        name: &str,
    ) -> CloudResult<Option<SecurityGroup>> {
        let mut state = self.state.lock().await;
        state.enter("find_security_group")?;
        Ok(state
            .security_groups
            .values()
            .find(|g| g.vpc_id == vpc_id && g.name == name)
            .cloned())
    }

    async fn create_security_group(&self, vpc_id: &str, name: &str) -> CloudResult<SecurityGroup> {
        let mut state = self.state.lock().await;
        state.enter("create_security_group")?;
        if !state.vpcs.contains_key(vpc_id) {
            return Err(CloudError::not_found("vpc", vpc_id));
        }
        let group = SecurityGroup {
            security_group_id: new_id("sg"),
            vpc_id: vpc_id.to_string(),
            name: name.to_string(),
        };
        state
            .security_groups
            .insert(group.security_group_id.clone(), group.clone());
        Ok(group)
    }

    async fn delete_security_group(&self, security_group_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("delete_security_group")?;
        state
            .security_groups
            .remove(security_group_id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("security group", security_group_id))
    }
}

#[async_trait]
impl ComputeApi for MockCloud {
    async fn find_instance(&self, name: &str) -> CloudResult<Option<Instance>> {
        let mut state = self.state.lock().await;
        state.enter("find_instance")?;
        Ok(state
            .instances
            .values()
            .find(|i| i.value.name == name)
            .map(|i| i.value.clone()))
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> CloudResult<Instance> {
        let mut state = self.state.lock().await;
        state.enter("create_instance")?;
        if !state.subnets.contains_key(&spec.subnet_id) {
            return Err(CloudError::not_found("subnet", &spec.subnet_id));
        }
        let instance = Instance {
            instance_id: new_id("i"),
            name: spec.name.clone(),
            image_id: spec.image_id.clone(),
            instance_type: spec.instance_type.clone(),
            subnet_id: spec.subnet_id.clone(),
            status: InstanceStatus::Pending,
        };
        state.instances.insert(
            instance.instance_id.clone(),
            Progressing::new(instance.clone(), self.ready_after),
        );
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> CloudResult<Instance> {
        let mut state = self.state.lock().await;
        state.enter("get_instance")?;
        let entry = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::not_found("instance", instance_id))?;
        let status = entry.value.status;
        match status {
            InstanceStatus::Pending if entry.tick() => entry.value.status = InstanceStatus::Running,
            InstanceStatus::Stopping if entry.tick() => entry.value.status = InstanceStatus::Stopped,
            _ => {}
        }
        Ok(entry.value.clone())
    }

    async fn stop_instance(&self, instance_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("stop_instance")?;
        let ready_after = self.ready_after;
        let entry = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| CloudError::not_found("instance", instance_id))?;
        if entry.value.status.is_live() {
            entry.value.status = InstanceStatus::Stopping;
            entry.reads_left = ready_after;
        }
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("delete_instance")?;
        state
            .instances
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("instance", instance_id))
    }
}

#[async_trait]
impl ImageApi for MockCloud {
    async fn find_image(&self, name: &str) -> CloudResult<Option<Image>> {
        let mut state = self.state.lock().await;
        state.enter("find_image")?;
        Ok(state
            .images
            .values()
            .find(|i| i.value.name == name)
            .map(|i| i.value.clone()))
    }

    async fn create_image(&self, name: &str, instance_id: &str) -> CloudResult<Image> {
        let mut state = self.state.lock().await;
        state.enter("create_image")?;
        let source = state
            .instances
            .get(instance_id)
            .ok_or_else(|| CloudError::not_found("instance", instance_id))?;
        if source.value.status != InstanceStatus::Stopped {
            return Err(CloudError::Rejected(format!(
                "instance '{instance_id}' must be stopped before imaging"
            )));
        }
        let image = Image {
            image_id: new_id("img"),
            name: name.to_string(),
            status: ImageStatus::Building,
        };
        state.images.insert(
            image.image_id.clone(),
            Progressing::new(image.clone(), self.ready_after),
        );
        Ok(image)
    }

    async fn get_image(&self, image_id: &str) -> CloudResult<Image> {
        let mut state = self.state.lock().await;
        state.enter("get_image")?;
        let entry = state
            .images
            .get_mut(image_id)
            .ok_or_else(|| CloudError::not_found("image", image_id))?;
        if entry.value.status == ImageStatus::Building && entry.tick() {
            entry.value.status = ImageStatus::Available;
        }
        Ok(entry.value.clone())
    }

    async fn delete_image(&self, image_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("delete_image")?;
        state
            .images
            .remove(image_id)
            .map(|_| ())
            .ok_or_else(|| CloudError::not_found("image", image_id))
    }
}

#[async_trait]
impl ScalingApi for MockCloud {
    async fn find_group(&self, name: &str) -> CloudResult<Option<RemoteGroup>> {
        let mut state = self.state.lock().await;
        state.enter("find_group")?;
        Ok(state
            .groups
            .values()
            .find(|g| g.group.name == name)
            .map(|g| g.group.clone()))
    }

    async fn create_group(&self, spec: &RemoteGroupSpec) -> CloudResult<RemoteGroup> {
        let mut state = self.state.lock().await;
        state.enter("create_group")?;
        if state.groups.values().any(|g| g.group.name == spec.name) {
            return Err(CloudError::AlreadyExists {
                kind: "scaling group",
                id: spec.name.clone(),
            });
        }
        if !state.subnets.contains_key(&spec.subnet_id) {
            return Err(CloudError::not_found("subnet", &spec.subnet_id));
        }
        let group = RemoteGroup {
            group_id: new_id("asg"),
            name: spec.name.clone(),
            revision: 1,
            paused: false,
        };
        state.groups.insert(
            group.group_id.clone(),
            MockGroup {
                group: group.clone(),
                members: Vec::new(),
            },
        );
        Ok(group)
    }

    async fn get_group(&self, group_id: &str) -> CloudResult<RemoteGroup> {
        let mut state = self.state.lock().await;
        state.enter("get_group")?;
        Ok(state.group_mut(group_id)?.group.clone())
    }

    async fn pause_group(&self, group_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("pause_group")?;
        let group = state.group_mut(group_id)?;
        if !group.group.paused {
            group.group.paused = true;
            group.group.revision += 1;
        }
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("delete_group")?;
        let group = state.group_mut(group_id)?;
        if group
            .members
            .iter()
            .any(|m| m.value.status != InstanceStatus::Stopped)
        {
            return Err(CloudError::Rejected(format!(
                "group '{group_id}' still has instances that are not shut off"
            )));
        }
        state.groups.remove(group_id);
        Ok(())
    }

    async fn list_instances(&self, group_id: &str) -> CloudResult<Vec<GroupInstance>> {
        let mut state = self.state.lock().await;
        state.enter("list_instances")?;
        let group = state.group_mut(group_id)?;
        for member in &mut group.members {
            let status = member.value.status;
            match status {
                InstanceStatus::Pending if member.tick() => {
                    member.value.status = InstanceStatus::Running
                }
                InstanceStatus::Stopping if member.tick() => {
                    member.value.status = InstanceStatus::Stopped
                }
                _ => {}
            }
        }
        Ok(group.members.iter().map(|m| m.value.clone()).collect())
    }

    async fn scale_out(&self, group_id: &str, count: u32, revision: u64) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("scale_out")?;
        state.check_decision(group_id, revision)?;
        let ready_after = self.ready_after;
        let group = state.group_mut(group_id)?;
        if group.group.paused {
            return Err(CloudError::Rejected(format!("group '{group_id}' is paused")));
        }
        for _ in 0..count {
            group.members.push(Progressing::new(
                GroupInstance {
                    instance_id: new_id("i"),
                    status: InstanceStatus::Pending,
                    launched_at: Utc::now(),
                },
                ready_after,
            ));
        }
        group.group.revision += 1;
        Ok(())
    }

    async fn scale_in(
        &self,
        group_id: &str,
        victims: &[String],
        revision: u64,
    ) -> CloudResult<()> {
        let mut state = self.state.lock().await;
        state.enter("scale_in")?;
        state.check_decision(group_id, revision)?;
        let ready_after = self.ready_after;
        let group = state.group_mut(group_id)?;
        for victim in victims {
            let member = group
                .members
                .iter_mut()
                .find(|m| &m.value.instance_id == victim)
                .ok_or_else(|| CloudError::not_found("instance", victim))?;
            if member.value.status.is_live() {
                member.value.status = InstanceStatus::Stopping;
                member.reads_left = ready_after;
            }
        }
        group.group.revision += 1;
        Ok(())
    }
}

/// Connector handing out clients backed by one shared [`MockCloud`].
pub struct MockConnector {
    cloud: Arc<MockCloud>,
    connects: AtomicU32,
}

impl MockConnector {
    /// Wrap a mock cloud.
    pub fn new(cloud: Arc<MockCloud>) -> Self {
        Self {
            cloud,
            connects: AtomicU32::new(0),
        }
    }

    /// The backing cloud.
    pub fn cloud(&self) -> &Arc<MockCloud> {
        &self.cloud
    }

    /// Number of successful connects.
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudConnector for MockConnector {
    async fn connect(&self, region: &str, credentials: &Credentials) -> CloudResult<CloudClients> {
        if credentials.is_expired(Utc::now()) {
            return Err(CloudError::Rejected(format!(
                "credentials for region '{region}' have expired"
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(CloudClients::from_provider(self.cloud.clone()))
    }
}
