// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fleetplane-environment integration tests.
//!
//! Everything runs in process: an in-memory SQLite database, the in-memory
//! cloud and process client, and step budgets short enough for tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleetplane_core::persistence::{FleetRecord, Persistence};
use fleetplane_core::state::FleetState;
use fleetplane_core::{RetryPolicy, SqlitePersistence, WaitBudget};
use fleetplane_environment::cloud::{MockCloud, MockConnector};
use fleetplane_environment::credentials::{CloudAccess, CredentialCache, StaticCredentialProvider};
use fleetplane_environment::executor::WorkflowExecutor;
use fleetplane_environment::service::{Capacity, CreateFleetRequest, FleetService};
use fleetplane_environment::steps::StepSettings;
use fleetplane_environment::workflows::PipelineFactory;

/// One simulated work node and the shared in-memory world around it.
pub struct TestNode {
    pub persistence: Arc<dyn Persistence>,
    pub cloud: Arc<MockCloud>,
    pub access: Arc<CloudAccess>,
    pub executor: WorkflowExecutor,
    pub service: FleetService,
}

impl TestNode {
    /// Fresh database and cloud, acting as `node_id`.
    pub async fn new(node_id: &str) -> Self {
        Self::with_cloud(node_id, MockCloud::new()).await
    }

    /// Fresh database over a preconfigured cloud.
    pub async fn with_cloud(node_id: &str, cloud: MockCloud) -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("in-memory sqlite"),
        );
        Self::join(persistence, Arc::new(cloud), node_id).await
    }

    /// Another node sharing this node's database and cloud.
    pub async fn peer(&self, node_id: &str) -> Self {
        Self::join(self.persistence.clone(), self.cloud.clone(), node_id).await
    }

    async fn join(persistence: Arc<dyn Persistence>, cloud: Arc<MockCloud>, node_id: &str) -> Self {
        let access = Arc::new(CloudAccess::new(
            CredentialCache::new(Arc::new(StaticCredentialProvider::default())),
            Arc::new(MockConnector::new(cloud.clone())),
        ));
        let factory = Arc::new(PipelineFactory::new(
            persistence.clone(),
            access.clone(),
            fast_settings(),
        ));
        let executor = WorkflowExecutor::new(persistence.clone(), factory, node_id);
        let service = FleetService::new(
            persistence.clone(),
            executor.clone(),
            Duration::from_secs(60),
        );
        Self {
            persistence,
            cloud,
            access,
            executor,
            service,
        }
    }

    /// Wait until the fleet reaches `state`.
    pub async fn wait_for_fleet(&self, fleet_id: &str, state: FleetState) -> FleetRecord {
        let persistence = self.persistence.clone();
        let fleet_id = fleet_id.to_string();
        eventually(|| {
            let persistence = persistence.clone();
            let fleet_id = fleet_id.clone();
            async move {
                persistence
                    .get_fleet(&fleet_id)
                    .await
                    .expect("get fleet")
                    .filter(|f| f.state == state.as_str())
            }
        })
        .await
        .unwrap_or_else(|| panic!("fleet {fleet_id} never reached {state}"))
    }
}

/// Waits and retries short enough for tests.
pub fn fast_settings() -> StepSettings {
    let wait = WaitBudget::new(Duration::from_millis(5), 50);
    StepSettings {
        resource_wait: wait,
        shutdown_wait: wait,
        image_wait: wait,
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(5),
        },
        lock_timeout: Duration::from_millis(200),
    }
}

pub fn fleet_request(min: i32, max: i32, desired: i32) -> CreateFleetRequest {
    CreateFleetRequest {
        tenant_id: "tenant-1".into(),
        role_id: "role-1".into(),
        name: "arena".into(),
        region: "eu-west-1".into(),
        image_id: "img-base".into(),
        instance_type: "c5.large".into(),
        capacity: Capacity {
            min_size: min,
            max_size: max,
            desired_size: desired,
        },
        cool_down_secs: 0,
    }
}

/// Poll `check` every 10ms for up to 5s until it yields a value.
pub async fn eventually<T, F, Fut>(mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..500 {
        if let Some(value) = check().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}
