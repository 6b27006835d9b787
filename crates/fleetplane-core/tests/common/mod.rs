// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fleetplane-core integration tests.
//!
//! Provides an in-memory database shared by several simulated work nodes
//! and a few scripted steps.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use fleetplane_core::persistence::NewWorkflow;
use fleetplane_core::state::TaskType;
use fleetplane_core::{
    ExecutionContext, Persistence, RetryPolicy, SqlitePersistence, Step, StepError,
};

/// Fresh migrated in-memory database.
pub async fn persistence() -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::in_memory()
            .await
            .expect("in-memory sqlite"),
    )
}

/// Register a node whose heartbeat is ten minutes old.
pub async fn register_stale_node(persistence: &Arc<dyn Persistence>, node_id: &str) {
    persistence
        .register_node(node_id, Utc::now() - chrono::Duration::minutes(10))
        .await
        .expect("register stale node");
}

/// Persist a `create-fleet` workflow owned by `owner`.
pub async fn create_workflow(persistence: &Arc<dyn Persistence>, workflow_id: &str, owner: &str) {
    persistence
        .create_workflow(
            &NewWorkflow {
                workflow_id: workflow_id.to_string(),
                resource_id: format!("fleet-{workflow_id}"),
                task_type: TaskType::CreateFleet,
                params: b"{}".to_vec(),
                context: ExecutionContext::new().with("region", "eu-west-1"),
                owner_node_id: owner.to_string(),
            },
            Utc::now(),
        )
        .await
        .expect("create workflow");
}

/// Shared record of external side effects, keyed by resource name.
#[derive(Default, Clone)]
pub struct FakeInfra {
    resources: Arc<Mutex<Vec<String>>>,
    creates: Arc<AtomicU32>,
}

impl FakeInfra {
    pub fn resources(&self) -> Vec<String> {
        self.resources.lock().unwrap().clone()
    }

    pub fn create_calls(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }
}

/// Idempotent "create resource" step: looks the resource up before creating it.
pub struct EnsureResource {
    pub name: &'static str,
    pub infra: FakeInfra,
}

#[async_trait]
impl Step for EnsureResource {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        let mut resources = self.infra.resources.lock().unwrap();
        if !resources.iter().any(|r| r == self.name) {
            self.infra.creates.fetch_add(1, Ordering::SeqCst);
            resources.push(self.name.to_string());
        }
        Ok(ExecutionContext::new().with(format!("{}_id", self.name), self.name))
    }

    async fn rollback(&self, _ctx: &ExecutionContext) -> Result<Vec<String>, StepError> {
        // Already gone counts as deleted
        self.infra.resources.lock().unwrap().retain(|r| r != self.name);
        Ok(vec![format!("{}_id", self.name)])
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff: Duration::ZERO,
        }
    }
}

/// Step that always fails terminally.
pub struct AlwaysFails;

#[async_trait]
impl Step for AlwaysFails {
    fn name(&self) -> &str {
        "always-fails"
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<ExecutionContext, StepError> {
        Err(StepError::Terminal("instance limit exceeded".into()))
    }
}
