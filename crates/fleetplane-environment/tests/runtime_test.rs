// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the embeddable runtime.
//!
//! A full work node with fast worker intervals: fleet creation, background
//! scaling and session placement, then a graceful shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use fleetplane_core::state::{FleetState, NodeState, SessionState};
use fleetplane_environment::dispatcher::{DispatcherConfig, MockProcessClient};
use fleetplane_environment::node_monitor::NodeMonitorConfig;
use fleetplane_environment::reconciler::ReconcilerConfig;
use fleetplane_environment::runtime::FleetRuntime;
use fleetplane_environment::service::RegisterProcessRequest;

#[tokio::test]
async fn test_runtime_serves_fleet_until_shutdown() {
    let world = TestNode::new("unused").await;

    let runtime = FleetRuntime::builder()
        .persistence(world.persistence.clone())
        .cloud_access(world.access.clone())
        .process_client(Arc::new(MockProcessClient::new()))
        .node_id("node-a")
        .monitor_config(NodeMonitorConfig {
            poll_interval: Duration::from_millis(20),
            stale_after: Duration::from_secs(30),
        })
        .reconciler_config(ReconcilerConfig {
            poll_interval: Duration::from_millis(20),
            ..ReconcilerConfig::default()
        })
        .dispatcher_config(DispatcherConfig {
            poll_interval: Duration::from_millis(20),
            ..DispatcherConfig::default()
        })
        .step_settings(fast_settings())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert_eq!(runtime.node_id(), "node-a");
    assert!(runtime.is_running());

    let service = runtime.service().clone();
    let created = service.create_fleet(fleet_request(0, 4, 2)).await.unwrap();
    world
        .wait_for_fleet(&created.fleet_id, FleetState::Active)
        .await;

    let remote = service
        .get_scaling_group(&created.group_id)
        .await
        .unwrap()
        .remote_group_id
        .unwrap();
    let cloud = world.cloud.clone();
    eventually(|| {
        let cloud = cloud.clone();
        let remote = remote.clone();
        async move { (cloud.live_instances(&remote).await == 2).then_some(()) }
    })
    .await
    .expect("reconciler never scaled the group out");

    service
        .register_process(RegisterProcessRequest {
            fleet_id: created.fleet_id.clone(),
            instance_id: "i-1".into(),
            address: "10.0.1.5:7777".into(),
            max_sessions: 4,
        })
        .await
        .unwrap();
    let session = service.create_session(&created.fleet_id, 8).await.unwrap();
    eventually(|| {
        let service = service.clone();
        let session_id = session.session_id.clone();
        async move {
            service
                .get_session(&session_id)
                .await
                .ok()
                .filter(|s| s.state == SessionState::Active.as_str())
        }
    })
    .await
    .expect("session never became active");

    runtime.shutdown().await.unwrap();

    let node = world.persistence.get_node("node-a").await.unwrap().unwrap();
    assert_eq!(node.state().unwrap(), NodeState::Terminated);
}

#[test]
fn test_builder_requires_dependencies() {
    assert!(FleetRuntime::builder().build().is_err());

    let err = FleetRuntime::builder()
        .monitor_config(NodeMonitorConfig {
            poll_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(10),
        })
        .build();
    assert!(err.is_err());
}
