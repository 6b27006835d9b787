// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for a fleetplane work node.
//!
//! [`FleetRuntime`] wires one work node into an existing tokio application:
//! it registers the node, resumes the workflows the node still owns, and
//! spawns the node monitor, the reconciler and the session dispatcher.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fleetplane_core::SqlitePersistence;
//! use fleetplane_environment::runtime::FleetRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("fleet.db").await?);
//!
//!     let runtime = FleetRuntime::builder()
//!         .persistence(persistence)
//!         .cloud_access(access)
//!         .process_client(client)
//!         .node_id("node-a")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let fleets = runtime.service().list_fleets().await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleetplane_core::NodeRegistry;
use fleetplane_core::persistence::Persistence;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::credentials::CloudAccess;
use crate::dispatcher::{Dispatcher, DispatcherConfig, ProcessClient};
use crate::executor::WorkflowExecutor;
use crate::node_monitor::{NodeMonitor, NodeMonitorConfig};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::service::FleetService;
use crate::steps::StepSettings;
use crate::workflows::PipelineFactory;

/// Builder for creating a [`FleetRuntime`].
pub struct FleetRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    access: Option<Arc<CloudAccess>>,
    process_client: Option<Arc<dyn ProcessClient>>,
    node_id: Option<String>,
    monitor: NodeMonitorConfig,
    reconciler: ReconcilerConfig,
    dispatcher: DispatcherConfig,
    steps: StepSettings,
    placement_timeout: Duration,
    shutdown_grace: Duration,
}

impl Default for FleetRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            access: None,
            process_client: None,
            node_id: None,
            monitor: NodeMonitorConfig::default(),
            reconciler: ReconcilerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            steps: StepSettings::default(),
            placement_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl FleetRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take node id, intervals and wait budgets from loaded configuration.
    pub fn config(mut self, config: &Config) -> Self {
        self.node_id = Some(config.node_id.clone());
        self.monitor = NodeMonitorConfig {
            poll_interval: config.heartbeat_interval,
            stale_after: config.node_stale_after,
        };
        self.reconciler = ReconcilerConfig {
            poll_interval: config.reconcile_interval,
            decision_attempts: config.scaling_decision_attempts,
            lock_timeout: config.scaling_lock_timeout,
        };
        self.dispatcher = DispatcherConfig {
            poll_interval: config.dispatch_interval,
            batch_size: config.dispatch_batch_size,
            round_threshold: config.dispatch_round_threshold,
            activation_timeout: config.activation_timeout,
            picker: config.picker,
        };
        self.steps = StepSettings::from_config(config);
        self.placement_timeout = config.placement_timeout;
        self
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the cloud access used by workflows and the reconciler (required).
    pub fn cloud_access(mut self, access: Arc<CloudAccess>) -> Self {
        self.access = Some(access);
        self
    }

    /// Set the client used to activate sessions on processes (required).
    pub fn process_client(mut self, client: Arc<dyn ProcessClient>) -> Self {
        self.process_client = Some(client);
        self
    }

    /// Set this work node's id.
    ///
    /// Default: a random UUID
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the node monitor configuration.
    pub fn monitor_config(mut self, config: NodeMonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    /// Set the reconciler configuration.
    pub fn reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler = config;
        self
    }

    /// Set the dispatcher configuration.
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    /// Set step wait budgets and retries.
    pub fn step_settings(mut self, settings: StepSettings) -> Self {
        self.steps = settings;
        self
    }

    /// Set how long a new session may wait for placement.
    ///
    /// Default: 60 seconds
    pub fn placement_timeout(mut self, timeout: Duration) -> Self {
        self.placement_timeout = timeout;
        self
    }

    /// Set how long shutdown waits for in-flight workflows.
    ///
    /// Default: 30 seconds
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FleetRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let access = self
            .access
            .ok_or_else(|| anyhow::anyhow!("cloud_access is required"))?;
        let process_client = self
            .process_client
            .ok_or_else(|| anyhow::anyhow!("process_client is required"))?;
        if self.monitor.stale_after <= self.monitor.poll_interval {
            anyhow::bail!("node stale threshold must exceed the heartbeat interval");
        }

        Ok(FleetRuntimeConfig {
            persistence,
            access,
            process_client,
            node_id: self
                .node_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            monitor: self.monitor,
            reconciler: self.reconciler,
            dispatcher: self.dispatcher,
            steps: self.steps,
            placement_timeout: self.placement_timeout,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// Configuration for a [`FleetRuntime`].
pub struct FleetRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    access: Arc<CloudAccess>,
    process_client: Arc<dyn ProcessClient>,
    node_id: String,
    monitor: NodeMonitorConfig,
    reconciler: ReconcilerConfig,
    dispatcher: DispatcherConfig,
    steps: StepSettings,
    placement_timeout: Duration,
    shutdown_grace: Duration,
}

impl FleetRuntimeConfig {
    /// Register the node, resume its workflows and spawn the background workers.
    pub async fn start(self) -> Result<FleetRuntime> {
        let registry = NodeRegistry::new(self.persistence.clone(), self.node_id.clone());
        registry.register().await?;

        let factory = Arc::new(PipelineFactory::new(
            self.persistence.clone(),
            self.access.clone(),
            self.steps,
        ));
        let executor = WorkflowExecutor::new(self.persistence.clone(), factory, &self.node_id);
        let resumed = executor.resume_owned().await?;

        let monitor = NodeMonitor::new(registry.clone(), executor.clone(), self.monitor);
        let monitor_shutdown = monitor.shutdown_handle();
        let monitor_handle = tokio::spawn(async move {
            monitor.run().await;
        });

        let reconciler = Reconciler::new(
            self.persistence.clone(),
            self.access.clone(),
            self.reconciler,
        );
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move {
            reconciler.run().await;
        });

        let dispatcher = Dispatcher::new(
            self.persistence.clone(),
            self.process_client.clone(),
            self.dispatcher,
        );
        let dispatcher_shutdown = dispatcher.shutdown_handle();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run().await;
        });

        let service = FleetService::new(
            self.persistence.clone(),
            executor.clone(),
            self.placement_timeout,
        );

        info!(node_id = %self.node_id, resumed, "FleetRuntime started");

        Ok(FleetRuntime {
            registry,
            executor,
            service,
            monitor_handle,
            reconciler_handle,
            dispatcher_handle,
            monitor_shutdown,
            reconciler_shutdown,
            dispatcher_shutdown,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// A running work node that can be embedded in an application.
///
/// The runtime manages:
/// - the node monitor (heartbeat, dead peer takeover, workflow resumption)
/// - the reconciler (scaling group convergence)
/// - the session dispatcher
/// - workflow executions started through [`service`](Self::service)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FleetRuntime {
    registry: NodeRegistry,
    executor: WorkflowExecutor,
    service: FleetService,
    monitor_handle: JoinHandle<()>,
    reconciler_handle: JoinHandle<()>,
    dispatcher_handle: JoinHandle<()>,
    monitor_shutdown: Arc<Notify>,
    reconciler_shutdown: Arc<Notify>,
    dispatcher_shutdown: Arc<Notify>,
    shutdown_grace: Duration,
}

impl FleetRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FleetRuntimeBuilder {
        FleetRuntimeBuilder::new()
    }

    /// This work node's id.
    pub fn node_id(&self) -> &str {
        self.registry.node_id()
    }

    /// The produced API, acting as this node.
    pub fn service(&self) -> &FleetService {
        &self.service
    }

    /// The executor running this node's workflows.
    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Check if every background worker is still running.
    pub fn is_running(&self) -> bool {
        !self.monitor_handle.is_finished()
            && !self.reconciler_handle.is_finished()
            && !self.dispatcher_handle.is_finished()
    }

    /// Gracefully shut down the node.
    ///
    /// Stops the background workers, then gives in-flight workflows the
    /// shutdown grace period to finish. The node is marked `terminated` only
    /// if it owns nothing resumable afterwards; otherwise it stays registered
    /// so a peer detects its stale heartbeat and takes the work over.
    pub async fn shutdown(self) -> Result<()> {
        info!(node_id = %self.registry.node_id(), "FleetRuntime shutting down...");

        self.monitor_shutdown.notify_one();
        self.reconciler_shutdown.notify_one();
        self.dispatcher_shutdown.notify_one();

        if let Err(e) = self.monitor_handle.await {
            error!("Node monitor task panicked: {}", e);
        }
        if let Err(e) = self.reconciler_handle.await {
            error!("Reconciler task panicked: {}", e);
        }
        if let Err(e) = self.dispatcher_handle.await {
            error!("Session dispatcher task panicked: {}", e);
        }

        if !self.executor.wait_idle(self.shutdown_grace).await {
            warn!(
                in_flight = self.executor.in_flight().await,
                "Workflows still running at shutdown, leaving them for takeover"
            );
            return Ok(());
        }

        let unfinished = self.registry.resumable_workflows().await?.len();
        if unfinished > 0 {
            warn!(unfinished, "Node owns unfinished workflows, leaving them for takeover");
            return Ok(());
        }

        self.registry.shutdown().await?;
        info!("FleetRuntime shutdown complete");
        Ok(())
    }
}
