// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker keeping this work node alive and absorbing dead peers.
//!
//! Every cycle the monitor:
//! - refreshes this node's heartbeat
//! - detects peers whose heartbeat went stale, marks them dead and takes
//!   their workflows over
//! - hands every resumable workflow this node now owns to the executor
//!
//! A node that finds its own row is no longer `running` has been declared
//! dead by a peer. Its workflow writes are already fenced; once the peer
//! has finished absorbing it, the node registers again as a fresh member.

use std::time::Duration;

use fleetplane_core::NodeRegistry;
use fleetplane_core::state::NodeState;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::executor::WorkflowExecutor;

/// Configuration for the node monitor.
#[derive(Debug, Clone)]
pub struct NodeMonitorConfig {
    /// How often to heartbeat and scan for dead peers.
    pub poll_interval: Duration,
    /// Heartbeat age after which a peer is considered dead.
    pub stale_after: Duration,
}

impl Default for NodeMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Heartbeat, dead-node detection, takeover and resumption.
pub struct NodeMonitor {
    registry: NodeRegistry,
    executor: WorkflowExecutor,
    config: NodeMonitorConfig,
    shutdown: Arc<Notify>,
}

impl NodeMonitor {
    /// Create a new node monitor.
    pub fn new(
        registry: NodeRegistry,
        executor: WorkflowExecutor,
        config: NodeMonitorConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            node_id = %self.registry.node_id(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Node monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Node monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Node monitor cycle failed");
                    }
                }
            }
        }

        info!("Node monitor stopped");
    }

    /// One monitor cycle.
    pub async fn tick(&self) -> Result<()> {
        if !self.check_self().await? {
            return Ok(());
        }

        let report = self.registry.sweep(self.config.stale_after).await?;
        if report.taken_over > 0 {
            info!(
                detected = report.detected,
                marked_dead = report.marked_dead,
                taken_over = report.taken_over,
                reassigned = report.reassigned,
                "Absorbed dead nodes"
            );
        } else if report.detected > 0 {
            debug!(detected = report.detected, "Stale nodes seen, none claimed");
        }

        self.executor.resume_owned().await?;
        Ok(())
    }

    /// Heartbeat, and check this node is still a live member.
    async fn check_self(&self) -> Result<bool> {
        self.registry.heartbeat().await?;

        match self.registry.own_state().await? {
            Some(NodeState::Running) => Ok(true),
            None | Some(NodeState::Terminated) => {
                warn!(
                    node_id = %self.registry.node_id(),
                    "Node was absorbed by a peer, registering again"
                );
                self.registry.register().await?;
                Ok(true)
            }
            Some(state) => {
                error!(
                    node_id = %self.registry.node_id(),
                    state = %state,
                    "Node has been fenced by a peer, waiting for takeover to finish"
                );
                Ok(false)
            }
        }
    }
}
