// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work node registry and the takeover protocol.
//!
//! Every control-plane process registers itself as a work node and keeps a
//! heartbeat fresh. Peers that stop heartbeating are flipped to `error` and
//! claimed by a live node, which then reassigns their workflows to itself.
//!
//! Takeover runs as separate retry-safe steps:
//!
//! 1. claim: `error -> taking-over` with `take_over_id = self` (CAS)
//! 2. reassign: set owner for every workflow still owned by the dead node
//! 3. complete: `taking-over -> terminated` if the claim is still ours
//!
//! A crash between any two steps leaves the dead node in `taking-over` with
//! a stale absorber, which the next sweep detects and claims again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::persistence::{Persistence, WorkNodeRecord, WorkflowRecord};
use crate::state::NodeState;

/// Result of a takeover attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverOutcome {
    /// This node absorbed the dead node's work.
    Claimed {
        /// Number of workflows moved to this node.
        reassigned: u64,
    },
    /// Another node won the claim, or the node is no longer dead.
    NotClaimed,
}

/// Counters from one detection and takeover pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Nodes found with a stale heartbeat.
    pub detected: usize,
    /// Nodes this pass flipped to `error`.
    pub marked_dead: usize,
    /// Nodes this pass took over.
    pub taken_over: usize,
    /// Workflows moved to this node.
    pub reassigned: u64,
}

/// Registry view for one work node.
#[derive(Clone)]
pub struct NodeRegistry {
    persistence: Arc<dyn Persistence>,
    node_id: String,
}

impl NodeRegistry {
    /// Create a registry acting as `node_id`.
    pub fn new(persistence: Arc<dyn Persistence>, node_id: impl Into<String>) -> Self {
        Self {
            persistence,
            node_id: node_id.into(),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Insert or revive this node as `running`.
    pub async fn register(&self) -> Result<(), CoreError> {
        self.persistence
            .register_node(&self.node_id, Utc::now())
            .await?;
        info!(node_id = %self.node_id, "Work node registered");
        Ok(())
    }

    /// Refresh this node's heartbeat. Returns false if the row is missing.
    pub async fn heartbeat(&self) -> Result<bool, CoreError> {
        self.persistence
            .heartbeat_node(&self.node_id, Utc::now())
            .await
    }

    /// Refresh an arbitrary node's heartbeat. Unknown nodes are a no-op.
    pub async fn heartbeat_node(&self, node_id: &str) -> Result<bool, CoreError> {
        self.persistence.heartbeat_node(node_id, Utc::now()).await
    }

    /// Current state of this node's row, if any.
    pub async fn own_state(&self) -> Result<Option<NodeState>, CoreError> {
        match self.persistence.get_node(&self.node_id).await? {
            Some(record) => Ok(Some(record.state()?)),
            None => Ok(None),
        }
    }

    /// Peers in `running`/`taking-over` whose heartbeat is older than `stale_after`.
    ///
    /// A `taking-over` node is only reported when its absorber is itself
    /// gone or stale, so an in-progress takeover is left alone.
    pub async fn detect_dead(&self, stale_after: Duration) -> Result<Vec<WorkNodeRecord>, CoreError> {
        let cutoff = cutoff(stale_after)?;
        let stale = self.persistence.list_stale_nodes(cutoff).await?;
        if stale.is_empty() {
            return Ok(stale);
        }

        let nodes = self.persistence.list_nodes().await?;
        let absorber_alive = |absorber: &str| {
            absorber != self.node_id
                && nodes.iter().any(|n| {
                    n.node_id == absorber
                        && n.state == NodeState::Running.as_str()
                        && n.last_heartbeat >= cutoff
                })
        };

        let dead = stale
            .into_iter()
            .filter(|n| n.node_id != self.node_id)
            .filter(|n| {
                if n.state == NodeState::TakingOver.as_str() {
                    !n.take_over_id.as_deref().is_some_and(|a| absorber_alive(a))
                } else {
                    true
                }
            })
            .collect();

        Ok(dead)
    }

    /// Flip a detected node to `error`.
    ///
    /// Fails (returns false) if the node heartbeated again or changed state
    /// since detection.
    pub async fn mark_dead(
        &self,
        node: &WorkNodeRecord,
        stale_after: Duration,
    ) -> Result<bool, CoreError> {
        let expected = node.state()?;
        let marked = self
            .persistence
            .mark_node_dead(&node.node_id, expected, cutoff(stale_after)?)
            .await?;
        if marked {
            warn!(
                node_id = %node.node_id,
                last_heartbeat = %node.last_heartbeat,
                "Work node marked dead"
            );
        } else {
            debug!(node_id = %node.node_id, "Node changed since detection, not marking dead");
        }
        Ok(marked)
    }

    /// Absorb a dead node's workflows.
    pub async fn take_over(&self, dead_node_id: &str) -> Result<TakeoverOutcome, CoreError> {
        let claimed = self
            .persistence
            .claim_dead_node(dead_node_id, &self.node_id)
            .await?;

        if !claimed && !self.holds_claim(dead_node_id).await? {
            debug!(dead_node_id, "Dead node claimed elsewhere");
            return Ok(TakeoverOutcome::NotClaimed);
        }

        let reassigned = self
            .persistence
            .reassign_workflows(dead_node_id, &self.node_id)
            .await?;

        if !self
            .persistence
            .complete_takeover(dead_node_id, &self.node_id)
            .await?
        {
            warn!(dead_node_id, "Takeover claim lost before completion");
        }

        info!(
            dead_node_id,
            node_id = %self.node_id,
            reassigned,
            "Took over dead node"
        );
        Ok(TakeoverOutcome::Claimed { reassigned })
    }

    /// Detect, mark and take over every dead peer.
    pub async fn sweep(&self, stale_after: Duration) -> Result<SweepReport, CoreError> {
        let dead = self.detect_dead(stale_after).await?;
        let mut report = SweepReport {
            detected: dead.len(),
            ..SweepReport::default()
        };

        for node in dead {
            if self.mark_dead(&node, stale_after).await? {
                report.marked_dead += 1;
            }
        }

        // Includes nodes a crashed peer marked dead but never claimed
        let unclaimed: Vec<String> = self
            .persistence
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.node_id != self.node_id && n.state == NodeState::Error.as_str())
            .map(|n| n.node_id)
            .collect();

        for dead_node_id in unclaimed {
            if let TakeoverOutcome::Claimed { reassigned } = self.take_over(&dead_node_id).await? {
                report.taken_over += 1;
                report.reassigned += reassigned;
            }
        }

        Ok(report)
    }

    /// Workflows owned by this node that the engine should (re-)enter.
    pub async fn resumable_workflows(&self) -> Result<Vec<WorkflowRecord>, CoreError> {
        let owned = self
            .persistence
            .list_workflows_by_owner(&self.node_id)
            .await?;

        Ok(owned
            .into_iter()
            .filter(|wf| wf.state().is_ok_and(|s| s.is_resumable()))
            .collect())
    }

    /// Graceful stop: `running -> terminated`.
    pub async fn shutdown(&self) -> Result<bool, CoreError> {
        let stopped = self
            .persistence
            .try_transition_node(&self.node_id, NodeState::Running, NodeState::Terminated)
            .await?;
        info!(node_id = %self.node_id, stopped, "Work node shut down");
        Ok(stopped)
    }

    async fn holds_claim(&self, dead_node_id: &str) -> Result<bool, CoreError> {
        let Some(node) = self.persistence.get_node(dead_node_id).await? else {
            return Ok(false);
        };
        Ok(node.state == NodeState::TakingOver.as_str()
            && node.take_over_id.as_deref() == Some(self.node_id.as_str()))
    }
}

fn cutoff(stale_after: Duration) -> Result<DateTime<Utc>, CoreError> {
    let stale = chrono::Duration::from_std(stale_after)
        .map_err(|e| CoreError::validation("stale_after", e.to_string()))?;
    Ok(Utc::now() - stale)
}
