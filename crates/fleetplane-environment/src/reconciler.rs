// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation control loop for scaling groups.
//!
//! Each pass locks a `stable` group with the `stable -> scaling` CAS, reads
//! the live member count from the scaling API, and issues one scale-out or
//! scale-in towards the target. The write carries the revision that was
//! read; if the group changed in between the provider answers "decision
//! expired" and the whole decision is made again, a bounded number of
//! times. Running out of attempts moves the group to `error`.
//!
//! The lock is the row's state, aged by `updated_at`. A holder that died
//! mid-change leaves the group in `scaling`; once the lock is older than
//! [`ReconcilerConfig::lock_timeout`] the next pass releases it. The
//! cool-down is read from the row too, so every node honours it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetplane_core::CoreError;
use fleetplane_core::persistence::{Persistence, ScalingGroupRecord, ScalingPolicyRecord};
use fleetplane_core::state::ScalingGroupState;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudError, GroupInstance, InstanceStatus, ScalingApi};
use crate::credentials::CloudAccess;
use crate::error::{Error, Result};

/// The only metric policies can track.
pub const SESSION_UTILIZATION: &str = "session_utilization";

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to reconcile every stable group.
    pub poll_interval: Duration,
    /// Attempts at one scaling decision before giving up.
    pub decision_attempts: u32,
    /// Age after which a `scaling` lock is presumed abandoned.
    pub lock_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            decision_attempts: 3,
            lock_timeout: Duration::from_secs(300),
        }
    }
}

/// How the target instance count is derived.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetMode {
    /// The group's explicit desired count.
    Fixed(u32),
    /// Track session utilization towards the policies' target values.
    Tracking {
        /// Current sessions over session capacity, if any process reports.
        utilization: Option<f64>,
        /// Target utilization per policy.
        targets: Vec<f64>,
        /// Size to start from while the group has no members to measure.
        initial: u32,
    },
}

/// Target instance count for a group, bounded by its min and max.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingTarget {
    /// Lower bound.
    pub min: u32,
    /// Upper bound.
    pub max: u32,
    /// How the unbounded target is derived.
    pub mode: TargetMode,
}

impl ScalingTarget {
    /// Target from the group record, its policies and its fleet's session load.
    pub fn for_group(
        group: &ScalingGroupRecord,
        policies: &[ScalingPolicyRecord],
        utilization: Option<f64>,
    ) -> Self {
        let targets: Vec<f64> = policies
            .iter()
            .filter(|p| p.metric == SESSION_UTILIZATION && p.target_value > 0.0)
            .map(|p| p.target_value)
            .collect();

        let mode = if group.enable_auto_scaling && !targets.is_empty() {
            TargetMode::Tracking {
                utilization,
                targets,
                initial: non_negative(group.desired_size).max(1),
            }
        } else {
            TargetMode::Fixed(non_negative(group.desired_size))
        };

        Self {
            min: non_negative(group.min_size),
            max: non_negative(group.max_size),
            mode,
        }
    }

    /// Target given the current live count.
    pub fn resolve(&self, current: u32) -> u32 {
        let unbounded = match &self.mode {
            TargetMode::Fixed(desired) => *desired,
            // Load is a multiple of the current size, so an empty group
            // would stay empty
            TargetMode::Tracking { initial, .. } if current == 0 => *initial,
            // No load reported yet: hold the current size
            TargetMode::Tracking {
                utilization: None, ..
            } => current,
            TargetMode::Tracking {
                utilization: Some(utilization),
                targets,
                ..
            } => targets
                .iter()
                .map(|target| (f64::from(current) * utilization / target).ceil() as u32)
                .max()
                .unwrap_or(current),
        };
        unbounded.clamp(self.min, self.max.max(self.min))
    }
}

/// What one decision did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingDecision {
    /// Already at target.
    None {
        /// Live instances.
        current: u32,
    },
    /// Launched instances.
    ScaleOut {
        /// Live instances before the change.
        current: u32,
        /// Instances launched.
        count: u32,
    },
    /// Shut instances down.
    ScaleIn {
        /// Live instances before the change.
        current: u32,
        /// Instances shut down.
        victims: Vec<String>,
    },
}

/// Result of reconciling one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A decision was made and applied.
    Decided(ScalingDecision),
    /// The group is held by another change.
    Locked,
    /// The group is not reconcilable right now (not stable, no remote group,
    /// or cooling down).
    Skipped,
}

/// Make one scaling decision and apply it, re-deciding on expiry.
///
/// Fails with [`Error::DecisionRetriesExhausted`] once `attempts` decisions
/// in a row have expired.
pub async fn decide_and_apply(
    scaling: &dyn ScalingApi,
    group_id: &str,
    remote_group_id: &str,
    target: &ScalingTarget,
    attempts: u32,
) -> Result<ScalingDecision> {
    for attempt in 1..=attempts {
        let group = scaling.get_group(remote_group_id).await?;
        let live: Vec<GroupInstance> = scaling
            .list_instances(remote_group_id)
            .await?
            .into_iter()
            .filter(|i| i.status.is_live())
            .collect();
        let current = u32::try_from(live.len()).unwrap_or(u32::MAX);
        let wanted = target.resolve(current);

        let (decision, applied) = if current < wanted {
            let count = wanted - current;
            let applied = scaling
                .scale_out(remote_group_id, count, group.revision)
                .await;
            (ScalingDecision::ScaleOut { current, count }, applied)
        } else if current > wanted {
            let victims = pick_victims(live, (current - wanted) as usize);
            let applied = scaling
                .scale_in(remote_group_id, &victims, group.revision)
                .await;
            (ScalingDecision::ScaleIn { current, victims }, applied)
        } else {
            return Ok(ScalingDecision::None { current });
        };

        match applied {
            Ok(()) => return Ok(decision),
            Err(CloudError::DecisionExpired(_)) => {
                warn!(group_id, attempt, attempts, "Scaling decision expired, deciding again");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::DecisionRetriesExhausted {
        group_id: group_id.to_string(),
        attempts,
    })
}

/// Pending instances first (they serve nobody yet), then the newest.
fn pick_victims(mut live: Vec<GroupInstance>, count: usize) -> Vec<String> {
    live.sort_by(|a, b| {
        let a_pending = a.status == InstanceStatus::Pending;
        let b_pending = b.status == InstanceStatus::Pending;
        b_pending
            .cmp(&a_pending)
            .then_with(|| b.launched_at.cmp(&a.launched_at))
    });
    live.into_iter()
        .take(count)
        .map(|i| i.instance_id)
        .collect()
}

/// Locks last touched before the returned instant count as abandoned.
pub fn lock_cutoff(lock_timeout: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(lock_timeout)
        .ok()
        .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
}

fn non_negative(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

/// Background worker reconciling every stable scaling group.
pub struct Reconciler {
    persistence: Arc<dyn Persistence>,
    access: Arc<CloudAccess>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        access: Arc<CloudAccess>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            persistence,
            access,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            decision_attempts = self.config.decision_attempts,
            lock_timeout_secs = self.config.lock_timeout.as_secs(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reconcile_all().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Reconcile every stable group once, after releasing abandoned locks.
    /// Per-group failures are logged.
    pub async fn reconcile_all(&self) -> Result<usize> {
        self.release_stale_locks().await?;

        let groups = self
            .persistence
            .list_scaling_groups(ScalingGroupState::Stable)
            .await?;

        let mut changed = 0;
        for group in groups {
            match self.reconcile_group(&group.group_id).await {
                Ok(ReconcileOutcome::Decided(ScalingDecision::None { .. })) => {}
                Ok(ReconcileOutcome::Decided(_)) => changed += 1,
                Ok(ReconcileOutcome::Locked) => {
                    debug!(group_id = %group.group_id, "Group locked, skipping this pass")
                }
                Ok(ReconcileOutcome::Skipped) => {}
                Err(e) => error!(group_id = %group.group_id, error = %e, "Failed to reconcile group"),
            }
        }
        Ok(changed)
    }

    /// Reconcile one group under the group lock.
    pub async fn reconcile_group(&self, group_id: &str) -> Result<ReconcileOutcome> {
        let group = self
            .persistence
            .get_scaling_group(group_id)
            .await?
            .ok_or_else(|| CoreError::not_found("scaling group", group_id))?;
        if group.state()? != ScalingGroupState::Stable {
            return Ok(ReconcileOutcome::Skipped);
        }
        let Some(remote_group_id) = group.remote_group_id.clone() else {
            return Ok(ReconcileOutcome::Skipped);
        };
        if self.cooling_down(&group) {
            debug!(group_id, "Group cooling down");
            return Ok(ReconcileOutcome::Skipped);
        }

        if !self
            .persistence
            .try_transition_group(group_id, ScalingGroupState::Stable, ScalingGroupState::Scaling)
            .await?
        {
            return Ok(ReconcileOutcome::Locked);
        }

        let result = self.decide(&group, &remote_group_id).await;

        if matches!(
            result,
            Ok(ScalingDecision::ScaleOut { .. } | ScalingDecision::ScaleIn { .. })
        ) {
            match self.persistence.record_group_scaled(group_id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => warn!(group_id, "Group left 'scaling' before the cool-down was stamped"),
                Err(e) => warn!(group_id, error = %e, "Failed to stamp cool-down"),
            }
        }

        let release_to = match &result {
            Err(Error::DecisionRetriesExhausted { .. }) => ScalingGroupState::Error,
            _ => ScalingGroupState::Stable,
        };
        // A lock left behind here expires after `lock_timeout`
        match self
            .persistence
            .try_transition_group(group_id, ScalingGroupState::Scaling, release_to)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(group_id, "Group left 'scaling' while reconciling"),
            Err(e) => error!(group_id, error = %e, "Failed to release group lock"),
        }

        match result {
            Ok(ScalingDecision::None { current }) => {
                debug!(group_id, current, "Group at target");
                Ok(ReconcileOutcome::Decided(ScalingDecision::None { current }))
            }
            Ok(decision) => {
                info!(group_id, decision = ?decision, "Scaling group changed");
                Ok(ReconcileOutcome::Decided(decision))
            }
            Err(e) => {
                if release_to == ScalingGroupState::Error {
                    error!(group_id, error = %e, "Scaling group moved to error");
                }
                Err(e)
            }
        }
    }

    async fn decide(
        &self,
        group: &ScalingGroupRecord,
        remote_group_id: &str,
    ) -> Result<ScalingDecision> {
        let fleet = self
            .persistence
            .get_fleet(&group.fleet_id)
            .await?
            .ok_or_else(|| CoreError::not_found("fleet", &group.fleet_id))?;
        let clients = self
            .access
            .clients(&fleet.tenant_id, &fleet.role_id, &group.region)
            .await?;

        let policies = if group.enable_auto_scaling {
            self.persistence
                .list_scaling_policies(&group.group_id)
                .await?
        } else {
            Vec::new()
        };
        let utilization = if policies.is_empty() {
            None
        } else {
            self.session_utilization(&group.fleet_id).await?
        };
        let target = ScalingTarget::for_group(group, &policies, utilization);

        decide_and_apply(
            clients.scaling.as_ref(),
            &group.group_id,
            remote_group_id,
            &target,
            self.config.decision_attempts,
        )
        .await
    }

    async fn session_utilization(&self, fleet_id: &str) -> Result<Option<f64>> {
        let processes = self.persistence.list_processes(fleet_id).await?;
        let capacity: i64 = processes.iter().map(|p| i64::from(p.max_sessions)).sum();
        if capacity == 0 {
            return Ok(None);
        }
        let used: i64 = processes.iter().map(|p| i64::from(p.current_sessions)).sum();
        Ok(Some(used as f64 / capacity as f64))
    }

    fn cooling_down(&self, group: &ScalingGroupRecord) -> bool {
        let cool_down = chrono::Duration::try_seconds(group.cool_down_secs.max(0))
            .unwrap_or(chrono::Duration::MAX);
        group
            .last_scaled_at
            .is_some_and(|at| Utc::now().signed_duration_since(at) < cool_down)
    }

    /// Release `scaling` locks older than the lock timeout. Returns how many were freed.
    pub async fn release_stale_locks(&self) -> Result<usize> {
        let Some(cutoff) = lock_cutoff(self.config.lock_timeout) else {
            return Ok(0);
        };

        let locked = self
            .persistence
            .list_scaling_groups(ScalingGroupState::Scaling)
            .await?;
        let mut released = 0;
        for group in locked.iter().filter(|g| g.updated_at < cutoff) {
            if self
                .persistence
                .release_stale_group_lock(&group.group_id, cutoff)
                .await?
            {
                warn!(
                    group_id = %group.group_id,
                    locked_since = %group.updated_at,
                    "Released abandoned scaling lock"
                );
                released += 1;
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn group(min: i32, max: i32, desired: i32, auto: bool) -> ScalingGroupRecord {
        let now = Utc::now();
        ScalingGroupRecord {
            group_id: "g1".into(),
            fleet_id: "f1".into(),
            region: "eu-west-1".into(),
            remote_group_id: None,
            min_size: min,
            max_size: max,
            desired_size: desired,
            state: "stable".into(),
            cool_down_secs: 0,
            enable_auto_scaling: auto,
            visible: true,
            last_scaled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn policy(target: f64) -> ScalingPolicyRecord {
        ScalingPolicyRecord {
            policy_id: "p1".into(),
            group_id: "g1".into(),
            metric: SESSION_UTILIZATION.into(),
            target_value: target,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_fixed_target_is_desired() {
        let target = ScalingTarget::for_group(&group(0, 10, 3, false), &[], None);
        assert_eq!(target.resolve(0), 3);
        assert_eq!(target.resolve(7), 3);
    }

    #[test]
    fn test_policies_ignored_without_auto_scaling() {
        let target = ScalingTarget::for_group(&group(0, 10, 3, false), &[policy(0.5)], Some(1.0));
        assert_eq!(target.mode, TargetMode::Fixed(3));
    }

    #[test]
    fn test_tracking_scales_with_utilization() {
        let target = ScalingTarget::for_group(&group(1, 10, 3, true), &[policy(0.5)], Some(0.9));
        // 4 instances at 90% with a 50% target need 8
        assert_eq!(target.resolve(4), 8);

        let idle = ScalingTarget::for_group(&group(1, 10, 3, true), &[policy(0.5)], Some(0.1));
        assert_eq!(idle.resolve(4), 1);
    }

    #[test]
    fn test_tracking_clamped_to_bounds() {
        let target = ScalingTarget::for_group(&group(2, 5, 3, true), &[policy(0.25)], Some(1.0));
        assert_eq!(target.resolve(4), 5);

        let unknown_load = ScalingTarget::for_group(&group(2, 5, 3, true), &[policy(0.5)], None);
        assert_eq!(unknown_load.resolve(4), 4);
    }

    #[test]
    fn test_empty_tracking_group_starts_from_desired() {
        let target = ScalingTarget::for_group(&group(0, 5, 3, true), &[policy(0.5)], None);
        assert_eq!(target.resolve(0), 3);

        // Load left over from processes without instances
        let loaded = ScalingTarget::for_group(&group(0, 5, 2, true), &[policy(0.5)], Some(1.0));
        assert_eq!(loaded.resolve(0), 2);

        // Needs one member to measure anything
        let zero = ScalingTarget::for_group(&group(0, 5, 0, true), &[policy(0.5)], None);
        assert_eq!(zero.resolve(0), 1);
    }

    #[test]
    fn test_victims_prefer_pending_then_newest() {
        let now = Utc::now();
        let member = |id: &str, status, age_secs| GroupInstance {
            instance_id: id.into(),
            status,
            launched_at: now - chrono::Duration::seconds(age_secs),
        };
        let live = vec![
            member("old", InstanceStatus::Running, 300),
            member("new", InstanceStatus::Running, 10),
            member("booting", InstanceStatus::Pending, 100),
        ];

        assert_eq!(pick_victims(live, 2), vec!["booting", "new"]);
    }
}
