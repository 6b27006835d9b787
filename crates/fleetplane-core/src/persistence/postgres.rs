// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for fleetplane-core.
//!
//! Free functions take a pool so they can be reused from tests and
//! maintenance tooling; [`PostgresPersistence`] delegates to them.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::CoreError;
use crate::state::{
    FleetState, NodeState, ProcessState, ScalingGroupState, SessionState, WorkflowState,
};

use super::{
    FleetRecord, NewWorkflow, Persistence, ProcessRecord, ScalingGroupRecord,
    ScalingPolicyRecord, SessionRecord, WorkNodeRecord, WorkflowRecord,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Work Node Operations
// ============================================================================

/// Insert a node as running, or revive an existing row.
pub async fn register_node(
    pool: &PgPool,
    node_id: &str,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO work_nodes (node_id, state, take_over_id, last_heartbeat, created_at)
        VALUES ($1, 'running', NULL, $2, $2)
        ON CONFLICT (node_id) DO UPDATE
        SET state = 'running', take_over_id = NULL, last_heartbeat = EXCLUDED.last_heartbeat
        "#,
    )
    .bind(node_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a node by id.
pub async fn get_node(pool: &PgPool, node_id: &str) -> Result<Option<WorkNodeRecord>, CoreError> {
    let record = sqlx::query_as::<_, WorkNodeRecord>(
        r#"
        SELECT node_id, state, take_over_id, last_heartbeat, created_at
        FROM work_nodes
        WHERE node_id = $1
        "#,
    )
    .bind(node_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List all nodes, oldest first.
pub async fn list_nodes(pool: &PgPool) -> Result<Vec<WorkNodeRecord>, CoreError> {
    let records = sqlx::query_as::<_, WorkNodeRecord>(
        r#"
        SELECT node_id, state, take_over_id, last_heartbeat, created_at
        FROM work_nodes
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Refresh a node heartbeat.
pub async fn heartbeat_node(
    pool: &PgPool,
    node_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query("UPDATE work_nodes SET last_heartbeat = $1 WHERE node_id = $2")
        .bind(now)
        .bind(node_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Live or absorbing nodes whose heartbeat is older than `cutoff`.
pub async fn list_stale_nodes(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<WorkNodeRecord>, CoreError> {
    let records = sqlx::query_as::<_, WorkNodeRecord>(
        r#"
        SELECT node_id, state, take_over_id, last_heartbeat, created_at
        FROM work_nodes
        WHERE state IN ('running', 'taking-over') AND last_heartbeat < $1
        ORDER BY last_heartbeat ASC
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Flip a stale node to `error`.
pub async fn mark_node_dead(
    pool: &PgPool,
    node_id: &str,
    expected: NodeState,
    cutoff: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE work_nodes
        SET state = 'error'
        WHERE node_id = $1 AND state = $2 AND last_heartbeat < $3
        "#,
    )
    .bind(node_id)
    .bind(expected.as_str())
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Claim a dead node for takeover.
pub async fn claim_dead_node(
    pool: &PgPool,
    dead_node_id: &str,
    live_node_id: &str,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE work_nodes
        SET state = 'taking-over', take_over_id = $2
        WHERE node_id = $1 AND state = 'error'
        "#,
    )
    .bind(dead_node_id)
    .bind(live_node_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Finish a takeover held by `live_node_id`.
pub async fn complete_takeover(
    pool: &PgPool,
    dead_node_id: &str,
    live_node_id: &str,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE work_nodes
        SET state = 'terminated'
        WHERE node_id = $1 AND state = 'taking-over' AND take_over_id = $2
        "#,
    )
    .bind(dead_node_id)
    .bind(live_node_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Conditional node state change.
pub async fn try_transition_node(
    pool: &PgPool,
    node_id: &str,
    from: NodeState,
    to: NodeState,
) -> Result<bool, CoreError> {
    let result = sqlx::query("UPDATE work_nodes SET state = $3 WHERE node_id = $1 AND state = $2")
        .bind(node_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Workflow Operations
// ============================================================================

/// Insert a workflow in `create` at step 0.
pub async fn create_workflow(
    pool: &PgPool,
    workflow: &NewWorkflow,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let context = workflow.context.to_bytes()?;

    sqlx::query(
        r#"
        INSERT INTO workflows (
            workflow_id, resource_id, task_type, params, context,
            step_index, state, owner_node_id, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, 0, 'create', $6, $7, $7)
        "#,
    )
    .bind(&workflow.workflow_id)
    .bind(&workflow.resource_id)
    .bind(workflow.task_type.as_str())
    .bind(&workflow.params)
    .bind(context)
    .bind(&workflow.owner_node_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a workflow by id.
pub async fn get_workflow(
    pool: &PgPool,
    workflow_id: &str,
) -> Result<Option<WorkflowRecord>, CoreError> {
    let record = sqlx::query_as::<_, WorkflowRecord>(
        r#"
        SELECT workflow_id, resource_id, task_type, params, context, step_index,
               state, owner_node_id, last_error, created_at, updated_at
        FROM workflows
        WHERE workflow_id = $1
        "#,
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Workflows owned by a node.
pub async fn list_workflows_by_owner(
    pool: &PgPool,
    node_id: &str,
) -> Result<Vec<WorkflowRecord>, CoreError> {
    let records = sqlx::query_as::<_, WorkflowRecord>(
        r#"
        SELECT workflow_id, resource_id, task_type, params, context, step_index,
               state, owner_node_id, last_error, created_at, updated_at
        FROM workflows
        WHERE owner_node_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(node_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Workflows acting on a resource.
pub async fn list_workflows_for_resource(
    pool: &PgPool,
    resource_id: &str,
) -> Result<Vec<WorkflowRecord>, CoreError> {
    let records = sqlx::query_as::<_, WorkflowRecord>(
        r#"
        SELECT workflow_id, resource_id, task_type, params, context, step_index,
               state, owner_node_id, last_error, created_at, updated_at
        FROM workflows
        WHERE resource_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(resource_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Owner-fenced workflow state change.
pub async fn try_transition_workflow(
    pool: &PgPool,
    workflow_id: &str,
    owner_node_id: &str,
    from: WorkflowState,
    to: WorkflowState,
    last_error: Option<&str>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflows
        SET state = $4, last_error = COALESCE($5, last_error), updated_at = NOW()
        WHERE workflow_id = $1 AND owner_node_id = $2 AND state = $3
        "#,
    )
    .bind(workflow_id)
    .bind(owner_node_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(last_error)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Persist step progress and context, fenced on owner, state and step.
#[allow(clippy::too_many_arguments)]
pub async fn checkpoint_workflow(
    pool: &PgPool,
    workflow_id: &str,
    owner_node_id: &str,
    state: WorkflowState,
    expected_step: i32,
    new_step: i32,
    context: &[u8],
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflows
        SET step_index = $5, context = $6, updated_at = $7
        WHERE workflow_id = $1 AND owner_node_id = $2 AND state = $3 AND step_index = $4
        "#,
    )
    .bind(workflow_id)
    .bind(owner_node_id)
    .bind(state.as_str())
    .bind(expected_step)
    .bind(new_step)
    .bind(context)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Enter rollback from a failed forward step in one update.
pub async fn begin_workflow_rollback(
    pool: &PgPool,
    workflow_id: &str,
    owner_node_id: &str,
    failed_step: i32,
    rollback_from: i32,
    last_error: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflows
        SET state = $5, step_index = $6, last_error = $7, updated_at = $8
        WHERE workflow_id = $1 AND owner_node_id = $2 AND state = $3 AND step_index = $4
        "#,
    )
    .bind(workflow_id)
    .bind(owner_node_id)
    .bind(WorkflowState::Running.as_str())
    .bind(failed_step)
    .bind(WorkflowState::RollingBack.as_str())
    .bind(rollback_from)
    .bind(last_error)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Move every workflow owned by one node to another.
pub async fn reassign_workflows(
    pool: &PgPool,
    from_node_id: &str,
    to_node_id: &str,
) -> Result<u64, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflows
        SET owner_node_id = $2, updated_at = NOW()
        WHERE owner_node_id = $1
        "#,
    )
    .bind(from_node_id)
    .bind(to_node_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Fleet Operations
// ============================================================================

/// Insert a fleet.
pub async fn create_fleet(pool: &PgPool, fleet: &FleetRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO fleets (
            fleet_id, tenant_id, role_id, name, region, image_id, instance_type,
            state, last_error, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&fleet.fleet_id)
    .bind(&fleet.tenant_id)
    .bind(&fleet.role_id)
    .bind(&fleet.name)
    .bind(&fleet.region)
    .bind(&fleet.image_id)
    .bind(&fleet.instance_type)
    .bind(&fleet.state)
    .bind(&fleet.last_error)
    .bind(fleet.created_at)
    .bind(fleet.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a fleet by id.
pub async fn get_fleet(pool: &PgPool, fleet_id: &str) -> Result<Option<FleetRecord>, CoreError> {
    let record = sqlx::query_as::<_, FleetRecord>(
        r#"
        SELECT fleet_id, tenant_id, role_id, name, region, image_id, instance_type,
               state, last_error, created_at, updated_at
        FROM fleets
        WHERE fleet_id = $1
        "#,
    )
    .bind(fleet_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List fleets.
pub async fn list_fleets(
    pool: &PgPool,
    include_deleted: bool,
) -> Result<Vec<FleetRecord>, CoreError> {
    let records = sqlx::query_as::<_, FleetRecord>(
        r#"
        SELECT fleet_id, tenant_id, role_id, name, region, image_id, instance_type,
               state, last_error, created_at, updated_at
        FROM fleets
        WHERE $1 OR state <> 'deleted'
        ORDER BY created_at ASC
        "#,
    )
    .bind(include_deleted)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Conditional fleet state change.
pub async fn try_transition_fleet(
    pool: &PgPool,
    fleet_id: &str,
    from: FleetState,
    to: FleetState,
    last_error: Option<&str>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE fleets
        SET state = $3, last_error = COALESCE($4, last_error), updated_at = NOW()
        WHERE fleet_id = $1 AND state = $2
        "#,
    )
    .bind(fleet_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(last_error)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Scaling Group Operations
// ============================================================================

const GROUP_COLUMNS: &str = "group_id, fleet_id, region, remote_group_id, min_size, max_size, \
     desired_size, state, cool_down_secs, enable_auto_scaling, visible, last_scaled_at, \
     created_at, updated_at";

/// Insert a scaling group.
pub async fn create_scaling_group(
    pool: &PgPool,
    group: &ScalingGroupRecord,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO scaling_groups (
            group_id, fleet_id, region, remote_group_id, min_size, max_size, desired_size,
            state, cool_down_secs, enable_auto_scaling, visible, last_scaled_at,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(&group.group_id)
    .bind(&group.fleet_id)
    .bind(&group.region)
    .bind(&group.remote_group_id)
    .bind(group.min_size)
    .bind(group.max_size)
    .bind(group.desired_size)
    .bind(&group.state)
    .bind(group.cool_down_secs)
    .bind(group.enable_auto_scaling)
    .bind(group.visible)
    .bind(group.last_scaled_at)
    .bind(group.created_at)
    .bind(group.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a scaling group by id.
pub async fn get_scaling_group(
    pool: &PgPool,
    group_id: &str,
) -> Result<Option<ScalingGroupRecord>, CoreError> {
    let query = format!("SELECT {GROUP_COLUMNS} FROM scaling_groups WHERE group_id = $1");
    let record = sqlx::query_as::<_, ScalingGroupRecord>(&query)
        .bind(group_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Most recent scaling group of a fleet.
pub async fn get_scaling_group_by_fleet(
    pool: &PgPool,
    fleet_id: &str,
) -> Result<Option<ScalingGroupRecord>, CoreError> {
    let query = format!(
        "SELECT {GROUP_COLUMNS} FROM scaling_groups WHERE fleet_id = $1 \
         ORDER BY created_at DESC LIMIT 1"
    );
    let record = sqlx::query_as::<_, ScalingGroupRecord>(&query)
        .bind(fleet_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Scaling groups in a given state.
pub async fn list_scaling_groups(
    pool: &PgPool,
    state: ScalingGroupState,
) -> Result<Vec<ScalingGroupRecord>, CoreError> {
    let query = format!(
        "SELECT {GROUP_COLUMNS} FROM scaling_groups WHERE state = $1 ORDER BY created_at ASC"
    );
    let records = sqlx::query_as::<_, ScalingGroupRecord>(&query)
        .bind(state.as_str())
        .fetch_all(pool)
        .await?;

    Ok(records)
}

/// Group-level compare-and-swap.
pub async fn try_transition_group(
    pool: &PgPool,
    group_id: &str,
    from: ScalingGroupState,
    to: ScalingGroupState,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE scaling_groups
        SET state = $3, updated_at = NOW()
        WHERE group_id = $1 AND state = $2
        "#,
    )
    .bind(group_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record or clear the remote group id.
pub async fn set_remote_group_id(
    pool: &PgPool,
    group_id: &str,
    remote_group_id: Option<&str>,
) -> Result<(), CoreError> {
    let result = sqlx::query(
        "UPDATE scaling_groups SET remote_group_id = $2, updated_at = NOW() WHERE group_id = $1",
    )
    .bind(group_id)
    .bind(remote_group_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("scaling group", group_id));
    }

    Ok(())
}

/// Write bounds on a group held in `scaling`.
pub async fn update_group_capacity(
    pool: &PgPool,
    group_id: &str,
    min_size: i32,
    max_size: i32,
    desired_size: i32,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE scaling_groups
        SET min_size = $2, max_size = $3, desired_size = $4, updated_at = NOW()
        WHERE group_id = $1 AND state = 'scaling'
        "#,
    )
    .bind(group_id)
    .bind(min_size)
    .bind(max_size)
    .bind(desired_size)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Toggle auto-scaling on a group held in `scaling`.
pub async fn set_group_auto_scaling(
    pool: &PgPool,
    group_id: &str,
    enabled: bool,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE scaling_groups
        SET enable_auto_scaling = $2, updated_at = NOW()
        WHERE group_id = $1 AND state = 'scaling'
        "#,
    )
    .bind(group_id)
    .bind(enabled)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Release a `scaling` lock older than `cutoff`.
pub async fn release_stale_group_lock(
    pool: &PgPool,
    group_id: &str,
    cutoff: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE scaling_groups
        SET state = 'stable', updated_at = NOW()
        WHERE group_id = $1 AND state = 'scaling' AND updated_at < $2
        "#,
    )
    .bind(group_id)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Stamp the last scaling action on a group held in `scaling`.
pub async fn record_group_scaled(
    pool: &PgPool,
    group_id: &str,
    at: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE scaling_groups
        SET last_scaled_at = $2, updated_at = $2
        WHERE group_id = $1 AND state = 'scaling'
        "#,
    )
    .bind(group_id)
    .bind(at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Soft-delete a group in `deleting`.
pub async fn soft_delete_group(pool: &PgPool, group_id: &str) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE scaling_groups
        SET state = 'deleted', visible = FALSE, updated_at = NOW()
        WHERE group_id = $1 AND state = 'deleting'
        "#,
    )
    .bind(group_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert or replace a scaling policy.
pub async fn put_scaling_policy(
    pool: &PgPool,
    policy: &ScalingPolicyRecord,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO scaling_policies (policy_id, group_id, metric, target_value, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (policy_id) DO UPDATE
        SET metric = EXCLUDED.metric, target_value = EXCLUDED.target_value
        "#,
    )
    .bind(&policy.policy_id)
    .bind(&policy.group_id)
    .bind(&policy.metric)
    .bind(policy.target_value)
    .bind(policy.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a scaling policy.
pub async fn delete_scaling_policy(pool: &PgPool, policy_id: &str) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM scaling_policies WHERE policy_id = $1")
        .bind(policy_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Policies attached to a group.
pub async fn list_scaling_policies(
    pool: &PgPool,
    group_id: &str,
) -> Result<Vec<ScalingPolicyRecord>, CoreError> {
    let records = sqlx::query_as::<_, ScalingPolicyRecord>(
        r#"
        SELECT policy_id, group_id, metric, target_value, created_at
        FROM scaling_policies
        WHERE group_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Process and Session Operations
// ============================================================================

const SESSION_COLUMNS: &str = "session_id, fleet_id, state, process_id, max_clients, \
     current_clients, deadline_at, reason, created_at, updated_at";

/// Register a server process.
pub async fn register_process(pool: &PgPool, process: &ProcessRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO processes (
            process_id, fleet_id, instance_id, address, state,
            max_sessions, current_sessions, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&process.process_id)
    .bind(&process.fleet_id)
    .bind(&process.instance_id)
    .bind(&process.address)
    .bind(&process.state)
    .bind(process.max_sessions)
    .bind(process.current_sessions)
    .bind(process.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a process by id.
pub async fn get_process(
    pool: &PgPool,
    process_id: &str,
) -> Result<Option<ProcessRecord>, CoreError> {
    let record = sqlx::query_as::<_, ProcessRecord>(
        r#"
        SELECT process_id, fleet_id, instance_id, address, state,
               max_sessions, current_sessions, created_at
        FROM processes
        WHERE process_id = $1
        "#,
    )
    .bind(process_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List active processes of a fleet.
pub async fn list_processes(pool: &PgPool, fleet_id: &str) -> Result<Vec<ProcessRecord>, CoreError> {
    let records = sqlx::query_as::<_, ProcessRecord>(
        r#"
        SELECT process_id, fleet_id, instance_id, address, state,
               max_sessions, current_sessions, created_at
        FROM processes
        WHERE fleet_id = $1 AND state = 'active'
        ORDER BY created_at ASC
        "#,
    )
    .bind(fleet_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Active processes of a fleet with a free slot.
pub async fn list_available_processes(
    pool: &PgPool,
    fleet_id: &str,
) -> Result<Vec<ProcessRecord>, CoreError> {
    let records = sqlx::query_as::<_, ProcessRecord>(
        r#"
        SELECT process_id, fleet_id, instance_id, address, state,
               max_sessions, current_sessions, created_at
        FROM processes
        WHERE fleet_id = $1 AND state = 'active' AND current_sessions < max_sessions
        ORDER BY created_at ASC
        "#,
    )
    .bind(fleet_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Set a process state unconditionally.
pub async fn set_process_state(
    pool: &PgPool,
    process_id: &str,
    state: ProcessState,
) -> Result<bool, CoreError> {
    let result = sqlx::query("UPDATE processes SET state = $2 WHERE process_id = $1")
        .bind(process_id)
        .bind(state.as_str())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert a session.
pub async fn create_session(pool: &PgPool, session: &SessionRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO server_sessions (
            session_id, fleet_id, state, process_id, max_clients, current_clients,
            deadline_at, reason, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&session.session_id)
    .bind(&session.fleet_id)
    .bind(&session.state)
    .bind(&session.process_id)
    .bind(session.max_clients)
    .bind(session.current_clients)
    .bind(session.deadline_at)
    .bind(&session.reason)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a session by id.
pub async fn get_session(
    pool: &PgPool,
    session_id: &str,
) -> Result<Option<SessionRecord>, CoreError> {
    let query = format!("SELECT {SESSION_COLUMNS} FROM server_sessions WHERE session_id = $1");
    let record = sqlx::query_as::<_, SessionRecord>(&query)
        .bind(session_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Sessions in a state, oldest first.
pub async fn list_sessions_in_state(
    pool: &PgPool,
    state: SessionState,
    limit: i64,
) -> Result<Vec<SessionRecord>, CoreError> {
    let query = format!(
        "SELECT {SESSION_COLUMNS} FROM server_sessions WHERE state = $1 \
         ORDER BY created_at ASC LIMIT $2"
    );
    let records = sqlx::query_as::<_, SessionRecord>(&query)
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(records)
}

/// Route a `creating` session to a process with room, atomically.
pub async fn dispatch_session(
    pool: &PgPool,
    session_id: &str,
    process_id: &str,
    activation_deadline: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        r#"
        UPDATE processes
        SET current_sessions = current_sessions + 1
        WHERE process_id = $1 AND state = 'active' AND current_sessions < max_sessions
        "#,
    )
    .bind(process_id)
    .execute(&mut *tx)
    .await?;

    if claimed.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    let assigned = sqlx::query(
        r#"
        UPDATE server_sessions
        SET state = 'activating', process_id = $2, deadline_at = $3, updated_at = $4
        WHERE session_id = $1 AND state = 'creating'
        "#,
    )
    .bind(session_id)
    .bind(process_id)
    .bind(activation_deadline)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    if assigned.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    tx.commit().await?;
    Ok(true)
}

/// Conditional session transition that releases the process slot on a
/// terminal move out of a slot-holding state.
pub async fn try_transition_session(
    pool: &PgPool,
    session_id: &str,
    from: SessionState,
    to: SessionState,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let mut tx = pool.begin().await?;

    let updated: Option<Option<String>> = sqlx::query_scalar(
        r#"
        UPDATE server_sessions
        SET state = $3, reason = COALESCE($4, reason), updated_at = $5
        WHERE session_id = $1 AND state = $2
        RETURNING process_id
        "#,
    )
    .bind(session_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(reason)
    .bind(now)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(process_id) = updated else {
        tx.rollback().await?;
        return Ok(false);
    };

    if from.holds_process_slot()
        && to.is_terminal()
        && let Some(process_id) = process_id
    {
        sqlx::query(
            r#"
            UPDATE processes
            SET current_sessions = current_sessions - 1
            WHERE process_id = $1 AND current_sessions > 0
            "#,
        )
        .bind(process_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// `activating` sessions past their deadline.
pub async fn list_expired_activations(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<SessionRecord>, CoreError> {
    let query = format!(
        "SELECT {SESSION_COLUMNS} FROM server_sessions \
         WHERE state = 'activating' AND deadline_at < $1 ORDER BY deadline_at ASC"
    );
    let records = sqlx::query_as::<_, SessionRecord>(&query)
        .bind(now)
        .fetch_all(pool)
        .await?;

    Ok(records)
}

/// Take one client slot on an active session.
pub async fn reserve_client_slot(pool: &PgPool, session_id: &str) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE server_sessions
        SET current_clients = current_clients + 1
        WHERE session_id = $1 AND state = 'active' AND current_clients < max_clients
        "#,
    )
    .bind(session_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Trait implementation
// ============================================================================

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn register_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        register_node(&self.pool, node_id, now).await
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<WorkNodeRecord>, CoreError> {
        get_node(&self.pool, node_id).await
    }

    async fn list_nodes(&self) -> Result<Vec<WorkNodeRecord>, CoreError> {
        list_nodes(&self.pool).await
    }

    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        heartbeat_node(&self.pool, node_id, now).await
    }

    async fn list_stale_nodes(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkNodeRecord>, CoreError> {
        list_stale_nodes(&self.pool, cutoff).await
    }

    async fn mark_node_dead(
        &self,
        node_id: &str,
        expected: NodeState,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        mark_node_dead(&self.pool, node_id, expected, cutoff).await
    }

    async fn claim_dead_node(
        &self,
        dead_node_id: &str,
        live_node_id: &str,
    ) -> Result<bool, CoreError> {
        claim_dead_node(&self.pool, dead_node_id, live_node_id).await
    }

    async fn complete_takeover(
        &self,
        dead_node_id: &str,
        live_node_id: &str,
    ) -> Result<bool, CoreError> {
        complete_takeover(&self.pool, dead_node_id, live_node_id).await
    }

    async fn try_transition_node(
        &self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
    ) -> Result<bool, CoreError> {
        try_transition_node(&self.pool, node_id, from, to).await
    }

    async fn create_workflow(
        &self,
        workflow: &NewWorkflow,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        create_workflow(&self.pool, workflow, now).await
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, CoreError> {
        get_workflow(&self.pool, workflow_id).await
    }

    async fn list_workflows_by_owner(
        &self,
        node_id: &str,
    ) -> Result<Vec<WorkflowRecord>, CoreError> {
        list_workflows_by_owner(&self.pool, node_id).await
    }

    async fn list_workflows_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Vec<WorkflowRecord>, CoreError> {
        list_workflows_for_resource(&self.pool, resource_id).await
    }

    async fn try_transition_workflow(
        &self,
        workflow_id: &str,
        owner_node_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        last_error: Option<&str>,
    ) -> Result<bool, CoreError> {
        try_transition_workflow(&self.pool, workflow_id, owner_node_id, from, to, last_error).await
    }

    async fn checkpoint_workflow(
        &self,
        workflow_id: &str,
        owner_node_id: &str,
        state: WorkflowState,
        expected_step: i32,
        new_step: i32,
        context: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        checkpoint_workflow(
            &self.pool,
            workflow_id,
            owner_node_id,
            state,
            expected_step,
            new_step,
            context,
            now,
        )
        .await
    }

    async fn begin_workflow_rollback(
        &self,
        workflow_id: &str,
        owner_node_id: &str,
        failed_step: i32,
        rollback_from: i32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        begin_workflow_rollback(
            &self.pool,
            workflow_id,
            owner_node_id,
            failed_step,
            rollback_from,
            last_error,
            now,
        )
        .await
    }

    async fn reassign_workflows(
        &self,
        from_node_id: &str,
        to_node_id: &str,
    ) -> Result<u64, CoreError> {
        reassign_workflows(&self.pool, from_node_id, to_node_id).await
    }

    async fn create_fleet(&self, fleet: &FleetRecord) -> Result<(), CoreError> {
        create_fleet(&self.pool, fleet).await
    }

    async fn get_fleet(&self, fleet_id: &str) -> Result<Option<FleetRecord>, CoreError> {
        get_fleet(&self.pool, fleet_id).await
    }

    async fn list_fleets(&self, include_deleted: bool) -> Result<Vec<FleetRecord>, CoreError> {
        list_fleets(&self.pool, include_deleted).await
    }

    async fn try_transition_fleet(
        &self,
        fleet_id: &str,
        from: FleetState,
        to: FleetState,
        last_error: Option<&str>,
    ) -> Result<bool, CoreError> {
        try_transition_fleet(&self.pool, fleet_id, from, to, last_error).await
    }

    async fn create_scaling_group(&self, group: &ScalingGroupRecord) -> Result<(), CoreError> {
        create_scaling_group(&self.pool, group).await
    }

    async fn get_scaling_group(
        &self,
        group_id: &str,
    ) -> Result<Option<ScalingGroupRecord>, CoreError> {
        get_scaling_group(&self.pool, group_id).await
    }

    async fn get_scaling_group_by_fleet(
        &self,
        fleet_id: &str,
    ) -> Result<Option<ScalingGroupRecord>, CoreError> {
        get_scaling_group_by_fleet(&self.pool, fleet_id).await
    }

    async fn list_scaling_groups(
        &self,
        state: ScalingGroupState,
    ) -> Result<Vec<ScalingGroupRecord>, CoreError> {
        list_scaling_groups(&self.pool, state).await
    }

    async fn try_transition_group(
        &self,
        group_id: &str,
        from: ScalingGroupState,
        to: ScalingGroupState,
    ) -> Result<bool, CoreError> {
        try_transition_group(&self.pool, group_id, from, to).await
    }

    async fn set_remote_group_id(
        &self,
        group_id: &str,
        remote_group_id: Option<&str>,
    ) -> Result<(), CoreError> {
        set_remote_group_id(&self.pool, group_id, remote_group_id).await
    }

    async fn update_group_capacity(
        &self,
        group_id: &str,
        min_size: i32,
        max_size: i32,
        desired_size: i32,
    ) -> Result<bool, CoreError> {
        update_group_capacity(&self.pool, group_id, min_size, max_size, desired_size).await
    }

    async fn set_group_auto_scaling(
        &self,
        group_id: &str,
        enabled: bool,
    ) -> Result<bool, CoreError> {
        set_group_auto_scaling(&self.pool, group_id, enabled).await
    }

    async fn release_stale_group_lock(
        &self,
        group_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        release_stale_group_lock(&self.pool, group_id, cutoff).await
    }

    async fn record_group_scaled(
        &self,
        group_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        record_group_scaled(&self.pool, group_id, at).await
    }

    async fn soft_delete_group(&self, group_id: &str) -> Result<bool, CoreError> {
        soft_delete_group(&self.pool, group_id).await
    }

    async fn put_scaling_policy(&self, policy: &ScalingPolicyRecord) -> Result<(), CoreError> {
        put_scaling_policy(&self.pool, policy).await
    }

    async fn delete_scaling_policy(&self, policy_id: &str) -> Result<bool, CoreError> {
        delete_scaling_policy(&self.pool, policy_id).await
    }

    async fn list_scaling_policies(
        &self,
        group_id: &str,
    ) -> Result<Vec<ScalingPolicyRecord>, CoreError> {
        list_scaling_policies(&self.pool, group_id).await
    }

    async fn register_process(&self, process: &ProcessRecord) -> Result<(), CoreError> {
        register_process(&self.pool, process).await
    }

    async fn get_process(&self, process_id: &str) -> Result<Option<ProcessRecord>, CoreError> {
        get_process(&self.pool, process_id).await
    }

    async fn list_processes(&self, fleet_id: &str) -> Result<Vec<ProcessRecord>, CoreError> {
        list_processes(&self.pool, fleet_id).await
    }

    async fn list_available_processes(
        &self,
        fleet_id: &str,
    ) -> Result<Vec<ProcessRecord>, CoreError> {
        list_available_processes(&self.pool, fleet_id).await
    }

    async fn set_process_state(
        &self,
        process_id: &str,
        state: ProcessState,
    ) -> Result<bool, CoreError> {
        set_process_state(&self.pool, process_id, state).await
    }

    async fn create_session(&self, session: &SessionRecord) -> Result<(), CoreError> {
        create_session(&self.pool, session).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CoreError> {
        get_session(&self.pool, session_id).await
    }

    async fn list_sessions_in_state(
        &self,
        state: SessionState,
        limit: i64,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        list_sessions_in_state(&self.pool, state, limit).await
    }

    async fn dispatch_session(
        &self,
        session_id: &str,
        process_id: &str,
        activation_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        dispatch_session(&self.pool, session_id, process_id, activation_deadline, now).await
    }

    async fn try_transition_session(
        &self,
        session_id: &str,
        from: SessionState,
        to: SessionState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        try_transition_session(&self.pool, session_id, from, to, reason, now).await
    }

    async fn list_expired_activations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        list_expired_activations(&self.pool, now).await
    }

    async fn reserve_client_slot(&self, session_id: &str) -> Result<bool, CoreError> {
        reserve_client_slot(&self.pool, session_id).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
