//! SQLite-backed persistence implementation.
//!
//! Used for embedded single-process deployments and by the test suites.
//! Timestamps are always bound from Rust so that TEXT comparisons order
//! correctly.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;
use crate::migrations;
use crate::state::{
    FleetState, NodeState, ProcessState, ScalingGroupState, SessionState, WorkflowState,
};

use super::{
    FleetRecord, NewWorkflow, Persistence, ProcessRecord, ScalingGroupRecord,
    ScalingPolicyRecord, SessionRecord, WorkNodeRecord, WorkflowRecord,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a migrated in-memory database.
    ///
    /// Uses a single never-recycled connection; each call yields an
    /// independent database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        migrations::run_sqlite(pool)
            .await
            .map_err(|e| CoreError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    // ------------------------------------------------------------------
    // Work nodes
    // ------------------------------------------------------------------

    async fn register_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO work_nodes (node_id, state, take_over_id, last_heartbeat, created_at)
            VALUES (?1, 'running', NULL, ?2, ?2)
            ON CONFLICT(node_id) DO UPDATE
            SET state = 'running', take_over_id = NULL, last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(node_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<WorkNodeRecord>, CoreError> {
        let record = sqlx::query_as::<_, WorkNodeRecord>(
            r#"
            SELECT node_id, state, take_over_id, last_heartbeat, created_at
            FROM work_nodes
            WHERE node_id = ?
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_nodes(&self) -> Result<Vec<WorkNodeRecord>, CoreError> {
        let records = sqlx::query_as::<_, WorkNodeRecord>(
            r#"
            SELECT node_id, state, take_over_id, last_heartbeat, created_at
            FROM work_nodes
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE work_nodes SET last_heartbeat = ?1 WHERE node_id = ?2")
            .bind(now)
            .bind(node_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_stale_nodes(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkNodeRecord>, CoreError> {
        let records = sqlx::query_as::<_, WorkNodeRecord>(
            r#"
            SELECT node_id, state, take_over_id, last_heartbeat, created_at
            FROM work_nodes
            WHERE state IN ('running', 'taking-over') AND last_heartbeat < ?
            ORDER BY last_heartbeat ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn mark_node_dead(
        &self,
        node_id: &str,
        expected: NodeState,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_nodes
            SET state = 'error'
            WHERE node_id = ?1 AND state = ?2 AND last_heartbeat < ?3
            "#,
        )
        .bind(node_id)
        .bind(expected.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_dead_node(
        &self,
        dead_node_id: &str,
        live_node_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_nodes
            SET state = 'taking-over', take_over_id = ?2
            WHERE node_id = ?1 AND state = 'error'
            "#,
        )
        .bind(dead_node_id)
        .bind(live_node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_takeover(
        &self,
        dead_node_id: &str,
        live_node_id: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_nodes
            SET state = 'terminated'
            WHERE node_id = ?1 AND state = 'taking-over' AND take_over_id = ?2
            "#,
        )
        .bind(dead_node_id)
        .bind(live_node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_transition_node(
        &self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE work_nodes SET state = ?3 WHERE node_id = ?1 AND state = ?2")
            .bind(node_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    async fn create_workflow(
        &self,
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
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 'create', ?6, ?7, ?7)
            "#,
        )
        .bind(&workflow.workflow_id)
        .bind(&workflow.resource_id)
        .bind(workflow.task_type.as_str())
        .bind(&workflow.params)
        .bind(context)
        .bind(&workflow.owner_node_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, CoreError> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT workflow_id, resource_id, task_type, params, context, step_index,
                   state, owner_node_id, last_error, created_at, updated_at
            FROM workflows
            WHERE workflow_id = ?
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_workflows_by_owner(
        &self,
        node_id: &str,
    ) -> Result<Vec<WorkflowRecord>, CoreError> {
        let records = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT workflow_id, resource_id, task_type, params, context, step_index,
                   state, owner_node_id, last_error, created_at, updated_at
            FROM workflows
            WHERE owner_node_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_workflows_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Vec<WorkflowRecord>, CoreError> {
        let records = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            SELECT workflow_id, resource_id, task_type, params, context, step_index,
                   state, owner_node_id, last_error, created_at, updated_at
            FROM workflows
            WHERE resource_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn try_transition_workflow(
        &self,
        workflow_id: &str,
        owner_node_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        last_error: Option<&str>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET state = ?4, last_error = COALESCE(?5, last_error), updated_at = ?6
            WHERE workflow_id = ?1 AND owner_node_id = ?2 AND state = ?3
            "#,
        )
        .bind(workflow_id)
        .bind(owner_node_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(last_error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
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
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET step_index = ?5, context = ?6, updated_at = ?7
            WHERE workflow_id = ?1 AND owner_node_id = ?2 AND state = ?3 AND step_index = ?4
            "#,
        )
        .bind(workflow_id)
        .bind(owner_node_id)
        .bind(state.as_str())
        .bind(expected_step)
        .bind(new_step)
        .bind(context)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
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
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET state = ?5, step_index = ?6, last_error = ?7, updated_at = ?8
            WHERE workflow_id = ?1 AND owner_node_id = ?2 AND state = ?3 AND step_index = ?4
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
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reassign_workflows(
        &self,
        from_node_id: &str,
        to_node_id: &str,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET owner_node_id = ?2, updated_at = ?3
            WHERE owner_node_id = ?1
            "#,
        )
        .bind(from_node_id)
        .bind(to_node_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Fleets
    // ------------------------------------------------------------------

    async fn create_fleet(&self, fleet: &FleetRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO fleets (
                fleet_id, tenant_id, role_id, name, region, image_id, instance_type,
                state, last_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_fleet(&self, fleet_id: &str) -> Result<Option<FleetRecord>, CoreError> {
        let record = sqlx::query_as::<_, FleetRecord>(
            r#"
            SELECT fleet_id, tenant_id, role_id, name, region, image_id, instance_type,
                   state, last_error, created_at, updated_at
            FROM fleets
            WHERE fleet_id = ?
            "#,
        )
        .bind(fleet_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_fleets(&self, include_deleted: bool) -> Result<Vec<FleetRecord>, CoreError> {
        let records = sqlx::query_as::<_, FleetRecord>(
            r#"
            SELECT fleet_id, tenant_id, role_id, name, region, image_id, instance_type,
                   state, last_error, created_at, updated_at
            FROM fleets
            WHERE ?1 OR state != 'deleted'
            ORDER BY created_at ASC
            "#,
        )
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn try_transition_fleet(
        &self,
        fleet_id: &str,
        from: FleetState,
        to: FleetState,
        last_error: Option<&str>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE fleets
            SET state = ?3, last_error = COALESCE(?4, last_error), updated_at = ?5
            WHERE fleet_id = ?1 AND state = ?2
            "#,
        )
        .bind(fleet_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(last_error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Scaling groups
    // ------------------------------------------------------------------

    async fn create_scaling_group(&self, group: &ScalingGroupRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO scaling_groups (
                group_id, fleet_id, region, remote_group_id, min_size, max_size, desired_size,
                state, cool_down_secs, enable_auto_scaling, visible, last_scaled_at,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_scaling_group(
        &self,
        group_id: &str,
    ) -> Result<Option<ScalingGroupRecord>, CoreError> {
        let record = sqlx::query_as::<_, ScalingGroupRecord>(
            r#"
            SELECT group_id, fleet_id, region, remote_group_id, min_size, max_size, desired_size,
                   state, cool_down_secs, enable_auto_scaling, visible, last_scaled_at,
                   created_at, updated_at
            FROM scaling_groups
            WHERE group_id = ?
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get_scaling_group_by_fleet(
        &self,
        fleet_id: &str,
    ) -> Result<Option<ScalingGroupRecord>, CoreError> {
        let record = sqlx::query_as::<_, ScalingGroupRecord>(
            r#"
            SELECT group_id, fleet_id, region, remote_group_id, min_size, max_size, desired_size,
                   state, cool_down_secs, enable_auto_scaling, visible, last_scaled_at,
                   created_at, updated_at
            FROM scaling_groups
            WHERE fleet_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(fleet_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_scaling_groups(
        &self,
        state: ScalingGroupState,
    ) -> Result<Vec<ScalingGroupRecord>, CoreError> {
        let records = sqlx::query_as::<_, ScalingGroupRecord>(
            r#"
            SELECT group_id, fleet_id, region, remote_group_id, min_size, max_size, desired_size,
                   state, cool_down_secs, enable_auto_scaling, visible, last_scaled_at,
                   created_at, updated_at
            FROM scaling_groups
            WHERE state = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn try_transition_group(
        &self,
        group_id: &str,
        from: ScalingGroupState,
        to: ScalingGroupState,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scaling_groups
            SET state = ?3, updated_at = ?4
            WHERE group_id = ?1 AND state = ?2
            "#,
        )
        .bind(group_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_remote_group_id(
        &self,
        group_id: &str,
        remote_group_id: Option<&str>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "UPDATE scaling_groups SET remote_group_id = ?2, updated_at = ?3 WHERE group_id = ?1",
        )
        .bind(group_id)
        .bind(remote_group_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("scaling group", group_id));
        }

        Ok(())
    }

    async fn update_group_capacity(
        &self,
        group_id: &str,
        min_size: i32,
        max_size: i32,
        desired_size: i32,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scaling_groups
            SET min_size = ?2, max_size = ?3, desired_size = ?4, updated_at = ?5
            WHERE group_id = ?1 AND state = 'scaling'
            "#,
        )
        .bind(group_id)
        .bind(min_size)
        .bind(max_size)
        .bind(desired_size)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_group_auto_scaling(
        &self,
        group_id: &str,
        enabled: bool,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scaling_groups
            SET enable_auto_scaling = ?2, updated_at = ?3
            WHERE group_id = ?1 AND state = 'scaling'
            "#,
        )
        .bind(group_id)
        .bind(enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_stale_group_lock(
        &self,
        group_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scaling_groups
            SET state = 'stable', updated_at = ?3
            WHERE group_id = ?1 AND state = 'scaling' AND updated_at < ?2
            "#,
        )
        .bind(group_id)
        .bind(cutoff)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_group_scaled(
        &self,
        group_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scaling_groups
            SET last_scaled_at = ?2, updated_at = ?2
            WHERE group_id = ?1 AND state = 'scaling'
            "#,
        )
        .bind(group_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn soft_delete_group(&self, group_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scaling_groups
            SET state = 'deleted', visible = 0, updated_at = ?2
            WHERE group_id = ?1 AND state = 'deleting'
            "#,
        )
        .bind(group_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn put_scaling_policy(&self, policy: &ScalingPolicyRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO scaling_policies (policy_id, group_id, metric, target_value, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(policy_id) DO UPDATE
            SET metric = excluded.metric, target_value = excluded.target_value
            "#,
        )
        .bind(&policy.policy_id)
        .bind(&policy.group_id)
        .bind(&policy.metric)
        .bind(policy.target_value)
        .bind(policy.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_scaling_policy(&self, policy_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM scaling_policies WHERE policy_id = ?")
            .bind(policy_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_scaling_policies(
        &self,
        group_id: &str,
    ) -> Result<Vec<ScalingPolicyRecord>, CoreError> {
        let records = sqlx::query_as::<_, ScalingPolicyRecord>(
            r#"
            SELECT policy_id, group_id, metric, target_value, created_at
            FROM scaling_policies
            WHERE group_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    // ------------------------------------------------------------------
    // Processes and sessions
    // ------------------------------------------------------------------

    async fn register_process(&self, process: &ProcessRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO processes (
                process_id, fleet_id, instance_id, address, state,
                max_sessions, current_sessions, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_process(&self, process_id: &str) -> Result<Option<ProcessRecord>, CoreError> {
        let record = sqlx::query_as::<_, ProcessRecord>(
            r#"
            SELECT process_id, fleet_id, instance_id, address, state,
                   max_sessions, current_sessions, created_at
            FROM processes
            WHERE process_id = ?
            "#,
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_processes(&self, fleet_id: &str) -> Result<Vec<ProcessRecord>, CoreError> {
        let records = sqlx::query_as::<_, ProcessRecord>(
            r#"
            SELECT process_id, fleet_id, instance_id, address, state,
                   max_sessions, current_sessions, created_at
            FROM processes
            WHERE fleet_id = ? AND state = 'active'
            ORDER BY created_at ASC
            "#,
        )
        .bind(fleet_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_available_processes(
        &self,
        fleet_id: &str,
    ) -> Result<Vec<ProcessRecord>, CoreError> {
        let records = sqlx::query_as::<_, ProcessRecord>(
            r#"
            SELECT process_id, fleet_id, instance_id, address, state,
                   max_sessions, current_sessions, created_at
            FROM processes
            WHERE fleet_id = ? AND state = 'active' AND current_sessions < max_sessions
            ORDER BY created_at ASC
            "#,
        )
        .bind(fleet_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn set_process_state(
        &self,
        process_id: &str,
        state: ProcessState,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE processes SET state = ?2 WHERE process_id = ?1")
            .bind(process_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_session(&self, session: &SessionRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO server_sessions (
                session_id, fleet_id, state, process_id, max_clients, current_clients,
                deadline_at, reason, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CoreError> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, fleet_id, state, process_id, max_clients, current_clients,
                   deadline_at, reason, created_at, updated_at
            FROM server_sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_sessions_in_state(
        &self,
        state: SessionState,
        limit: i64,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        let records = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, fleet_id, state, process_id, max_clients, current_clients,
                   deadline_at, reason, created_at, updated_at
            FROM server_sessions
            WHERE state = ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn dispatch_session(
        &self,
        session_id: &str,
        process_id: &str,
        activation_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE processes
            SET current_sessions = current_sessions + 1
            WHERE process_id = ?1 AND state = 'active' AND current_sessions < max_sessions
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
            SET state = 'activating', process_id = ?2, deadline_at = ?3, updated_at = ?4
            WHERE session_id = ?1 AND state = 'creating'
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

    async fn try_transition_session(
        &self,
        session_id: &str,
        from: SessionState,
        to: SessionState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let process_id: Option<Option<String>> = sqlx::query_scalar(
            "SELECT process_id FROM server_sessions WHERE session_id = ?1 AND state = ?2",
        )
        .bind(session_id)
        .bind(from.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(process_id) = process_id else {
            tx.rollback().await?;
            return Ok(false);
        };

        let result = sqlx::query(
            r#"
            UPDATE server_sessions
            SET state = ?3, reason = COALESCE(?4, reason), updated_at = ?5
            WHERE session_id = ?1 AND state = ?2
            "#,
        )
        .bind(session_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if from.holds_process_slot()
            && to.is_terminal()
            && let Some(process_id) = process_id
        {
            sqlx::query(
                r#"
                UPDATE processes
                SET current_sessions = current_sessions - 1
                WHERE process_id = ? AND current_sessions > 0
                "#,
            )
            .bind(process_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn list_expired_activations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, CoreError> {
        let records = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT session_id, fleet_id, state, process_id, max_clients, current_clients,
                   deadline_at, reason, created_at, updated_at
            FROM server_sessions
            WHERE state = 'activating' AND deadline_at < ?
            ORDER BY deadline_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn reserve_client_slot(&self, session_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE server_sessions
            SET current_clients = current_clients + 1
            WHERE session_id = ? AND state = 'active' AND current_clients < max_clients
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::state::TaskType;
    use chrono::Duration;
    use uuid::Uuid;

    async fn test_persistence() -> SqlitePersistence {
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite persistence")
    }

    fn new_workflow(owner: &str) -> NewWorkflow {
        NewWorkflow {
            workflow_id: Uuid::new_v4().to_string(),
            resource_id: "fleet-1".to_string(),
            task_type: TaskType::CreateFleet,
            params: b"{}".to_vec(),
            context: ExecutionContext::new().with("region", "eu-west-1"),
            owner_node_id: owner.to_string(),
        }
    }

    fn process(process_id: &str, max_sessions: i32) -> ProcessRecord {
        ProcessRecord {
            process_id: process_id.to_string(),
            fleet_id: "fleet-1".to_string(),
            instance_id: "i-1".to_string(),
            address: "10.0.0.1:7777".to_string(),
            state: ProcessState::Active.as_str().to_string(),
            max_sessions,
            current_sessions: 0,
            created_at: Utc::now(),
        }
    }

    fn session(session_id: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            session_id: session_id.to_string(),
            fleet_id: "fleet-1".to_string(),
            state: SessionState::Creating.as_str().to_string(),
            process_id: None,
            max_clients: 4,
            current_clients: 0,
            deadline_at: now + Duration::seconds(60),
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node_is_noop() {
        let persistence = test_persistence().await;

        let updated = persistence
            .heartbeat_node("ghost", Utc::now())
            .await
            .unwrap();

        assert!(!updated);
        assert!(persistence.get_node("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_dead_skips_node_that_heartbeated_again() {
        let persistence = test_persistence().await;
        let long_ago = Utc::now() - Duration::minutes(10);
        persistence.register_node("node-a", long_ago).await.unwrap();

        let cutoff = Utc::now() - Duration::minutes(1);
        let stale = persistence.list_stale_nodes(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);

        // The node comes back between detection and the flip
        persistence
            .heartbeat_node("node-a", Utc::now())
            .await
            .unwrap();

        let flipped = persistence
            .mark_node_dead("node-a", NodeState::Running, cutoff)
            .await
            .unwrap();
        assert!(!flipped);

        let node = persistence.get_node("node-a").await.unwrap().unwrap();
        assert_eq!(node.state().unwrap(), NodeState::Running);
    }

    #[tokio::test]
    async fn test_claim_dead_node_only_once() {
        let persistence = test_persistence().await;
        let long_ago = Utc::now() - Duration::minutes(10);
        persistence.register_node("dead", long_ago).await.unwrap();
        assert!(
            persistence
                .mark_node_dead("dead", NodeState::Running, Utc::now())
                .await
                .unwrap()
        );

        assert!(persistence.claim_dead_node("dead", "live-1").await.unwrap());
        assert!(!persistence.claim_dead_node("dead", "live-2").await.unwrap());

        let node = persistence.get_node("dead").await.unwrap().unwrap();
        assert_eq!(node.state().unwrap(), NodeState::TakingOver);
        assert_eq!(node.take_over_id.as_deref(), Some("live-1"));

        // Only the claimant may complete
        assert!(!persistence.complete_takeover("dead", "live-2").await.unwrap());
        assert!(persistence.complete_takeover("dead", "live-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reassign_workflows_moves_all() {
        let persistence = test_persistence().await;
        for _ in 0..3 {
            persistence
                .create_workflow(&new_workflow("node-a"), Utc::now())
                .await
                .unwrap();
        }
        persistence
            .create_workflow(&new_workflow("node-c"), Utc::now())
            .await
            .unwrap();

        let moved = persistence
            .reassign_workflows("node-a", "node-b")
            .await
            .unwrap();

        assert_eq!(moved, 3);
        assert!(
            persistence
                .list_workflows_by_owner("node-a")
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            persistence
                .list_workflows_by_owner("node-b")
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_checkpoint_is_fenced_on_owner_and_step() {
        let persistence = test_persistence().await;
        let wf = new_workflow("node-a");
        persistence.create_workflow(&wf, Utc::now()).await.unwrap();
        assert!(
            persistence
                .try_transition_workflow(
                    &wf.workflow_id,
                    "node-a",
                    WorkflowState::Create,
                    WorkflowState::Running,
                    None
                )
                .await
                .unwrap()
        );

        let ctx = ExecutionContext::new().with("vpc_id", "vpc-1").to_bytes().unwrap();

        // Wrong owner
        assert!(
            !persistence
                .checkpoint_workflow(
                    &wf.workflow_id,
                    "node-b",
                    WorkflowState::Running,
                    0,
                    1,
                    &ctx,
                    Utc::now()
                )
                .await
                .unwrap()
        );
        // Right owner
        assert!(
            persistence
                .checkpoint_workflow(
                    &wf.workflow_id,
                    "node-a",
                    WorkflowState::Running,
                    0,
                    1,
                    &ctx,
                    Utc::now()
                )
                .await
                .unwrap()
        );
        // Stale expected step
        assert!(
            !persistence
                .checkpoint_workflow(
                    &wf.workflow_id,
                    "node-a",
                    WorkflowState::Running,
                    0,
                    1,
                    &ctx,
                    Utc::now()
                )
                .await
                .unwrap()
        );

        let record = persistence
            .get_workflow(&wf.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.step_index, 1);
        assert_eq!(record.context().unwrap().get_str("vpc_id"), Some("vpc-1"));
    }

    #[tokio::test]
    async fn test_group_cas_single_winner() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let group = ScalingGroupRecord {
            group_id: "g1".to_string(),
            fleet_id: "fleet-1".to_string(),
            region: "eu-west-1".to_string(),
            remote_group_id: None,
            min_size: 0,
            max_size: 10,
            desired_size: 3,
            state: ScalingGroupState::Stable.as_str().to_string(),
            cool_down_secs: 300,
            enable_auto_scaling: false,
            visible: true,
            last_scaled_at: None,
            created_at: now,
            updated_at: now,
        };
        persistence.create_scaling_group(&group).await.unwrap();

        let (a, b) = tokio::join!(
            persistence.try_transition_group(
                "g1",
                ScalingGroupState::Stable,
                ScalingGroupState::Scaling
            ),
            persistence.try_transition_group(
                "g1",
                ScalingGroupState::Stable,
                ScalingGroupState::Scaling
            ),
        );

        assert!(a.unwrap() ^ b.unwrap());
    }

    #[tokio::test]
    async fn test_only_stale_group_lock_is_released() {
        let persistence = test_persistence().await;
        let long_ago = Utc::now() - chrono::Duration::minutes(30);
        let group = ScalingGroupRecord {
            group_id: "g1".to_string(),
            fleet_id: "fleet-1".to_string(),
            region: "eu-west-1".to_string(),
            remote_group_id: None,
            min_size: 0,
            max_size: 10,
            desired_size: 3,
            state: ScalingGroupState::Scaling.as_str().to_string(),
            cool_down_secs: 300,
            enable_auto_scaling: false,
            visible: true,
            last_scaled_at: None,
            created_at: long_ago,
            updated_at: long_ago,
        };
        persistence.create_scaling_group(&group).await.unwrap();

        // Stamping the scaling action refreshes the lock
        let scaled_at = Utc::now();
        assert!(persistence.record_group_scaled("g1", scaled_at).await.unwrap());
        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        assert!(!persistence.release_stale_group_lock("g1", cutoff).await.unwrap());

        let record = persistence.get_scaling_group("g1").await.unwrap().unwrap();
        assert_eq!(
            record.last_scaled_at.map(|at| at.timestamp_millis()),
            Some(scaled_at.timestamp_millis())
        );
        assert_eq!(record.state().unwrap(), ScalingGroupState::Scaling);

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert!(persistence.release_stale_group_lock("g1", cutoff).await.unwrap());
        let record = persistence.get_scaling_group("g1").await.unwrap().unwrap();
        assert_eq!(record.state().unwrap(), ScalingGroupState::Stable);

        // Nothing to release once stable, and no stamping outside the lock
        assert!(!persistence.release_stale_group_lock("g1", cutoff).await.unwrap());
        assert!(!persistence.record_group_scaled("g1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_is_all_or_nothing() {
        let persistence = test_persistence().await;
        persistence.register_process(&process("p1", 1)).await.unwrap();
        persistence.create_session(&session("s1")).await.unwrap();
        persistence.create_session(&session("s2")).await.unwrap();

        let deadline = Utc::now() + Duration::seconds(30);
        assert!(
            persistence
                .dispatch_session("s1", "p1", deadline, Utc::now())
                .await
                .unwrap()
        );
        // Process is full: the session must stay untouched
        assert!(
            !persistence
                .dispatch_session("s2", "p1", deadline, Utc::now())
                .await
                .unwrap()
        );

        let p1 = persistence.get_process("p1").await.unwrap().unwrap();
        assert_eq!(p1.current_sessions, 1);

        let s2 = persistence.get_session("s2").await.unwrap().unwrap();
        assert_eq!(s2.state().unwrap(), SessionState::Creating);
        assert!(s2.process_id.is_none());

        // Re-dispatching an already dispatched session must not bump the counter
        persistence.register_process(&process("p2", 5)).await.unwrap();
        assert!(
            !persistence
                .dispatch_session("s1", "p2", deadline, Utc::now())
                .await
                .unwrap()
        );
        let p2 = persistence.get_process("p2").await.unwrap().unwrap();
        assert_eq!(p2.current_sessions, 0);
    }

    #[tokio::test]
    async fn test_terminal_transition_releases_slot() {
        let persistence = test_persistence().await;
        persistence.register_process(&process("p1", 2)).await.unwrap();
        persistence.create_session(&session("s1")).await.unwrap();
        persistence
            .dispatch_session("s1", "p1", Utc::now(), Utc::now())
            .await
            .unwrap();

        let moved = persistence
            .try_transition_session(
                "s1",
                SessionState::Activating,
                SessionState::Error,
                Some("activation deadline exceeded"),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(moved);

        let p1 = persistence.get_process("p1").await.unwrap().unwrap();
        assert_eq!(p1.current_sessions, 0);
        let s1 = persistence.get_session("s1").await.unwrap().unwrap();
        assert_eq!(s1.reason.as_deref(), Some("activation deadline exceeded"));
    }

    #[tokio::test]
    async fn test_reserve_client_slot_respects_max() {
        let persistence = test_persistence().await;
        persistence.register_process(&process("p1", 2)).await.unwrap();
        let mut s = session("s1");
        s.max_clients = 1;
        persistence.create_session(&s).await.unwrap();

        // Not active yet
        assert!(!persistence.reserve_client_slot("s1").await.unwrap());

        persistence
            .dispatch_session("s1", "p1", Utc::now(), Utc::now())
            .await
            .unwrap();
        persistence
            .try_transition_session(
                "s1",
                SessionState::Activating,
                SessionState::Active,
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(persistence.reserve_client_slot("s1").await.unwrap());
        assert!(!persistence.reserve_client_slot("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SqlitePersistence::from_path(dir.path().join("nested/fleet.db"))
            .await
            .unwrap();

        assert!(persistence.health_check_db().await.unwrap());
    }
}
