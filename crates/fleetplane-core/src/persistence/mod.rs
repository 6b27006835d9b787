//! Persistence interfaces and backends for fleetplane-core.
//!
//! This module defines the persistence abstraction and backend implementations.
//! Every state change the orchestration core relies on is a conditional
//! single-row update that reports whether it applied; callers treat `false`
//! as "someone else won" rather than as an error.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::context::ExecutionContext;
use crate::error::CoreError;
use crate::state::{
    FleetState, NodeState, ProcessState, ScalingGroupState, SessionState, TaskType, WorkflowState,
};

/// Work node record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkNodeRecord {
    /// Node identifier.
    pub node_id: String,
    /// Current state (running, error, taking-over, terminated).
    pub state: String,
    /// Node absorbing this node's work, if any.
    pub take_over_id: Option<String>,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// When the node first registered.
    pub created_at: DateTime<Utc>,
}

impl WorkNodeRecord {
    /// Parsed state.
    pub fn state(&self) -> Result<NodeState, CoreError> {
        self.state.parse()
    }
}

/// Workflow record: one unit of ownable, resumable work.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowRecord {
    /// Workflow identifier.
    pub workflow_id: String,
    /// Resource the workflow acts on (fleet id, group id, image name).
    pub resource_id: String,
    /// Pipeline discriminant.
    pub task_type: String,
    /// JSON-encoded parameters.
    pub params: Vec<u8>,
    /// JSON-encoded [`ExecutionContext`] as of the last checkpoint.
    pub context: Vec<u8>,
    /// Number of completed steps.
    pub step_index: i32,
    /// Current state.
    pub state: String,
    /// Work node that owns this workflow.
    pub owner_node_id: String,
    /// Last recorded error.
    pub last_error: Option<String>,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// Last checkpoint or transition.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Parsed state.
    pub fn state(&self) -> Result<WorkflowState, CoreError> {
        self.state.parse()
    }

    /// Parsed task type.
    pub fn task_type(&self) -> Result<TaskType, CoreError> {
        self.task_type.parse()
    }

    /// Decoded checkpointed context.
    pub fn context(&self) -> Result<ExecutionContext, CoreError> {
        ExecutionContext::from_bytes(&self.context)
    }

    /// Decoded parameters.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        Ok(serde_json::from_slice(&self.params)?)
    }
}

/// Input for creating a workflow.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    /// Workflow identifier.
    pub workflow_id: String,
    /// Resource the workflow acts on.
    pub resource_id: String,
    /// Pipeline discriminant.
    pub task_type: TaskType,
    /// JSON-encoded parameters.
    pub params: Vec<u8>,
    /// Initial context (e.g. region).
    pub context: ExecutionContext,
    /// Owning work node.
    pub owner_node_id: String,
}

/// Fleet record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FleetRecord {
    /// Fleet identifier.
    pub fleet_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Delegated role exchanged for cloud credentials.
    pub role_id: String,
    /// Human-readable name.
    pub name: String,
    /// Cloud region.
    pub region: String,
    /// Machine image instances boot from.
    pub image_id: String,
    /// Instance type for scaling group members.
    pub instance_type: String,
    /// Current state.
    pub state: String,
    /// Last workflow error.
    pub last_error: Option<String>,
    /// When the fleet was created.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl FleetRecord {
    /// Parsed state.
    pub fn state(&self) -> Result<FleetState, CoreError> {
        self.state.parse()
    }
}

/// Scaling group record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScalingGroupRecord {
    /// Group identifier.
    pub group_id: String,
    /// Fleet the group belongs to.
    pub fleet_id: String,
    /// Cloud region.
    pub region: String,
    /// Id of the group in the external scaling API, once created.
    pub remote_group_id: Option<String>,
    /// Lower bound on instances.
    pub min_size: i32,
    /// Upper bound on instances.
    pub max_size: i32,
    /// Explicit desired instance count.
    pub desired_size: i32,
    /// Current state.
    pub state: String,
    /// Cool-down between scaling actions, in seconds.
    pub cool_down_secs: i64,
    /// Whether policies drive the target instead of `desired_size`.
    pub enable_auto_scaling: bool,
    /// Cleared on soft delete.
    pub visible: bool,
    /// When a scaling action was last applied; starts the cool-down.
    pub last_scaled_at: Option<DateTime<Utc>>,
    /// When the group was created.
    pub created_at: DateTime<Utc>,
    /// Last change. Also the age of a `scaling` lock.
    pub updated_at: DateTime<Utc>,
}

impl ScalingGroupRecord {
    /// Parsed state.
    pub fn state(&self) -> Result<ScalingGroupState, CoreError> {
        self.state.parse()
    }
}

/// Auto-scaling policy attached to a group.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScalingPolicyRecord {
    /// Policy identifier.
    pub policy_id: String,
    /// Group the policy applies to.
    pub group_id: String,
    /// Tracked metric, e.g. `session_utilization`.
    pub metric: String,
    /// Target value for the metric.
    pub target_value: f64,
    /// When the policy was created.
    pub created_at: DateTime<Utc>,
}

/// Server process hosting sessions.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessRecord {
    /// Process identifier.
    pub process_id: String,
    /// Fleet the process runs in.
    pub fleet_id: String,
    /// Instance the process runs on.
    pub instance_id: String,
    /// Address used to reach the process.
    pub address: String,
    /// Current state.
    pub state: String,
    /// Session capacity.
    pub max_sessions: i32,
    /// Sessions currently routed here.
    pub current_sessions: i32,
    /// When the process registered.
    pub created_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Parsed state.
    pub fn state(&self) -> Result<ProcessState, CoreError> {
        self.state.parse()
    }

    /// Free session slots.
    pub fn free_slots(&self) -> i32 {
        (self.max_sessions - self.current_sessions).max(0)
    }
}

/// Server session (reservation) record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRecord {
    /// Session identifier.
    pub session_id: String,
    /// Fleet the session must be placed in.
    pub fleet_id: String,
    /// Current state.
    pub state: String,
    /// Process the session was dispatched to.
    pub process_id: Option<String>,
    /// Maximum client sessions.
    pub max_clients: i32,
    /// Client sessions created so far.
    pub current_clients: i32,
    /// Placement deadline while `creating`, activation deadline while `activating`.
    pub deadline_at: DateTime<Utc>,
    /// Failure or termination reason.
    pub reason: Option<String>,
    /// When the session was requested.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Parsed state.
    pub fn state(&self) -> Result<SessionState, CoreError> {
        self.state.parse()
    }
}

/// Persistence interface used by the orchestration core.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Work nodes
    // ------------------------------------------------------------------

    /// Insert the node as `running`, or bring an existing row back to `running`.
    async fn register_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<(), CoreError>;

    async fn get_node(&self, node_id: &str) -> Result<Option<WorkNodeRecord>, CoreError>;

    async fn list_nodes(&self) -> Result<Vec<WorkNodeRecord>, CoreError>;

    /// Refresh the heartbeat. Returns false if the node is unknown.
    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError>;

    /// Nodes in `running`/`taking-over` whose heartbeat is older than `cutoff`.
    async fn list_stale_nodes(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkNodeRecord>, CoreError>;

    /// Flip a node to `error` only if it is still in `expected` and still stale.
    async fn mark_node_dead(
        &self,
        node_id: &str,
        expected: NodeState,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// `error -> taking-over` with `take_over_id = live_node_id`.
    async fn claim_dead_node(
        &self,
        dead_node_id: &str,
        live_node_id: &str,
    ) -> Result<bool, CoreError>;

    /// `taking-over -> terminated`, only if `live_node_id` holds the claim.
    async fn complete_takeover(
        &self,
        dead_node_id: &str,
        live_node_id: &str,
    ) -> Result<bool, CoreError>;

    async fn try_transition_node(
        &self,
        node_id: &str,
        from: NodeState,
        to: NodeState,
    ) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    async fn create_workflow(
        &self,
        workflow: &NewWorkflow,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn get_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowRecord>, CoreError>;

    async fn list_workflows_by_owner(
        &self,
        node_id: &str,
    ) -> Result<Vec<WorkflowRecord>, CoreError>;

    async fn list_workflows_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Vec<WorkflowRecord>, CoreError>;

    /// Conditional state change fenced on the owner.
    async fn try_transition_workflow(
        &self,
        workflow_id: &str,
        owner_node_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        last_error: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Persist step progress and context in one row update, fenced on the
    /// owner, the state and the step index the caller started from.
    #[allow(clippy::too_many_arguments)]
    async fn checkpoint_workflow(
        &self,
        workflow_id: &str,
        owner_node_id: &str,
        state: WorkflowState,
        expected_step: i32,
        new_step: i32,
        context: &[u8],
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Move a `running` workflow stuck at `failed_step` straight to
    /// `rolling-back`, recording the cause and the step to undo from in the
    /// same row update.
    #[allow(clippy::too_many_arguments)]
    async fn begin_workflow_rollback(
        &self,
        workflow_id: &str,
        owner_node_id: &str,
        failed_step: i32,
        rollback_from: i32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Set the owner of every workflow owned by `from_node_id`. Returns the count moved.
    async fn reassign_workflows(
        &self,
        from_node_id: &str,
        to_node_id: &str,
    ) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------
    // Fleets
    // ------------------------------------------------------------------

    async fn create_fleet(&self, fleet: &FleetRecord) -> Result<(), CoreError>;

    async fn get_fleet(&self, fleet_id: &str) -> Result<Option<FleetRecord>, CoreError>;

    async fn list_fleets(&self, include_deleted: bool) -> Result<Vec<FleetRecord>, CoreError>;

    async fn try_transition_fleet(
        &self,
        fleet_id: &str,
        from: FleetState,
        to: FleetState,
        last_error: Option<&str>,
    ) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Scaling groups
    // ------------------------------------------------------------------

    async fn create_scaling_group(&self, group: &ScalingGroupRecord) -> Result<(), CoreError>;

    async fn get_scaling_group(
        &self,
        group_id: &str,
    ) -> Result<Option<ScalingGroupRecord>, CoreError>;

    async fn get_scaling_group_by_fleet(
        &self,
        fleet_id: &str,
    ) -> Result<Option<ScalingGroupRecord>, CoreError>;

    async fn list_scaling_groups(
        &self,
        state: ScalingGroupState,
    ) -> Result<Vec<ScalingGroupRecord>, CoreError>;

    /// The group-level lock: compare-and-swap on state.
    async fn try_transition_group(
        &self,
        group_id: &str,
        from: ScalingGroupState,
        to: ScalingGroupState,
    ) -> Result<bool, CoreError>;

    async fn set_remote_group_id(
        &self,
        group_id: &str,
        remote_group_id: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Write bounds; only applies while the group is held in `scaling`.
    async fn update_group_capacity(
        &self,
        group_id: &str,
        min_size: i32,
        max_size: i32,
        desired_size: i32,
    ) -> Result<bool, CoreError>;

    /// Toggle auto-scaling; only applies while the group is held in `scaling`.
    async fn set_group_auto_scaling(&self, group_id: &str, enabled: bool)
    -> Result<bool, CoreError>;

    /// `scaling -> stable` for a group nobody has touched since `cutoff`.
    /// Frees the lock of a holder that died mid-change.
    async fn release_stale_group_lock(
        &self,
        group_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Stamp the last applied scaling action; only applies while the group
    /// is held in `scaling`.
    async fn record_group_scaled(&self, group_id: &str, at: DateTime<Utc>)
    -> Result<bool, CoreError>;

    /// `deleting -> deleted` and clear the visible flag.
    async fn soft_delete_group(&self, group_id: &str) -> Result<bool, CoreError>;

    async fn put_scaling_policy(&self, policy: &ScalingPolicyRecord) -> Result<(), CoreError>;

    async fn delete_scaling_policy(&self, policy_id: &str) -> Result<bool, CoreError>;

    async fn list_scaling_policies(
        &self,
        group_id: &str,
    ) -> Result<Vec<ScalingPolicyRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Processes and sessions
    // ------------------------------------------------------------------

    async fn register_process(&self, process: &ProcessRecord) -> Result<(), CoreError>;

    async fn get_process(&self, process_id: &str) -> Result<Option<ProcessRecord>, CoreError>;

    /// Active processes of a fleet, full or not.
    async fn list_processes(&self, fleet_id: &str) -> Result<Vec<ProcessRecord>, CoreError>;

    /// Active processes of a fleet with at least one free slot.
    async fn list_available_processes(
        &self,
        fleet_id: &str,
    ) -> Result<Vec<ProcessRecord>, CoreError>;

    async fn set_process_state(
        &self,
        process_id: &str,
        state: ProcessState,
    ) -> Result<bool, CoreError>;

    async fn create_session(&self, session: &SessionRecord) -> Result<(), CoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CoreError>;

    /// Sessions in `state`, oldest first.
    async fn list_sessions_in_state(
        &self,
        state: SessionState,
        limit: i64,
    ) -> Result<Vec<SessionRecord>, CoreError>;

    /// In one transaction: `creating -> activating` with the process assigned,
    /// and the process's session counter incremented if it has room.
    /// Neither write is kept unless both apply.
    async fn dispatch_session(
        &self,
        session_id: &str,
        process_id: &str,
        activation_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Conditional session transition. Leaving a slot-holding state for a
    /// terminal one releases the process slot in the same transaction.
    async fn try_transition_session(
        &self,
        session_id: &str,
        from: SessionState,
        to: SessionState,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// `activating` sessions whose activation deadline is before `now`.
    async fn list_expired_activations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, CoreError>;

    /// Increment the client count of an `active` session below its maximum.
    async fn reserve_client_slot(&self, session_id: &str) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
