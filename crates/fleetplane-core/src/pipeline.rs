// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Checkpointed step pipelines with reverse-order rollback.
//!
//! A [`Pipeline`] is an ordered list of idempotent [`Step`]s. The
//! [`PipelineEngine`] drives a persisted workflow through it:
//!
//! ```text
//! create -> running -> finished
//!              |
//!              v
//!        rolling-back -> rolled-back
//!              |
//!              v
//!            error
//! ```
//!
//! After every successful step the step's output is merged into the
//! workflow context and written together with the advanced step index in a
//! single conditional update. A crash before that write re-runs the step on
//! resume, so steps must detect their own prior side effects.
//!
//! A failed step records its error and enters `rolling-back` in one write,
//! so a crash never strands a workflow between failing and compensating.
//! The rollback walk includes the failed step itself: it may have created
//! something before failing, and its rollback must find that by name.
//! `error` is terminal and means the rollback itself failed.
//!
//! Every write is fenced on the owning node. If another node has taken the
//! workflow over, the write affects no row and the engine stops with
//! [`WorkflowOutcome::OwnershipLost`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::context::ExecutionContext;
use crate::error::CoreError;
use crate::persistence::{Persistence, WorkflowRecord};
use crate::state::WorkflowState;

/// Step failure, classified by kind.
///
/// The engine decides between retry and rollback from the variant alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Network or service hiccup; retried under the step's [`RetryPolicy`].
    #[error("transient failure: {0}")]
    Transient(String),
    /// A concurrent change got in the way; retried like a transient error.
    #[error("conflict: {0}")]
    Conflict(String),
    /// A wait budget was exhausted.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Unrecoverable failure.
    #[error("{0}")]
    Terminal(String),
}

impl StepError {
    /// Whether the engine should re-run the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict(_))
    }

    /// Short kind label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::Timeout(_) => "timeout",
            Self::Terminal(_) => "terminal",
        }
    }
}

impl From<CoreError> for StepError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database { .. } => Self::Transient(err.to_string()),
            CoreError::Locked { .. } => Self::Conflict(err.to_string()),
            other => Self::Terminal(other.to_string()),
        }
    }
}

/// Per-step retry budget for retryable errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// One idempotent unit of a pipeline.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used in logs and error messages.
    fn name(&self) -> &str;

    /// Run the step. The returned context is merged into the workflow
    /// context; return only the keys this step sets.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionContext, StepError>;

    /// Undo the step. Returns the context keys to drop.
    ///
    /// A resource that is already gone must count as undone.
    async fn rollback(&self, _ctx: &ExecutionContext) -> Result<Vec<String>, StepError> {
        Ok(Vec::new())
    }

    /// Retry budget for retryable errors.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// A named, ordered list of steps.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Append a shared step.
    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the pipeline has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// How a run of the engine ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    /// Every step completed.
    Finished(ExecutionContext),
    /// A step failed and every completed step was undone.
    RolledBack {
        /// The error that triggered the rollback.
        error: String,
    },
    /// Rollback itself failed; the workflow is left in `error`.
    Failed {
        /// The last recorded error.
        error: String,
    },
    /// Another node owns the workflow now.
    OwnershipLost,
}

/// Drives persisted workflows through their pipelines.
pub struct PipelineEngine {
    persistence: Arc<dyn Persistence>,
    node_id: String,
}

impl PipelineEngine {
    /// Create an engine acting as `node_id`.
    pub fn new(persistence: Arc<dyn Persistence>, node_id: impl Into<String>) -> Self {
        Self {
            persistence,
            node_id: node_id.into(),
        }
    }

    /// The node this engine writes as.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run or resume a workflow from its persisted state.
    ///
    /// Terminal states are reported without executing anything, so calling
    /// this again on a finished workflow is harmless.
    pub async fn run(
        &self,
        workflow_id: &str,
        pipeline: &Pipeline,
    ) -> Result<WorkflowOutcome, CoreError> {
        let record = self
            .persistence
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workflow", workflow_id))?;

        if record.owner_node_id != self.node_id {
            debug!(
                workflow_id,
                owner = %record.owner_node_id,
                node_id = %self.node_id,
                "Workflow owned by another node"
            );
            return Ok(WorkflowOutcome::OwnershipLost);
        }

        let ctx = record.context()?;
        let step_index = usize::try_from(record.step_index).unwrap_or(0);

        match record.state()? {
            WorkflowState::Create => {
                if !self
                    .transition(workflow_id, WorkflowState::Create, WorkflowState::Running, None)
                    .await?
                {
                    return Ok(WorkflowOutcome::OwnershipLost);
                }
                info!(workflow_id, pipeline = pipeline.name(), "Workflow started");
                self.run_forward(&record, pipeline, ctx, 0).await
            }
            WorkflowState::Running => {
                info!(
                    workflow_id,
                    pipeline = pipeline.name(),
                    step_index,
                    "Resuming workflow"
                );
                self.run_forward(&record, pipeline, ctx, step_index).await
            }
            WorkflowState::RollingBack => {
                let cause = record.last_error.clone().unwrap_or_default();
                info!(
                    workflow_id,
                    pipeline = pipeline.name(),
                    step_index,
                    "Resuming rollback"
                );
                self.run_rollback(&record, pipeline, ctx, step_index, cause)
                    .await
            }
            WorkflowState::Finished => Ok(WorkflowOutcome::Finished(ctx)),
            WorkflowState::RolledBack => Ok(WorkflowOutcome::RolledBack {
                error: record.last_error.unwrap_or_default(),
            }),
            WorkflowState::Error => Ok(WorkflowOutcome::Failed {
                error: record.last_error.unwrap_or_default(),
            }),
        }
    }

    async fn run_forward(
        &self,
        record: &WorkflowRecord,
        pipeline: &Pipeline,
        mut ctx: ExecutionContext,
        start: usize,
    ) -> Result<WorkflowOutcome, CoreError> {
        let workflow_id = record.workflow_id.as_str();

        for (index, step) in pipeline.steps.iter().enumerate().skip(start) {
            debug!(workflow_id, step = step.name(), index, "Executing step");

            let result = retrying(step.name(), step.retry_policy(), || step.execute(&ctx)).await;

            match result {
                Ok(output) => {
                    ctx.merge(output);
                    if !self
                        .checkpoint(workflow_id, WorkflowState::Running, index, index + 1, &ctx)
                        .await?
                    {
                        return Ok(WorkflowOutcome::OwnershipLost);
                    }
                    info!(workflow_id, step = step.name(), index, "Step completed");
                }
                Err(e) => {
                    let cause = format!("step '{}' failed: {}", step.name(), e);
                    error!(
                        workflow_id,
                        step = step.name(),
                        kind = e.kind(),
                        error = %e,
                        "Step failed, rolling back"
                    );

                    let applied = self
                        .persistence
                        .begin_workflow_rollback(
                            workflow_id,
                            &self.node_id,
                            step_number(index)?,
                            step_number(index + 1)?,
                            &cause,
                            Utc::now(),
                        )
                        .await?;
                    if !applied {
                        warn!(
                            workflow_id,
                            node_id = %self.node_id,
                            index,
                            "Rollback start rejected, ownership lost"
                        );
                        return Ok(WorkflowOutcome::OwnershipLost);
                    }

                    return self
                        .run_rollback(record, pipeline, ctx, index + 1, cause)
                        .await;
                }
            }
        }

        if !self
            .transition(workflow_id, WorkflowState::Running, WorkflowState::Finished, None)
            .await?
        {
            return Ok(WorkflowOutcome::OwnershipLost);
        }

        info!(workflow_id, pipeline = pipeline.name(), "Workflow finished");
        Ok(WorkflowOutcome::Finished(ctx))
    }

    /// Undo the first `completed` steps in reverse order. Resumes from the
    /// persisted step index after a takeover.
    async fn run_rollback(
        &self,
        record: &WorkflowRecord,
        pipeline: &Pipeline,
        mut ctx: ExecutionContext,
        completed: usize,
        cause: String,
    ) -> Result<WorkflowOutcome, CoreError> {
        let workflow_id = record.workflow_id.as_str();
        let completed = completed.min(pipeline.steps.len());

        for index in (0..completed).rev() {
            let step = &pipeline.steps[index];
            debug!(workflow_id, step = step.name(), index, "Rolling back step");

            match retrying(step.name(), step.retry_policy(), || step.rollback(&ctx)).await {
                Ok(removed) => {
                    for key in &removed {
                        ctx.remove(key);
                    }
                    if !self
                        .checkpoint(workflow_id, WorkflowState::RollingBack, index + 1, index, &ctx)
                        .await?
                    {
                        return Ok(WorkflowOutcome::OwnershipLost);
                    }
                }
                Err(e) => {
                    let message = format!("rollback of step '{}' failed: {}", step.name(), e);
                    error!(workflow_id, step = step.name(), error = %e, "Rollback failed");

                    if !self
                        .transition(
                            workflow_id,
                            WorkflowState::RollingBack,
                            WorkflowState::Error,
                            Some(&message),
                        )
                        .await?
                    {
                        return Ok(WorkflowOutcome::OwnershipLost);
                    }
                    return Ok(WorkflowOutcome::Failed { error: message });
                }
            }
        }

        if !self
            .transition(
                workflow_id,
                WorkflowState::RollingBack,
                WorkflowState::RolledBack,
                None,
            )
            .await?
        {
            return Ok(WorkflowOutcome::OwnershipLost);
        }

        info!(workflow_id, pipeline = pipeline.name(), "Workflow rolled back");
        Ok(WorkflowOutcome::RolledBack { error: cause })
    }

    async fn transition(
        &self,
        workflow_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        last_error: Option<&str>,
    ) -> Result<bool, CoreError> {
        let applied = self
            .persistence
            .try_transition_workflow(workflow_id, &self.node_id, from, to, last_error)
            .await?;
        if !applied {
            warn!(
                workflow_id,
                node_id = %self.node_id,
                from = %from,
                to = %to,
                "Workflow transition rejected, ownership lost"
            );
        }
        Ok(applied)
    }

    async fn checkpoint(
        &self,
        workflow_id: &str,
        state: WorkflowState,
        expected: usize,
        next: usize,
        ctx: &ExecutionContext,
    ) -> Result<bool, CoreError> {
        let bytes = ctx.to_bytes()?;
        let applied = self
            .persistence
            .checkpoint_workflow(
                workflow_id,
                &self.node_id,
                state,
                step_number(expected)?,
                step_number(next)?,
                &bytes,
                Utc::now(),
            )
            .await?;
        if !applied {
            warn!(
                workflow_id,
                node_id = %self.node_id,
                expected,
                "Checkpoint rejected, ownership lost"
            );
        }
        Ok(applied)
    }
}

fn step_number(index: usize) -> Result<i32, CoreError> {
    i32::try_from(index).map_err(|_| CoreError::validation("step_index", "too many steps"))
}

async fn retrying<T, F, Fut>(name: &str, policy: RetryPolicy, mut op: F) -> Result<T, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    step = name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Retrying step"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
