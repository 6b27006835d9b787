// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetplane Core - Crash-Tolerant Orchestration
//!
//! This crate holds the parts of the fleet control plane that must stay
//! correct when control-plane processes crash: who owns which workflow, how
//! ownership moves when a process dies, and how a multi-step provisioning
//! workflow resumes from its last checkpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    fleetplane-environment                         │
//! │   (FleetService, Reconciler, Dispatcher, NodeMonitor, Steps)      │
//! └──────────────────────────────────────────────────────────────────┘
//!            │                     │                      │
//!            ▼                     ▼                      ▼
//! ┌──────────────────┐  ┌────────────────────┐  ┌──────────────────┐
//! │  NodeRegistry    │  │  PipelineEngine    │  │  wait_until      │
//! │  heartbeat,      │  │  checkpoint after  │  │  fixed-interval  │
//! │  takeover        │  │  every step        │  │  polling         │
//! └──────────────────┘  └────────────────────┘  └──────────────────┘
//!            │                     │
//!            ▼                     ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │            Persistence (PostgreSQL | SQLite)                      │
//! │        conditional single-row updates, small transactions         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! Several work nodes run the same code against one database. No in-process
//! locks guard shared state because ownership moves between processes. The
//! only contended fields (work node state, scaling group state) change
//! through compare-and-swap updates that report whether they applied.
//!
//! # Workflow State Machine
//!
//! | State | Description |
//! |-------|-------------|
//! | `create` | Persisted, not yet started |
//! | `running` | Executing steps; `step_index` counts completed steps |
//! | `error` | A step failed; `last_error` is set |
//! | `rolling-back` | Undoing completed steps in reverse order |
//! | `rolled-back` | Every completed step was undone |
//! | `finished` | All steps completed |
//!
//! # Modules
//!
//! - [`context`]: typed key/value context persisted with each checkpoint
//! - [`error`]: error type with machine-readable codes
//! - [`migrations`]: embedded schema migrations
//! - [`node_registry`]: work node heartbeats and takeover
//! - [`persistence`]: storage trait and backends
//! - [`pipeline`]: steps, pipelines and the checkpointing engine
//! - [`poll`]: bounded waits on asynchronous external work
//! - [`state`]: persisted state enums

#![deny(missing_docs)]

/// Typed execution context.
pub mod context;

/// Error types with machine-readable codes.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Work node registry and takeover protocol.
pub mod node_registry;

/// Persistence layer with PostgreSQL and SQLite backends.
pub mod persistence;

/// Checkpointed step pipelines.
pub mod pipeline;

/// Fixed-interval polling helper.
pub mod poll;

/// Persisted state enums.
pub mod state;

pub use context::{ContextValue, ExecutionContext};
pub use error::{CoreError, Result};
pub use node_registry::{NodeRegistry, SweepReport, TakeoverOutcome};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use pipeline::{
    Pipeline, PipelineEngine, RetryPolicy, Step, StepError, WorkflowOutcome,
};
pub use poll::{WaitBudget, wait_until};
