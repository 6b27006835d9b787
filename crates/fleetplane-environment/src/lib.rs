// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetplane Environment - Fleet Control Plane
//!
//! This crate runs the control plane for elastic compute fleets on top of
//! the crash-tolerant orchestration in `fleetplane-core`. It provisions and
//! tears down fleets through checkpointed workflows, keeps each fleet's
//! scaling group at its target size, and places server sessions on the
//! processes running in the fleet.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Transport layer (HTTP, CLI, ...)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 fleetplane-environment (This Crate)                      │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Fleet     │  │  Workflow   │  │ Reconciler  │  │  Session    │     │
//! │  │  Service    │  │  Executor   │  │             │  │ Dispatcher  │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! │         ┌─────────────┐  ┌──────────────────────────────────┐           │
//! │         │    Node     │  │  Steps: network, compute, image, │           │
//! │         │   Monitor   │  │  teardown                        │           │
//! │         └─────────────┘  └──────────────────────────────────┘           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                     │                              │
//!           ▼                     ▼                              ▼
//! ┌───────────────────┐  ┌───────────────────┐      ┌─────────────────────────┐
//! │  fleetplane-core  │  │ Credential cache  │      │  Server processes       │
//! │  registry, engine │  │ + cloud APIs      │      │  (ProcessClient)        │
//! └───────────────────┘  └───────────────────┘      └─────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                     PostgreSQL | SQLite                                │
//! │   work nodes, workflows, fleets, scaling groups, processes, sessions  │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Several work nodes run this crate against one database. Each node
//! heartbeats; when one dies, a peer takes over its workflows and resumes
//! them from their last checkpoint.
//!
//! # Produced API
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `create_fleet` | Persist a fleet and its scaling group, start `create-fleet` |
//! | `delete_fleet` | `active`/`error` to `deleting`, start `delete-fleet` |
//! | `build_image` | Start `build-image` |
//! | `get_fleet` / `list_fleets` | Read fleets (deleted ones hidden) |
//! | `workflow_status` / `list_workflows` | Workflow progress |
//! | `get_scaling_group` | Read a group (internal states hidden) |
//! | `update_scaling_group` | New bounds, under the group lock |
//! | `set_auto_scaling` | Toggle target tracking, under the group lock |
//! | `put_scaling_policy` / `delete_scaling_policy` | Manage policies, under the group lock |
//! | `register_process` / `drain_process` | Session hosts |
//! | `create_session` / `terminate_session` | Session lifecycle |
//! | `reserve_client_slot` | Take a client slot on an active session |
//!
//! # Fleet State Machine
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | `creating` | `active` | `create-fleet` finished |
//! | `creating` | `error` | `create-fleet` rolled back |
//! | `active`, `error` | `deleting` | `delete_fleet` |
//! | `deleting` | `deleted` | `delete-fleet` finished |
//! | `deleting` | `error` | `delete-fleet` failed |
//!
//! # Session State Machine
//!
//! ```text
//!   creating ──dispatch──▶ activating ──confirmed──▶ active ──▶ terminated
//!      │                      │
//!      │ placement deadline   │ refused / activation deadline
//!      ▼                      ▼
//!    error                  error
//! ```
//!
//! # Configuration
//!
//! Loaded from `FLEETPLANE_*` environment variables, see [`config::Config`].
//!
//! # Modules
//!
//! - [`cloud`]: cloud API contracts and the in-memory provider
//! - [`config`]: configuration from environment variables
//! - [`credentials`]: per-tenant credential cache
//! - [`dispatcher`]: session dispatcher and pickers
//! - [`error`]: error types
//! - [`executor`]: workflow execution and resource finalization
//! - [`node_monitor`]: heartbeat, takeover and resumption worker
//! - [`reconciler`]: scaling group reconciliation loop
//! - [`runtime`]: embeddable runtime
//! - [`service`]: produced API
//! - [`steps`]: idempotent provisioning steps
//! - [`workflows`]: pipelines per task type

#![deny(missing_docs)]

/// Cloud API contracts and the in-memory provider.
pub mod cloud;

/// Configuration loaded from environment variables.
pub mod config;

/// Credential exchange and caching.
pub mod credentials;

/// Session dispatch.
pub mod dispatcher;

/// Error types.
pub mod error;

/// Workflow execution.
pub mod executor;

/// Background worker for node liveness and takeover.
pub mod node_monitor;

/// Scaling group reconciliation.
pub mod reconciler;

/// Embeddable runtime.
pub mod runtime;

/// Produced control-plane API.
pub mod service;

/// Idempotent provisioning and teardown steps.
pub mod steps;

/// Pipelines per task type.
pub mod workflows;

pub use config::Config;
pub use error::Error;
pub use service::FleetService;
