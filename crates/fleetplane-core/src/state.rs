// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State enums for every persisted entity.
//!
//! States are stored as TEXT; each enum converts with `as_str()` / `FromStr`.

use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

macro_rules! text_state {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Returns the persisted string representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(CoreError::Serialization(format!(
                        "unknown {} '{}'",
                        $kind, other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_state! {
    /// Lifecycle of a work node (one control-plane process).
    NodeState, "node state" {
        /// Alive and heartbeating.
        Running => "running",
        /// Declared dead by a peer; its work is up for takeover.
        Error => "error",
        /// A live node is absorbing this node's work.
        TakingOver => "taking-over",
        /// Shut down gracefully or fully absorbed.
        Terminated => "terminated",
    }
}

text_state! {
    /// Workflow state machine:
    /// `create -> running -> {finished | rolling-back -> {rolled-back | error}}`.
    ///
    /// A failed step records its error while entering `rolling-back`.
    WorkflowState, "workflow state" {
        /// Persisted, not yet started.
        Create => "create",
        /// Executing steps forward.
        Running => "running",
        /// Rollback failed; the last error is recorded. Needs an operator.
        Error => "error",
        /// Executing inverse actions of the failed step and those before it.
        RollingBack => "rolling-back",
        /// Rollback completed.
        RolledBack => "rolled-back",
        /// All steps completed.
        Finished => "finished",
    }
}

impl WorkflowState {
    /// States a live owner should (re-)enter the engine for.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Create | Self::Running | Self::RollingBack)
    }
}

text_state! {
    /// Discriminant selecting which pipeline a workflow runs.
    TaskType, "task type" {
        /// Provision network, security group and scaling group for a fleet.
        CreateFleet => "create-fleet",
        /// Drain and tear down a fleet's infrastructure.
        DeleteFleet => "delete-fleet",
        /// Bake a machine image from a builder instance.
        BuildImage => "build-image",
    }
}

text_state! {
    /// Fleet lifecycle.
    FleetState, "fleet state" {
        /// Provisioning workflow in progress.
        Creating => "creating",
        /// Infrastructure exists and is reconciled.
        Active => "active",
        /// A workflow failed; see `last_error`.
        Error => "error",
        /// Teardown workflow in progress.
        Deleting => "deleting",
        /// Torn down.
        Deleted => "deleted",
    }
}

text_state! {
    /// Scaling group lifecycle. `creating`, `error` and `deleted` are internal.
    ScalingGroupState, "scaling group state" {
        /// Being provisioned.
        Creating => "creating",
        /// Idle; may be locked for a change.
        Stable => "stable",
        /// Locked by an in-flight change or scaling decision.
        Scaling => "scaling",
        /// Provisioning or scaling failed.
        Error => "error",
        /// Being torn down.
        Deleting => "deleting",
        /// Soft-deleted.
        Deleted => "deleted",
    }
}

impl ScalingGroupState {
    /// Whether the state is hidden from callers.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Creating | Self::Error | Self::Deleted)
    }
}

text_state! {
    /// Server session lifecycle.
    SessionState, "session state" {
        /// Waiting for a process.
        Creating => "creating",
        /// Routed to a process, waiting for it to confirm.
        Activating => "activating",
        /// Confirmed by the process.
        Active => "active",
        /// Ended normally.
        Terminated => "terminated",
        /// Placement or activation failed.
        Error => "error",
    }
}

impl SessionState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    /// Whether the session holds a slot on its process.
    pub fn holds_process_slot(&self) -> bool {
        matches!(self, Self::Activating | Self::Active)
    }
}

text_state! {
    /// Server process lifecycle.
    ProcessState, "process state" {
        /// Accepting sessions.
        Active => "active",
        /// Not accepting new sessions.
        Draining => "draining",
        /// Gone.
        Terminated => "terminated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            WorkflowState::Create,
            WorkflowState::Running,
            WorkflowState::Error,
            WorkflowState::RollingBack,
            WorkflowState::RolledBack,
            WorkflowState::Finished,
        ] {
            assert_eq!(state.as_str().parse::<WorkflowState>().unwrap(), state);
        }
        assert_eq!("taking-over".parse::<NodeState>().unwrap(), NodeState::TakingOver);
    }

    #[test]
    fn test_unknown_state_is_error() {
        let err = "sleeping".parse::<NodeState>().unwrap_err();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_internal_group_states() {
        assert!(ScalingGroupState::Creating.is_internal());
        assert!(ScalingGroupState::Deleted.is_internal());
        assert!(!ScalingGroupState::Stable.is_internal());
        assert!(!ScalingGroupState::Deleting.is_internal());
    }

    #[test]
    fn test_resumable_workflow_states() {
        assert!(WorkflowState::Running.is_resumable());
        assert!(WorkflowState::RollingBack.is_resumable());
        assert!(!WorkflowState::Finished.is_resumable());
        assert!(!WorkflowState::Error.is_resumable());
    }
}
