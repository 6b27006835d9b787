// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fleetplane-core.
//!
//! Provides a unified error type with machine-readable codes for the
//! produced API.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while orchestrating work.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Entity was not found in the database.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Entity kind (fleet, workflow, node, ...).
        kind: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// Entity is in a state that does not permit the requested operation.
    #[error("{kind} '{id}' is in invalid state: expected '{expected}', got '{actual}'")]
    InvalidState {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: String,
        /// The expected state(s).
        expected: String,
        /// The actual state.
        actual: String,
    },

    /// A conditional update lost the race; the entity is held by someone else.
    #[error("{kind} '{id}' is locked, retry later")]
    Locked {
        /// Entity kind.
        kind: &'static str,
        /// Entity id.
        id: String,
    },

    /// The workflow is no longer owned by this work node.
    #[error("workflow '{workflow_id}' is no longer owned by node '{node_id}'")]
    OwnershipLost {
        /// Workflow id.
        workflow_id: String,
        /// The node that lost ownership.
        node_id: String,
    },

    /// Input validation failed.
    #[error("validation failed for {field}: {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Persisted data could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Database operation failed.
    #[error("database error during {operation}: {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Locked { .. } => "LOCKED",
            Self::OwnershipLost { .. } => "OWNERSHIP_LOST",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Shorthand for a [`CoreError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for a [`CoreError::Locked`].
    pub fn locked(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Locked {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for a [`CoreError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
