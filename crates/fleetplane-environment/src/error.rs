// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fleetplane-environment.

use fleetplane_core::CoreError;
use thiserror::Error;

use crate::cloud::CloudError;

/// Environment errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A cloud API call failed.
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// Core orchestration or persistence error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Every attempt at a scaling decision found the group changed underneath it.
    #[error("scaling decision for group '{group_id}' expired {attempts} times in a row")]
    DecisionRetriesExhausted {
        /// Local scaling group id.
        group_id: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Machine-readable code returned by the produced API.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Cloud(CloudError::NotFound { .. }) => "NOT_FOUND",
            Self::Cloud(_) => "CLOUD_ERROR",
            Self::Core(e) => e.error_code(),
            Self::DecisionRetriesExhausted { .. } => "DECISION_EXPIRED",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_codes_pass_through() {
        let err: Error = CoreError::locked("scaling group", "g1").into();
        assert_eq!(err.error_code(), "LOCKED");
        assert_eq!(err.to_string(), "scaling group 'g1' is locked, retry later");
    }

    #[test]
    fn test_cloud_codes() {
        let err: Error = CloudError::not_found("subnet", "s1").into();
        assert_eq!(err.error_code(), "NOT_FOUND");
        let err: Error = CloudError::Transient("timeout".into()).into();
        assert_eq!(err.error_code(), "CLOUD_ERROR");
    }
}
