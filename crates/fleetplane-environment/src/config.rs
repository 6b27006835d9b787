// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use fleetplane_core::WaitBudget;

use crate::dispatcher::PickerKind;

/// Fleetplane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL.
    pub database_url: String,
    /// This work node's id.
    pub node_id: String,
    /// Heartbeat and dead-node scan period.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a node counts as dead.
    pub node_stale_after: Duration,
    /// Reconciliation period.
    pub reconcile_interval: Duration,
    /// Attempts per scaling decision before giving up.
    pub scaling_decision_attempts: u32,
    /// Age after which a scaling group lock is presumed abandoned.
    pub scaling_lock_timeout: Duration,
    /// Pause between dispatch rounds.
    pub dispatch_interval: Duration,
    /// Sessions fetched per dispatch round.
    pub dispatch_batch_size: i64,
    /// Rounds between picker cache clears.
    pub dispatch_round_threshold: u64,
    /// Picker strategy.
    pub picker: PickerKind,
    /// Time a process has to confirm an activation.
    pub activation_timeout: Duration,
    /// Time a session may wait for placement.
    pub placement_timeout: Duration,
    /// Subnet and instance boot waits.
    pub resource_wait: WaitBudget,
    /// Wait for scaling group instances to shut off.
    pub shutdown_wait: WaitBudget,
    /// Image build wait.
    pub image_wait: WaitBudget,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FLEETPLANE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Everything else is optional and falls back to the defaults listed on
    /// each field's variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FLEETPLANE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FLEETPLANE_DATABASE_URL"))?;

        let node_id = std::env::var("FLEETPLANE_NODE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let heartbeat_interval = secs("FLEETPLANE_HEARTBEAT_INTERVAL_SECS", 10)?;
        let node_stale_after = secs("FLEETPLANE_NODE_STALE_SECS", 60)?;
        if node_stale_after <= heartbeat_interval {
            return Err(ConfigError::Invalid(
                "FLEETPLANE_NODE_STALE_SECS",
                "must be greater than the heartbeat interval",
            ));
        }

        let scaling_decision_attempts: u32 = parse("FLEETPLANE_SCALING_DECISION_ATTEMPTS", 3)?;
        if scaling_decision_attempts == 0 {
            return Err(ConfigError::Invalid(
                "FLEETPLANE_SCALING_DECISION_ATTEMPTS",
                "must be at least 1",
            ));
        }

        let scaling_lock_timeout = secs("FLEETPLANE_SCALING_LOCK_TIMEOUT_SECS", 300)?;
        if scaling_lock_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "FLEETPLANE_SCALING_LOCK_TIMEOUT_SECS",
                "must be at least 1",
            ));
        }

        let picker = std::env::var("FLEETPLANE_PICKER")
            .unwrap_or_else(|_| "busiest-first".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FLEETPLANE_PICKER", "must be busiest-first or round-robin")
            })?;

        Ok(Self {
            database_url,
            node_id,
            heartbeat_interval,
            node_stale_after,
            reconcile_interval: secs("FLEETPLANE_RECONCILE_INTERVAL_SECS", 30)?,
            scaling_decision_attempts,
            scaling_lock_timeout,
            dispatch_interval: Duration::from_millis(parse("FLEETPLANE_DISPATCH_INTERVAL_MS", 1000)?),
            dispatch_batch_size: parse("FLEETPLANE_DISPATCH_BATCH_SIZE", 100)?,
            dispatch_round_threshold: parse("FLEETPLANE_DISPATCH_ROUND_THRESHOLD", 100)?,
            picker,
            activation_timeout: secs("FLEETPLANE_ACTIVATION_TIMEOUT_SECS", 30)?,
            placement_timeout: secs("FLEETPLANE_PLACEMENT_TIMEOUT_SECS", 60)?,
            resource_wait: budget(
                "FLEETPLANE_RESOURCE_WAIT_ATTEMPTS",
                60,
                "FLEETPLANE_RESOURCE_WAIT_INTERVAL_SECS",
                5,
            )?,
            shutdown_wait: budget(
                "FLEETPLANE_SHUTDOWN_WAIT_ATTEMPTS",
                60,
                "FLEETPLANE_SHUTDOWN_WAIT_INTERVAL_SECS",
                10,
            )?,
            image_wait: budget(
                "FLEETPLANE_IMAGE_WAIT_ATTEMPTS",
                120,
                "FLEETPLANE_IMAGE_WAIT_INTERVAL_SECS",
                30,
            )?,
        })
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

fn parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse(key, default)?))
}

fn budget(
    attempts_key: &'static str,
    default_attempts: u32,
    interval_key: &'static str,
    default_interval: u64,
) -> Result<WaitBudget, ConfigError> {
    Ok(WaitBudget::new(
        secs(interval_key, default_interval)?,
        parse(attempts_key, default_attempts)?,
    ))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL: &[&str] = &[
        "FLEETPLANE_NODE_ID",
        "FLEETPLANE_HEARTBEAT_INTERVAL_SECS",
        "FLEETPLANE_NODE_STALE_SECS",
        "FLEETPLANE_RECONCILE_INTERVAL_SECS",
        "FLEETPLANE_SCALING_DECISION_ATTEMPTS",
        "FLEETPLANE_SCALING_LOCK_TIMEOUT_SECS",
        "FLEETPLANE_DISPATCH_INTERVAL_MS",
        "FLEETPLANE_DISPATCH_BATCH_SIZE",
        "FLEETPLANE_DISPATCH_ROUND_THRESHOLD",
        "FLEETPLANE_PICKER",
        "FLEETPLANE_ACTIVATION_TIMEOUT_SECS",
        "FLEETPLANE_PLACEMENT_TIMEOUT_SECS",
        "FLEETPLANE_RESOURCE_WAIT_ATTEMPTS",
        "FLEETPLANE_RESOURCE_WAIT_INTERVAL_SECS",
        "FLEETPLANE_SHUTDOWN_WAIT_ATTEMPTS",
        "FLEETPLANE_SHUTDOWN_WAIT_INTERVAL_SECS",
        "FLEETPLANE_IMAGE_WAIT_ATTEMPTS",
        "FLEETPLANE_IMAGE_WAIT_INTERVAL_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in OPTIONAL {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_optional();
        guard.set("FLEETPLANE_DATABASE_URL", "postgres://localhost/fleet");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/fleet");
        assert!(!config.is_sqlite());
        assert!(uuid::Uuid::parse_str(&config.node_id).is_ok());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.node_stale_after, Duration::from_secs(60));
        assert_eq!(config.scaling_decision_attempts, 3);
        assert_eq!(config.scaling_lock_timeout, Duration::from_secs(300));
        assert_eq!(config.dispatch_interval, Duration::from_millis(1000));
        assert_eq!(config.dispatch_round_threshold, 100);
        assert_eq!(config.picker, PickerKind::BusiestFirst);
        assert_eq!(config.shutdown_wait.max_attempts, 60);
        assert_eq!(config.shutdown_wait.interval, Duration::from_secs(10));
        assert_eq!(config.image_wait.max_attempts, 120);
        assert_eq!(config.image_wait.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_optional();
        guard.set("FLEETPLANE_DATABASE_URL", "sqlite:fleet.db");
        guard.set("FLEETPLANE_NODE_ID", "node-7");
        guard.set("FLEETPLANE_PICKER", "round-robin");
        guard.set("FLEETPLANE_SCALING_DECISION_ATTEMPTS", "5");
        guard.set("FLEETPLANE_SCALING_LOCK_TIMEOUT_SECS", "90");
        guard.set("FLEETPLANE_IMAGE_WAIT_ATTEMPTS", "10");

        let config = Config::from_env().unwrap();

        assert!(config.is_sqlite());
        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.picker, PickerKind::RoundRobin);
        assert_eq!(config.scaling_decision_attempts, 5);
        assert_eq!(config.scaling_lock_timeout, Duration::from_secs(90));
        assert_eq!(config.image_wait.max_attempts, 10);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("FLEETPLANE_DATABASE_URL");

        let err = Config::from_env().unwrap_err();

        assert!(matches!(err, ConfigError::Missing("FLEETPLANE_DATABASE_URL")));
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.clear_optional();
        guard.set("FLEETPLANE_DATABASE_URL", "sqlite::memory:");
        guard.set("FLEETPLANE_PICKER", "random");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("FLEETPLANE_PICKER", _)
        ));

        guard.set("FLEETPLANE_PICKER", "busiest-first");
        guard.set("FLEETPLANE_NODE_STALE_SECS", "5");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("FLEETPLANE_NODE_STALE_SECS", _)
        ));

        guard.set("FLEETPLANE_NODE_STALE_SECS", "60");
        guard.set("FLEETPLANE_SCALING_DECISION_ATTEMPTS", "zero");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("FLEETPLANE_SCALING_DECISION_ATTEMPTS", _)
        ));

        guard.set("FLEETPLANE_SCALING_DECISION_ATTEMPTS", "3");
        guard.set("FLEETPLANE_SCALING_LOCK_TIMEOUT_SECS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("FLEETPLANE_SCALING_LOCK_TIMEOUT_SECS", _)
        ));
    }
}
