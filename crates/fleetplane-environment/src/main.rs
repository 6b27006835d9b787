// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleetplane work node.
//!
//! Runs one member of the control plane:
//! - heartbeat, dead-node detection and workflow takeover
//! - provisioning workflows (create fleet, delete fleet, build image)
//! - scaling group reconciliation
//! - session dispatch
//!
//! Cloud and process clients are the in-memory implementations; vendor
//! clients plug in through the same traits.

use std::sync::Arc;

use fleetplane_core::persistence::Persistence;
use fleetplane_core::{PostgresPersistence, SqlitePersistence, migrations};
use fleetplane_environment::cloud::{MockCloud, MockConnector};
use fleetplane_environment::config::Config;
use fleetplane_environment::credentials::{CloudAccess, CredentialCache, StaticCredentialProvider};
use fleetplane_environment::dispatcher::MockProcessClient;
use fleetplane_environment::runtime::FleetRuntime;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetplane_environment=info,fleetplane_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        node_id = %config.node_id,
        picker = %config.picker,
        sqlite = config.is_sqlite(),
        "Starting fleetplane work node"
    );

    let persistence: Arc<dyn Persistence> = if config.is_sqlite() {
        let path = config
            .database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        Arc::new(SqlitePersistence::from_path(path).await?)
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Arc::new(PostgresPersistence::new(pool))
    };

    info!("Database ready");

    let cloud = Arc::new(MockCloud::new());
    let access = Arc::new(CloudAccess::new(
        CredentialCache::new(Arc::new(StaticCredentialProvider::default())),
        Arc::new(MockConnector::new(cloud)),
    ));

    let runtime = FleetRuntime::builder()
        .config(&config)
        .persistence(persistence)
        .cloud_access(access)
        .process_client(Arc::new(MockProcessClient::new()))
        .build()?
        .start()
        .await?;

    info!(node_id = %runtime.node_id(), "Work node ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Fleetplane work node shut down");

    Ok(())
}
