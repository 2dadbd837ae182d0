// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runplane Engine - Runnable Lifecycle & Reconciliation Server
//!
//! Runs the engine with:
//! - the local process backend (type tag `process`)
//! - the container runtime (run kind `container`)
//! - the schedule actuator
//! - a SQLite or PostgreSQL runnable store

use std::sync::Arc;
use tracing::{info, warn};

use runplane_engine::config::Config;
use runplane_engine::framework::{Framework, ProcessFramework, ProcessFrameworkConfig};
use runplane_engine::migrations;
use runplane_engine::runtime::EngineRuntime;
use runplane_engine::runtimes::ContainerRuntime;
use runplane_engine::store::{PostgresRecordRepository, RecordRepository, SqliteRecordRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runplane_engine=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        namespace = %config.namespace,
        monitor_delay_secs = config.monitor_delay.as_secs(),
        "Starting Runplane Engine"
    );

    let repository: Arc<dyn RecordRepository> = if config.database_url.starts_with("sqlite:") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Arc::new(SqliteRecordRepository::new(pool))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Arc::new(PostgresRecordRepository::new(pool))
    };

    info!("Database schema verified");

    let framework = Arc::new(ProcessFramework::new(
        ProcessFrameworkConfig::new(&config.data_dir).with_namespace(&config.namespace),
    ));
    let framework_kind = framework.kind().to_string();
    info!(framework = %framework_kind, "Framework initialized");

    let engine = EngineRuntime::builder()
        .config(&config)
        .repository(repository)
        .framework(framework)
        .runtime(move |wiring| {
            let base = wiring.base_runtime("container", &[framework_kind.as_str()])?;
            Ok(Arc::new(ContainerRuntime::new(base, framework_kind)))
        })
        .build()?
        .start()
        .await?;

    info!("Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    engine.shutdown().await?;

    info!("Runplane Engine shut down");

    Ok(())
}
