// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runplane-engine integration tests.
//!
//! Provides in-memory SQLite repositories, an optional PostgreSQL pool and
//! helpers to start an engine over the mock or the process backend.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::sqlite::SqlitePoolOptions;

use runplane_engine::framework::{MockFramework, ProcessFramework, ProcessFrameworkConfig};
use runplane_engine::migrations;
use runplane_engine::run::Run;
use runplane_engine::runtime::EngineRuntime;
use runplane_engine::runtimes::ContainerRuntime;
use runplane_engine::state::State;
use runplane_engine::store::{RecordRepository, SqliteRecordRepository};

/// Skip the test when no PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_RUNPLANE_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_RUNPLANE_DATABASE_URL not set");
            return;
        }
    };
}

/// Repository over a fresh in-memory SQLite database.
pub async fn sqlite_repository() -> Arc<dyn RecordRepository> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqliteRecordRepository::new(pool))
}

/// Migrated PostgreSQL pool, if `TEST_RUNPLANE_DATABASE_URL` is set.
pub async fn postgres_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_RUNPLANE_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    migrations::run_postgres(&pool).await.ok()?;
    Some(pool)
}

/// Engine over a mock backend with the container runtime.
pub struct MockEngine {
    pub engine: EngineRuntime,
    pub framework: Arc<MockFramework>,
    pub repository: Arc<dyn RecordRepository>,
}

impl MockEngine {
    /// Start an engine whose mock backend pushes events.
    pub async fn start() -> Self {
        Self::start_with(
            Arc::new(MockFramework::new()),
            sqlite_repository().await,
            Duration::from_secs(60),
        )
        .await
    }

    /// Start an engine with a given backend, repository and monitor delay.
    pub async fn start_with(
        framework: Arc<MockFramework>,
        repository: Arc<dyn RecordRepository>,
        monitor_delay: Duration,
    ) -> Self {
        let engine = EngineRuntime::builder()
            .repository(repository.clone())
            .framework(framework.clone())
            .monitor_delay(monitor_delay)
            .runtime(|wiring| {
                let base = wiring.base_runtime("container", &["mock"])?;
                Ok(Arc::new(ContainerRuntime::new(base, "mock")))
            })
            .build()
            .expect("Failed to build engine")
            .start()
            .await
            .expect("Failed to start engine");

        Self {
            engine,
            framework,
            repository,
        }
    }

    /// Wait until the run reaches `state`.
    pub async fn wait_for(&self, id: &str, state: State) -> Run {
        wait_for_run(&self.engine, id, state).await
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await.expect("Failed to shut down engine");
    }
}

/// Start an engine over the process backend rooted at `data_dir`.
///
/// Short-lived processes may exit before their RUNNING state is stored, so
/// the monitor polls quickly as well.
pub async fn process_engine(data_dir: &Path) -> EngineRuntime {
    let framework = Arc::new(ProcessFramework::new(ProcessFrameworkConfig::new(data_dir)));
    EngineRuntime::builder()
        .repository(sqlite_repository().await)
        .framework(framework)
        .monitor_delay(Duration::from_millis(200))
        .runtime(|wiring| {
            let base = wiring.base_runtime("container", &["process"])?;
            Ok(Arc::new(ContainerRuntime::new(base, "process")))
        })
        .build()
        .expect("Failed to build engine")
        .start()
        .await
        .expect("Failed to start engine")
}

/// Poll the run until it reaches `state`, panicking after five seconds.
pub async fn wait_for_run(engine: &EngineRuntime, id: &str, state: State) -> Run {
    let mut last = None;
    for _ in 0..500 {
        if let Ok(run) = engine.manager().find_run(id).await {
            if run.status.state == state {
                return run;
            }
            last = Some(run.status.state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {id} never reached {state} (last seen: {last:?})");
}

/// A container job running `script` through `sh -c`.
pub fn shell_job(id: &str, script: &str) -> Run {
    Run::new(id, "demo", "container")
        .with_task("container+job://demo/script")
        .with_parameter("command", serde_json::json!("sh"))
        .with_parameter("args", serde_json::json!(["-c", script]))
}
