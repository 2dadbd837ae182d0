// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests: runs submitted through the engine, reconciled by the
//! watcher or the monitor poller, mirrored back onto run status.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::{Map, json};

use runplane_engine::actuator::{RunTemplate, SCHEDULE, Trigger};
use runplane_engine::framework::MockFramework;
use runplane_engine::monitor::MISSING_RESOURCE_MESSAGE;
use runplane_engine::run::Run;
use runplane_engine::runnable::Runnable;
use runplane_engine::state::State;
use runplane_engine::store::RunnableStore;

fn job(id: &str) -> Run {
    Run::new(id, "demo", "container")
        .with_task("container+job://demo/train")
        .with_parameter("image", json!("registry/train:1"))
        .with_parameter("command", json!("train"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_completes_run() {
    let ctx = MockEngine::start().await;

    ctx.engine.manager().run(job("run-1")).await.unwrap();
    ctx.wait_for("run-1", State::Running).await;

    let mut results = Map::new();
    results.insert("accuracy".to_string(), json!(0.97));
    ctx.framework.set_results("run-1", results).await;
    ctx.framework.complete("run-1").await;

    let run = ctx.wait_for("run-1", State::Completed).await;
    assert_eq!(run.status.extra["results"]["accuracy"], json!(0.97));
    assert!(run.status.error.is_none());

    let stored = ctx.engine.store("mock").unwrap().find("run-1").await.unwrap().unwrap();
    assert_eq!(stored.state, State::Completed);
    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backend_failure_reaches_run() {
    let ctx = MockEngine::start().await;

    ctx.engine.manager().run(job("run-1")).await.unwrap();
    ctx.wait_for("run-1", State::Running).await;
    ctx.framework.fail("run-1", 2, "OOMKilled").await;

    let run = ctx.wait_for("run-1", State::Error).await;
    assert_eq!(
        run.status.error.as_deref(),
        Some("Job failed: 2 unit(s) failed: OOMKilled")
    );
    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_monitor_poller_without_events() {
    let ctx = MockEngine::start_with(
        Arc::new(MockFramework::without_events()),
        sqlite_repository().await,
        Duration::from_millis(50),
    )
    .await;

    ctx.engine.manager().run(job("run-1")).await.unwrap();
    ctx.wait_for("run-1", State::Running).await;

    ctx.framework.remove_resource("run-1").await;

    let run = ctx.wait_for("run-1", State::Error).await;
    assert_eq!(run.status.error.as_deref(), Some(MISSING_RESOURCE_MESSAGE));
    let stored = ctx.engine.store("mock").unwrap().find("run-1").await.unwrap().unwrap();
    assert!(stored.logs.is_empty());
    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_and_delete_through_engine() {
    let ctx = MockEngine::start().await;
    let manager = ctx.engine.manager().clone();

    manager.run(job("run-1")).await.unwrap();
    ctx.wait_for("run-1", State::Running).await;

    manager.stop("run-1").await.unwrap();
    ctx.wait_for("run-1", State::Stopped).await;
    manager.stop("run-1").await.unwrap();

    manager.delete("run-1").await.unwrap();
    ctx.wait_for("run-1", State::Deleted).await;
    assert!(ctx.engine.store("mock").unwrap().find("run-1").await.unwrap().is_none());
    assert!(!ctx.framework.has_resource("run-1").await);
    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pending_requests_recovered_on_start() {
    let framework = Arc::new(MockFramework::new());
    let repository = sqlite_repository().await;

    let store = RunnableStore::new("mock", repository.clone());
    let mut pending = Runnable::new("run-9", "demo", "container", "job", "mock");
    pending.command = Some("train".to_string());
    store.store("run-9", &pending).await.unwrap();

    let ctx = MockEngine::start_with(framework.clone(), repository, Duration::from_secs(60)).await;

    let mut running = false;
    for _ in 0..500 {
        if let Some(r) = store.find("run-9").await.unwrap()
            && r.state == State::Running
        {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(running);
    assert!(framework.has_resource("run-9").await);
    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_schedule_trigger_submits_runs() {
    let ctx = MockEngine::start().await;
    let actuator = ctx.engine.actuators().get(SCHEDULE).unwrap();

    let trigger = Trigger {
        id: "hourly".to_string(),
        project: "demo".to_string(),
        kind: SCHEDULE.to_string(),
        template: RunTemplate {
            kind: "container".to_string(),
            task: "container+job://demo/train".to_string(),
            parameters: Map::from_iter([("command".to_string(), json!("train"))]),
        },
        interval: Duration::from_millis(50),
        max_runs: Some(2),
    };
    actuator.start(&trigger).await.unwrap();

    let mut runs = Vec::new();
    for _ in 0..500 {
        runs = ctx.engine.manager().list_runs().await.unwrap();
        if runs.len() == 2 && runs.iter().all(|r| r.status.state == State::Running) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status.state == State::Running));

    actuator.stop(&trigger).await.unwrap();
    ctx.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_backend_job_with_results() {
    let temp = tempfile::TempDir::new().unwrap();
    let engine = process_engine(temp.path()).await;

    let run = shell_job(
        "run-1",
        r#"echo started; printf '{"answer": 42}' > "$RUNPLANE_RESULTS_PATH""#,
    );
    engine.manager().run(run).await.unwrap();

    let run = wait_for_run(&engine, "run-1", State::Completed).await;
    assert_eq!(run.status.extra["results"]["answer"], json!(42));

    let stored = engine.store("process").unwrap().find("run-1").await.unwrap().unwrap();
    assert!(stored.logs.iter().any(|l| l.content.contains("started")));
    engine.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_process_backend_failing_job() {
    let temp = tempfile::TempDir::new().unwrap();
    let engine = process_engine(temp.path()).await;

    engine
        .manager()
        .run(shell_job("run-1", "exit 3"))
        .await
        .unwrap();

    let run = wait_for_run(&engine, "run-1", State::Error).await;
    assert!(
        run.status
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Job failed: 1 unit(s) failed"))
    );
    engine.shutdown().await.unwrap();
}
