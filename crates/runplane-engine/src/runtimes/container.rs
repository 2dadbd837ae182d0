// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime: runs an image or command as a batch job or a service.
//!
//! Parameters (merged executable → task → run, later wins):
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `image` | workload image |
//! | `command` / `args` | entry point |
//! | `parallelism` | number of execution units (default 1) |
//! | `requirements` | resources, volumes, env, secrets, node selector |
//! | `labels` | extra labels on backend resources |
//! | `framework` | runnable type tag (defaults to the runtime's default) |

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::info;

use super::{BaseRuntime, Runtime};
use crate::error::{Error, Result};
use crate::run::{Executable, Run, RunSpec, StatusFragment, Task, TaskRef};
use crate::runnable::{Requirements, Runnable};

/// Run kind of the container runtime.
pub const KIND: &str = "container";

/// One-shot batch task.
pub const TASK_JOB: &str = "job";

/// Long-running service task.
pub const TASK_SERVE: &str = "serve";

/// Label carrying the served function on `serve` resources.
pub const LABEL_SERVICE: &str = "runplane.io/service";

#[derive(Debug, Default, Deserialize)]
struct ContainerParameters {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    parallelism: Option<u32>,
    #[serde(default)]
    requirements: Requirements,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    framework: Option<String>,
}

/// Reference runtime for containerised workloads.
pub struct ContainerRuntime {
    base: BaseRuntime,
    default_framework: String,
}

impl ContainerRuntime {
    /// Create the runtime. `base` must be built for [`KIND`].
    pub fn new(base: BaseRuntime, default_framework: impl Into<String>) -> Self {
        Self {
            base,
            default_framework: default_framework.into(),
        }
    }

    fn check_task(&self, runtime: &str, task: &str) -> Result<()> {
        if runtime != KIND {
            return Err(Error::UnsupportedKind {
                expected: KIND.to_string(),
                actual: runtime.to_string(),
            });
        }
        if task != TASK_JOB && task != TASK_SERVE {
            return Err(Error::UnsupportedKind {
                expected: format!("{KIND}+{TASK_JOB} or {KIND}+{TASK_SERVE}"),
                actual: format!("{runtime}+{task}"),
            });
        }
        Ok(())
    }

    fn runnable_for(&self, run: &Run) -> Result<Runnable> {
        let task = run.task_ref()?;
        self.check_task(&task.runtime, &task.task)?;

        let params: ContainerParameters =
            serde_json::from_value(Value::Object(run.spec.parameters.clone())).map_err(|e| {
                Error::InvalidArgument(format!("run '{}' has invalid parameters: {}", run.id, e))
            })?;
        if params.image.is_none() && params.command.is_none() {
            return Err(Error::InvalidArgument(format!(
                "run '{}' needs an image or a command",
                run.id
            )));
        }

        let framework = params
            .framework
            .unwrap_or_else(|| self.default_framework.clone());
        if !self.base.serves(&framework) {
            return Err(Error::InvalidArgument(format!(
                "run '{}' targets framework '{}' not served by runtime '{}'",
                run.id, framework, KIND
            )));
        }
        let mut runnable = Runnable::new(&run.id, &run.project, KIND, &task.task, framework);
        runnable.user = run.user.clone();
        runnable.image = params.image;
        runnable.command = params.command;
        runnable.args = params.args;
        runnable.parallelism = params.parallelism.unwrap_or(1).max(1);
        runnable.requirements = params.requirements;
        runnable.labels = params.labels;
        if task.task == TASK_SERVE {
            runnable
                .labels
                .insert(LABEL_SERVICE.to_string(), function_label(&task));
        }
        Ok(runnable)
    }
}

fn function_label(task: &TaskRef) -> String {
    match &task.version {
        Some(version) => format!("{}-{}", task.function, version),
        None => task.function.clone(),
    }
}

fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

#[async_trait]
impl Runtime for ContainerRuntime {
    fn kind(&self) -> &str {
        KIND
    }

    async fn build(&self, executable: &Executable, task: &Task, run: &Run) -> Result<RunSpec> {
        self.base.check_kind(run)?;
        if executable.kind != KIND {
            return Err(Error::UnsupportedKind {
                expected: KIND.to_string(),
                actual: executable.kind.clone(),
            });
        }
        let (runtime, task_kind) = task.kind.split_once('+').ok_or_else(|| {
            Error::InvalidArgument(format!("task '{}' has malformed kind '{}'", task.id, task.kind))
        })?;
        self.check_task(runtime, task_kind)?;

        let mut parameters = Map::new();
        merge_into(&mut parameters, &executable.spec);
        merge_into(&mut parameters, &task.spec);
        merge_into(&mut parameters, &run.spec.parameters);

        Ok(RunSpec {
            task: Some(format!(
                "{}://{}/{}",
                task.kind, executable.project, executable.id
            )),
            parameters,
        })
    }

    async fn run(&self, run: &Run) -> Result<Runnable> {
        self.base.check_kind(run)?;
        let runnable = self.runnable_for(run)?;
        info!(
            run_id = %run.id,
            task = %runnable.task,
            framework = %runnable.framework,
            parallelism = runnable.parallelism,
            "Submitting container run"
        );
        self.base.submit(runnable).await
    }

    async fn stop(&self, run: &Run) -> Result<Runnable> {
        self.base.stop(run).await
    }

    async fn resume(&self, run: &Run) -> Result<Runnable> {
        self.base.resume(run).await
    }

    async fn delete(&self, run: &Run) -> Result<Runnable> {
        self.base.delete(run).await
    }

    async fn current(&self, run: &Run) -> Result<Option<Runnable>> {
        self.base.find(run).await
    }

    async fn on_running(&self, _run: &Run, runnable: &Runnable) -> Result<Option<StatusFragment>> {
        let started = runnable
            .pods
            .iter()
            .filter_map(|p| p.started_at)
            .min()
            .unwrap_or_else(Utc::now);
        let mut fragment = StatusFragment::new();
        fragment.insert("started_at".to_string(), json!(started.to_rfc3339()));
        Ok(Some(fragment))
    }

    async fn on_complete(&self, _run: &Run, runnable: &Runnable) -> Result<Option<StatusFragment>> {
        let mut fragment = StatusFragment::new();
        fragment.insert(
            "results".to_string(),
            Value::Object(runnable.results.clone()),
        );
        fragment.insert("completed_at".to_string(), json!(Utc::now().to_rfc3339()));
        Ok(Some(fragment))
    }

    async fn on_deleted(&self, _run: &Run, _runnable: &Runnable) -> Result<Option<StatusFragment>> {
        let mut fragment = StatusFragment::new();
        fragment.insert("started_at".to_string(), Value::Null);
        Ok(Some(fragment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::listener::Dispatcher;
    use crate::state::State;
    use crate::store::RunnableStore;
    use crate::store::testing::memory_store;

    async fn runtime() -> (ContainerRuntime, RunnableStore, mpsc::Receiver<Runnable>) {
        let store = memory_store("mock").await;
        let mut dispatcher = Dispatcher::new();
        let rx = dispatcher.route(store.clone(), 16).unwrap();
        let base = BaseRuntime::with_frameworks(KIND, &["mock"], Arc::new(dispatcher)).unwrap();
        (ContainerRuntime::new(base, "mock"), store, rx)
    }

    fn job() -> Run {
        Run::new("run-1", "demo", KIND)
            .with_task("container+job://demo/train")
            .with_parameter("command", json!("sh"))
            .with_parameter("args", json!(["-c", "echo hi"]))
            .with_parameter("parallelism", json!(2))
    }

    #[tokio::test]
    async fn test_run_creates_ready_runnable() {
        let (runtime, store, mut rx) = runtime().await;

        let runnable = runtime.run(&job()).await.unwrap();

        assert_eq!(runnable.state, State::Ready);
        assert_eq!(runnable.task, TASK_JOB);
        assert_eq!(runnable.framework, "mock");
        assert_eq!(runnable.parallelism, 2);
        assert_eq!(runnable.args, vec!["-c", "echo hi"]);
        assert_eq!(
            store.find("run-1").await.unwrap().unwrap().state,
            State::Ready
        );
        assert_eq!(rx.recv().await.unwrap().id, "run-1");
    }

    #[tokio::test]
    async fn test_run_rejects_wrong_kind() {
        let (runtime, _store, _rx) = runtime().await;
        let run = Run::new("run-1", "demo", "batch").with_task("container+job://demo/train");
        assert!(matches!(
            runtime.run(&run).await,
            Err(Error::UnsupportedKind { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_rejects_unknown_task() {
        let (runtime, _store, _rx) = runtime().await;
        let run = Run::new("run-1", "demo", KIND)
            .with_task("container+build://demo/train")
            .with_parameter("image", json!("app:1"));
        assert!(matches!(
            runtime.run(&run).await,
            Err(Error::UnsupportedKind { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_requires_image_or_command() {
        let (runtime, store, _rx) = runtime().await;
        let run = Run::new("run-1", "demo", KIND).with_task("container+job://demo/train");

        assert!(matches!(
            runtime.run(&run).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(store.find("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_serve_carries_service_label() {
        let (runtime, _store, _rx) = runtime().await;
        let run = Run::new("run-2", "demo", KIND)
            .with_task("container+serve://demo/api:v3")
            .with_parameter("image", json!("registry/api:3"));

        let runnable = runtime.run(&run).await.unwrap();

        assert_eq!(runnable.task, TASK_SERVE);
        assert_eq!(
            runnable.labels.get(LABEL_SERVICE).map(String::as_str),
            Some("api-v3")
        );
    }

    #[tokio::test]
    async fn test_unknown_framework_is_rejected() {
        let (runtime, _store, _rx) = runtime().await;
        let run = job().with_parameter("framework", json!("kubernetes"));
        assert!(matches!(
            runtime.run(&run).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_framework_outside_runtime_stores_is_rejected() {
        let mock = memory_store("mock").await;
        let process = memory_store("process").await;
        let mut dispatcher = Dispatcher::new();
        let _mock_rx = dispatcher.route(mock.clone(), 16).unwrap();
        let _process_rx = dispatcher.route(process.clone(), 16).unwrap();
        let base = BaseRuntime::with_frameworks(KIND, &["mock"], Arc::new(dispatcher)).unwrap();
        let runtime = ContainerRuntime::new(base, "mock");

        let run = job().with_parameter("framework", json!("process"));

        assert!(matches!(
            runtime.run(&run).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(process.find("run-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_current_reads_stored_runnable() {
        let (runtime, _store, _rx) = runtime().await;
        assert!(runtime.current(&job()).await.unwrap().is_none());

        runtime.run(&job()).await.unwrap();

        let current = runtime.current(&job()).await.unwrap().unwrap();
        assert_eq!(current.state, State::Ready);
    }

    #[tokio::test]
    async fn test_build_merges_parameters() {
        let (runtime, _store, _rx) = runtime().await;
        let mut executable = Executable {
            id: "train".into(),
            kind: KIND.into(),
            project: "demo".into(),
            spec: Map::new(),
        };
        executable.spec.insert("image".into(), json!("app:1"));
        executable.spec.insert("parallelism".into(), json!(1));
        let mut task = Task {
            id: "t-1".into(),
            kind: "container+job".into(),
            project: "demo".into(),
            spec: Map::new(),
        };
        task.spec.insert("parallelism".into(), json!(4));
        let run = Run::new("run-1", "demo", KIND).with_parameter("image", json!("app:2"));

        let spec = runtime.build(&executable, &task, &run).await.unwrap();

        assert_eq!(spec.task.as_deref(), Some("container+job://demo/train"));
        assert_eq!(spec.parameters.get("image"), Some(&json!("app:2")));
        assert_eq!(spec.parameters.get("parallelism"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_build_rejects_foreign_executable() {
        let (runtime, _store, _rx) = runtime().await;
        let executable = Executable {
            id: "train".into(),
            kind: "python".into(),
            project: "demo".into(),
            spec: Map::new(),
        };
        let task = Task {
            id: "t-1".into(),
            kind: "container+job".into(),
            project: "demo".into(),
            spec: Map::new(),
        };
        let run = Run::new("run-1", "demo", KIND);
        assert!(matches!(
            runtime.build(&executable, &task, &run).await,
            Err(Error::UnsupportedKind { .. })
        ));
    }

    #[tokio::test]
    async fn test_on_complete_promotes_results() {
        let (runtime, _store, _rx) = runtime().await;
        let mut runnable = Runnable::new("run-1", "demo", KIND, TASK_JOB, "mock");
        runnable.results.insert("accuracy".into(), json!(0.93));

        let fragment = runtime
            .on_complete(&job(), &runnable)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fragment["results"]["accuracy"], json!(0.93));
        assert!(fragment.contains_key("completed_at"));
    }
}
