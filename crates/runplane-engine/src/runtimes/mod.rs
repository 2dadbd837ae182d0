// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job-kind strategies.
//!
//! A [`Runtime`] is the caller-facing façade for one run kind. It turns runs
//! into runnables and requests transitions on them; it never talks to a
//! framework itself. [`BaseRuntime`] carries the shared plumbing: the set of
//! stores a runtime's runnables may live in, and the dispatcher that
//! persists and routes requests.

pub mod container;

pub use container::ContainerRuntime;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};
use crate::listener::Dispatcher;
use crate::run::{Executable, Run, RunSpec, StatusFragment, Task};
use crate::runnable::Runnable;
use crate::state::State;
use crate::store::RunnableStore;

/// Strategy for one run kind.
///
/// The status callbacks are invoked by the lifecycle manager. They may perform
/// kind-specific side effects and return a fragment merged into the run status.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run kind served by this runtime (e.g. "container").
    fn kind(&self) -> &str;

    /// Produce the run spec from an executable, a task and a run.
    async fn build(&self, executable: &Executable, task: &Task, run: &Run) -> Result<RunSpec>;

    /// Create a READY runnable for the run and hand it off for execution.
    async fn run(&self, run: &Run) -> Result<Runnable>;

    /// Request STOP on the run's runnable.
    async fn stop(&self, run: &Run) -> Result<Runnable>;

    /// Request RESUME on the run's stopped runnable.
    async fn resume(&self, run: &Run) -> Result<Runnable>;

    /// Request DELETING on the run's runnable.
    async fn delete(&self, run: &Run) -> Result<Runnable>;

    /// The run's runnable as currently stored, `None` when absent.
    async fn current(&self, run: &Run) -> Result<Option<Runnable>> {
        let _ = run;
        Ok(None)
    }

    /// The runnable started.
    async fn on_running(&self, run: &Run, runnable: &Runnable) -> Result<Option<StatusFragment>> {
        let _ = (run, runnable);
        Ok(None)
    }

    /// The runnable completed.
    async fn on_complete(&self, run: &Run, runnable: &Runnable) -> Result<Option<StatusFragment>> {
        let _ = (run, runnable);
        Ok(None)
    }

    /// The runnable failed.
    async fn on_error(&self, run: &Run, runnable: &Runnable) -> Result<Option<StatusFragment>> {
        let _ = (run, runnable);
        Ok(None)
    }

    /// The runnable stopped.
    async fn on_stopped(&self, run: &Run, runnable: &Runnable) -> Result<Option<StatusFragment>> {
        let _ = (run, runnable);
        Ok(None)
    }

    /// The runnable was deleted.
    async fn on_deleted(&self, run: &Run, runnable: &Runnable) -> Result<Option<StatusFragment>> {
        let _ = (run, runnable);
        Ok(None)
    }
}

/// Shared plumbing for runtimes.
#[derive(Clone)]
pub struct BaseRuntime {
    kind: String,
    stores: Vec<RunnableStore>,
    dispatcher: Arc<Dispatcher>,
}

impl BaseRuntime {
    /// Create the plumbing for `kind` over the stores its runnables may live in.
    pub fn new(kind: impl Into<String>, stores: Vec<RunnableStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            kind: kind.into(),
            stores,
            dispatcher,
        }
    }

    /// Resolve the stores for the given type tags from the dispatcher's routes.
    pub fn with_frameworks(
        kind: impl Into<String>,
        frameworks: &[&str],
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let stores = frameworks
            .iter()
            .map(|tag| {
                dispatcher
                    .store(tag)
                    .cloned()
                    .ok_or_else(|| Error::not_found("RunnableStore", *tag))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(kind, stores, dispatcher))
    }

    /// Run kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether runnables of type tag `framework` live in one of this runtime's stores.
    pub fn serves(&self, framework: &str) -> bool {
        self.stores.iter().any(|s| s.kind() == framework)
    }

    /// Fail with `UnsupportedKind` unless the run belongs to this runtime.
    pub fn check_kind(&self, run: &Run) -> Result<()> {
        if run.kind != self.kind {
            return Err(Error::UnsupportedKind {
                expected: self.kind.clone(),
                actual: run.kind.clone(),
            });
        }
        Ok(())
    }

    /// Persist and enqueue a pending runnable.
    pub async fn submit(&self, runnable: Runnable) -> Result<Runnable> {
        self.dispatcher.dispatch(runnable.clone()).await?;
        Ok(runnable)
    }

    /// Find the run's runnable: the first store entry whose id matches and
    /// whose task equals the run's resolved task.
    pub async fn find(&self, run: &Run) -> Result<Option<Runnable>> {
        let task = run.task_ref()?;
        for store in &self.stores {
            if let Some(runnable) = store.find(&run.id).await?
                && runnable.task == task.task
            {
                return Ok(Some(runnable));
            }
        }
        Ok(None)
    }

    /// Like [`find`](Self::find), failing with `NotFound` when absent.
    pub async fn locate(&self, run: &Run) -> Result<Runnable> {
        self.find(run)
            .await?
            .ok_or_else(|| Error::not_found("Runnable", &run.id))
    }

    /// Request STOP. Already stopping or stopped runnables are returned as is.
    pub async fn stop(&self, run: &Run) -> Result<Runnable> {
        self.check_kind(run)?;
        let mut runnable = self.locate(run).await?;
        match runnable.state {
            State::Stop | State::Stopped => Ok(runnable),
            State::Ready | State::Running => {
                runnable.state = State::Stop;
                self.request(runnable).await
            }
            other => Err(Error::InvalidArgument(format!(
                "run '{}' cannot be stopped in state {}",
                run.id, other
            ))),
        }
    }

    /// Request RESUME on a STOPPED runnable.
    pub async fn resume(&self, run: &Run) -> Result<Runnable> {
        self.check_kind(run)?;
        let mut runnable = self.locate(run).await?;
        match runnable.state {
            State::Resume => Ok(runnable),
            State::Stopped => {
                runnable.state = State::Resume;
                runnable.error = None;
                self.request(runnable).await
            }
            other => Err(Error::InvalidArgument(format!(
                "run '{}' cannot be resumed in state {}",
                run.id, other
            ))),
        }
    }

    /// Request DELETING. A pending deletion is returned as is.
    pub async fn delete(&self, run: &Run) -> Result<Runnable> {
        self.check_kind(run)?;
        let mut runnable = self.locate(run).await?;
        if runnable.state == State::Deleting {
            return Ok(runnable);
        }
        runnable.state = State::Deleting;
        self.request(runnable).await
    }

    async fn request(&self, runnable: Runnable) -> Result<Runnable> {
        info!(
            runnable_id = %runnable.id,
            runtime = %self.kind,
            state = %runnable.state,
            "Requesting transition"
        );
        self.submit(runnable).await
    }
}
