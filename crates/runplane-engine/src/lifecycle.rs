// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle management.
//!
//! [`RunLifecycleManager`] is the caller-facing entry point (`run`, `stop`,
//! `resume`, `delete`) and the only component that writes [`RunStatus`].
//! Requests are recorded on the run and forwarded to the runtime for its
//! kind; the outcome arrives later as a [`RunnableChanged`] event, consumed
//! by the [`LifecycleWorker`], which mirrors the runnable's state onto the
//! run and invokes the runtime's status callbacks.
//!
//! [`RunStatus`]: crate::run::RunStatus

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, RunnableChanged};
use crate::registry::RuntimeFactory;
use crate::run::{Executable, Run, RunSpec, StatusFragment, Task};
use crate::runnable::Runnable;
use crate::runtimes::Runtime;
use crate::state::State;

/// Persistence for runs.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Load a run.
    async fn find(&self, id: &str) -> Result<Option<Run>>;

    /// Insert or replace a run.
    async fn save(&self, run: &Run) -> Result<()>;

    /// All runs.
    async fn list(&self) -> Result<Vec<Run>>;
}

/// Process-local run repository.
#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<String, Run>>,
}

impl InMemoryRunRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn find(&self, id: &str) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(id).cloned())
    }

    async fn save(&self, run: &Run) -> Result<()> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runs)
    }
}

/// Drives runs through their lifecycle.
pub struct RunLifecycleManager {
    runtimes: Arc<RuntimeFactory>,
    runs: Arc<dyn RunRepository>,
    events: EventBus,
    // Serializes read-modify-write of run status.
    writes: Mutex<()>,
}

impl RunLifecycleManager {
    /// Create a manager over the given runtimes and run repository.
    pub fn new(runtimes: Arc<RuntimeFactory>, runs: Arc<dyn RunRepository>, events: EventBus) -> Self {
        Self {
            runtimes,
            runs,
            events,
            writes: Mutex::new(()),
        }
    }

    /// Registered runtimes.
    pub fn runtimes(&self) -> &RuntimeFactory {
        &self.runtimes
    }

    /// Load a run, failing with `NotFound`.
    pub async fn find_run(&self, id: &str) -> Result<Run> {
        self.runs
            .find(id)
            .await?
            .ok_or_else(|| Error::not_found("Run", id))
    }

    /// All runs.
    pub async fn list_runs(&self) -> Result<Vec<Run>> {
        self.runs.list().await
    }

    /// Build a run spec with the runtime for the run's kind.
    pub async fn build(&self, executable: &Executable, task: &Task, run: &Run) -> Result<RunSpec> {
        self.runtimes.get(&run.kind)?.build(executable, task, run).await
    }

    /// Submit a run. It is recorded READY before the runtime sees it and
    /// moves to ERROR when the runtime rejects it.
    pub async fn run(&self, mut run: Run) -> Result<Run> {
        let runtime = self.runtimes.get(&run.kind)?;

        {
            let _guard = self.writes.lock().await;
            if let Some(existing) = self.runs.find(&run.id).await?
                && existing.status.state != State::Deleted
            {
                return Err(Error::InvalidArgument(format!(
                    "run '{}' already exists in state {}",
                    run.id, existing.status.state
                )));
            }
            run.status.state = State::Ready;
            run.status.message = None;
            run.status.error = None;
            run.status.updated = Utc::now();
            self.runs.save(&run).await?;
        }

        info!(run_id = %run.id, kind = %run.kind, project = %run.project, "Run submitted");

        if let Err(e) = runtime.run(&run).await {
            warn!(run_id = %run.id, error = %e, "Runtime rejected run");
            let _guard = self.writes.lock().await;
            let mut failed = self.runs.find(&run.id).await?.unwrap_or(run);
            failed.status.state = State::Error;
            failed.status.error = Some(e.to_string());
            failed.status.message = Some(e.to_string());
            failed.status.updated = Utc::now();
            self.runs.save(&failed).await?;
            return Err(e);
        }

        Ok(run)
    }

    /// Request a stop. Stopping a STOPPED run is a no-op.
    pub async fn stop(&self, id: &str) -> Result<Run> {
        self.request(id, State::Stop, &[State::Stop, State::Stopped])
            .await
    }

    /// Request a resume of a STOPPED run.
    pub async fn resume(&self, id: &str) -> Result<Run> {
        self.request(id, State::Resume, &[State::Resume]).await
    }

    /// Request deletion. Deleting a DELETED run is a no-op.
    pub async fn delete(&self, id: &str) -> Result<Run> {
        self.request(id, State::Deleting, &[State::Deleting, State::Deleted])
            .await
    }

    async fn request(&self, id: &str, requested: State, settled: &[State]) -> Result<Run> {
        let (run, previous) = {
            let _guard = self.writes.lock().await;
            let mut run = self.find_run(id).await?;
            if settled.contains(&run.status.state) {
                debug!(run_id = %id, state = %run.status.state, "Request already satisfied");
                return Ok(run);
            }
            let previous = run.status.clone();
            run.status.state = requested;
            run.status.updated = Utc::now();
            self.runs.save(&run).await?;
            (run, previous)
        };

        let runtime = self.runtimes.get(&run.kind)?;
        let outcome = match requested {
            State::Stop => runtime.stop(&run).await,
            State::Resume => runtime.resume(&run).await,
            _ => runtime.delete(&run).await,
        };

        if let Err(e) = outcome {
            warn!(run_id = %id, requested = %requested, error = %e, "Request rejected");
            {
                let _guard = self.writes.lock().await;
                if let Some(mut current) = self.runs.find(id).await?
                    && current.status.state == requested
                {
                    current.status = previous;
                    self.runs.save(&current).await?;
                }
            }
            // Changes published while the request was pending were not applicable.
            if let Err(sync_err) = self.sync(id, None).await {
                warn!(run_id = %id, error = %sync_err, "Failed to resync run");
            }
            return Err(e);
        }

        info!(run_id = %id, requested = %requested, "Run request accepted");
        Ok(run)
    }

    /// Mirror a runnable change onto its run.
    ///
    /// The event only names the runnable; the state applied is the one
    /// currently stored, so late or reordered events cannot move a run
    /// backwards. Returns the updated run, or `None` when nothing applies:
    /// pending requests, unknown runs, unregistered kinds, states already
    /// mirrored and stale states.
    pub async fn handle_event(&self, event: &RunnableChanged) -> Result<Option<Run>> {
        let runnable = &event.runnable;
        if !self.runtimes.contains(&runnable.runtime) {
            return Ok(None);
        }
        self.sync(&runnable.id, Some(runnable)).await
    }

    /// Re-read the runnables of every run that is not at rest and mirror them.
    ///
    /// Returns how many runs changed.
    pub async fn resync(&self) -> Result<usize> {
        let mut changed = 0;
        for run in self.runs.list().await? {
            if run.status.state.is_rest() {
                continue;
            }
            match self.sync(&run.id, None).await {
                Ok(Some(_)) => changed += 1,
                Ok(None) => {}
                Err(e) => warn!(run_id = %run.id, error = %e, "Failed to resync run"),
            }
        }
        if changed > 0 {
            info!(changed, "Resynced runs");
        }
        Ok(changed)
    }

    /// Mirror the stored runnable of run `id` onto the run.
    ///
    /// `seen` is the runnable as last published, used when the stored one is
    /// already gone.
    async fn sync(&self, id: &str, seen: Option<&Runnable>) -> Result<Option<Run>> {
        let Some(run) = self.runs.find(id).await? else {
            debug!(runnable_id = %id, "No run for runnable");
            return Ok(None);
        };
        let Ok(runtime) = self.runtimes.get(&run.kind) else {
            return Ok(None);
        };
        if seen.is_some_and(|r| r.runtime != run.kind) {
            return Ok(None);
        }

        let observed = match runtime.current(&run).await? {
            Some(current) => current,
            None => {
                let mut gone = match seen {
                    Some(seen) => seen.clone(),
                    None => Runnable::new(&run.id, &run.project, &run.kind, "", ""),
                };
                gone.state = State::Deleted;
                gone
            }
        };
        if !mirrors(&run, &observed) {
            return Ok(None);
        }

        let fragment = match self.callback(runtime.as_ref(), &run, &observed).await {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!(run_id = %run.id, state = %observed.state, error = %e, "Runtime callback failed");
                None
            }
        };

        let _guard = self.writes.lock().await;
        let Some(mut run) = self.runs.find(id).await? else {
            return Ok(None);
        };
        if !mirrors(&run, &observed) {
            debug!(run_id = %run.id, state = %run.status.state, "Run moved on during callback");
            return Ok(None);
        }

        run.status.state = observed.state;
        run.status.message = observed.message.clone();
        run.status.error = if observed.state == State::Error {
            observed.error.clone()
        } else {
            None
        };
        run.status.updated = Utc::now();
        if let Some(fragment) = fragment {
            run.status.merge(fragment);
        }
        self.runs.save(&run).await?;

        info!(run_id = %run.id, state = %run.status.state, "Run status updated");
        Ok(Some(run))
    }

    async fn callback(
        &self,
        runtime: &dyn Runtime,
        run: &Run,
        runnable: &Runnable,
    ) -> Result<Option<StatusFragment>> {
        match runnable.state {
            State::Running => runtime.on_running(run, runnable).await,
            State::Completed => runtime.on_complete(run, runnable).await,
            State::Error => runtime.on_error(run, runnable).await,
            State::Stopped => runtime.on_stopped(run, runnable).await,
            State::Deleted => runtime.on_deleted(run, runnable).await,
            _ => Ok(None),
        }
    }

    /// Create the event worker. Subscribes immediately.
    pub fn worker(self: &Arc<Self>) -> LifecycleWorker {
        LifecycleWorker {
            manager: self.clone(),
            events: self.events.subscribe(),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

/// Whether the observed runnable state should be written onto the run.
fn mirrors(run: &Run, observed: &Runnable) -> bool {
    let from = run.status.state;
    let to = observed.state;
    if to.is_request() || from == to {
        return false;
    }
    if to == State::Deleted {
        return from == State::Deleting;
    }
    if !from.can_advance_to(to) {
        debug!(run_id = %run.id, from = %from, to = %to, "Ignoring stale runnable change");
        return false;
    }
    true
}

/// Background worker feeding runnable changes into the manager.
pub struct LifecycleWorker {
    manager: Arc<RunLifecycleManager>,
    events: broadcast::Receiver<RunnableChanged>,
    shutdown: Arc<Notify>,
}

impl LifecycleWorker {
    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled or the bus closes.
    pub async fn run(mut self) {
        info!("Lifecycle worker started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Lifecycle worker shutting down");
                    break;
                }

                received = self.events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.manager.handle_event(&event).await {
                            error!(
                                runnable_id = %event.runnable.id,
                                state = %event.runnable.state,
                                error = %e,
                                "Failed to apply runnable change"
                            );
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Lifecycle worker lagged behind, resyncing runs");
                        if let Err(e) = self.manager.resync().await {
                            error!(error = %e, "Failed to resync runs");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}
