// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recurring work scheduling.
//!
//! A [`Poller`] runs a [`Workflow`] every `delay` on its own task:
//!
//! ```text
//! created (active) ──start_polling──► polling ──stop / StopPoller / error / one-shot──► stopped
//! ```
//!
//! The transition is one-way: a stopped poller never restarts. A workflow
//! returning [`WorkflowError::StopPoller`] ends polling quietly; any other
//! error ends it with an error log. With `reschedule` disabled the poller
//! stops after exactly one cycle. [`PollingService`] keeps named pollers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Outcome of a workflow cycle other than success.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Intentional termination of the poller. Not a failure.
    #[error("Poller stop requested")]
    StopPoller,

    /// The cycle failed.
    #[error("{0}")]
    Failed(String),
}

impl From<Error> for WorkflowError {
    fn from(e: Error) -> Self {
        WorkflowError::Failed(e.to_string())
    }
}

/// A unit of recurring work.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Run one cycle.
    async fn execute(&self) -> std::result::Result<(), WorkflowError>;
}

/// Workflow from an async closure.
pub struct FnWorkflow<F> {
    f: F,
}

impl<F, Fut> FnWorkflow<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), WorkflowError>> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Workflow for FnWorkflow<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), WorkflowError>> + Send + 'static,
{
    async fn execute(&self) -> std::result::Result<(), WorkflowError> {
        (self.f)().await
    }
}

/// Composes workflows, either one after another or all at once.
pub struct StepsWorkflow {
    steps: Vec<Arc<dyn Workflow>>,
    parallel: bool,
}

impl StepsWorkflow {
    /// Steps run in order; the first error ends the cycle.
    pub fn sequential(steps: Vec<Arc<dyn Workflow>>) -> Self {
        Self {
            steps,
            parallel: false,
        }
    }

    /// Steps run concurrently; all are awaited.
    ///
    /// `StopPoller` from any step wins over failures.
    pub fn parallel(steps: Vec<Arc<dyn Workflow>>) -> Self {
        Self {
            steps,
            parallel: true,
        }
    }
}

#[async_trait]
impl Workflow for StepsWorkflow {
    async fn execute(&self) -> std::result::Result<(), WorkflowError> {
        if !self.parallel {
            for step in &self.steps {
                step.execute().await?;
            }
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for step in &self.steps {
            let step = step.clone();
            tasks.spawn(async move { step.execute().await });
        }

        let mut stop = false;
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(WorkflowError::StopPoller)) => stop = true,
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(WorkflowError::Failed(format!("step panicked: {}", e)));
                }
            }
        }

        match (stop, failure) {
            (true, _) => Err(WorkflowError::StopPoller),
            (false, Some(e)) => Err(e),
            (false, None) => Ok(()),
        }
    }
}

/// Poller timing and execution mode.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay before the first cycle and between cycles
    pub delay: Duration,
    /// Schedule another cycle after each one
    pub reschedule: bool,
    /// Run each cycle on its own task and only await its completion
    pub workflows_async: bool,
    /// How long `stop_polling` waits for in-flight work before aborting it
    pub grace_period: Duration,
}

impl PollerConfig {
    /// Rescheduling, synchronous poller with the given delay.
    pub fn every(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Run only one cycle.
    pub fn once(mut self) -> Self {
        self.reschedule = false;
        self
    }

    /// Run cycles as separate tasks.
    pub fn asynchronous(mut self) -> Self {
        self.workflows_async = true;
        self
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(60),
            reschedule: true,
            workflows_async: false,
            grace_period: Duration::from_secs(10),
        }
    }
}

/// Runs a workflow on a fixed delay until stopped.
pub struct Poller {
    name: String,
    workflow: Arc<dyn Workflow>,
    config: PollerConfig,
    active: Arc<AtomicBool>,
    executions: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<std::sync::Mutex<Option<AbortHandle>>>,
}

impl Poller {
    /// Create an active, not yet started poller.
    pub fn new(name: impl Into<String>, workflow: Arc<dyn Workflow>, config: PollerConfig) -> Self {
        Self {
            name: name.into(),
            workflow,
            config,
            active: Arc::new(AtomicBool::new(true)),
            executions: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(Notify::new()),
            handle: std::sync::Mutex::new(None),
            in_flight: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Poller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the poller has not stopped yet.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of completed workflow cycles.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Schedule the first cycle after `delay`.
    ///
    /// Starting a running poller is a no-op; starting a stopped one fails.
    pub fn start_polling(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::InvalidArgument(format!(
                "poller '{}' is stopped",
                self.name
            )));
        }

        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() {
            return Ok(());
        }

        let name = self.name.clone();
        let workflow = self.workflow.clone();
        let config = self.config.clone();
        let active = self.active.clone();
        let executions = self.executions.clone();
        let shutdown = self.shutdown.clone();
        let in_flight = self.in_flight.clone();

        *handle = Some(tokio::spawn(async move {
            debug!(poller = %name, delay_ms = config.delay.as_millis() as u64, "Poller started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(config.delay) => {}
                }
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                let outcome = if config.workflows_async {
                    let workflow = workflow.clone();
                    let task = tokio::spawn(async move { workflow.execute().await });
                    *in_flight.lock().unwrap_or_else(|p| p.into_inner()) = Some(task.abort_handle());
                    let joined = task.await;
                    in_flight.lock().unwrap_or_else(|p| p.into_inner()).take();
                    joined.unwrap_or_else(|e| {
                        Err(WorkflowError::Failed(format!("workflow task failed: {}", e)))
                    })
                } else {
                    workflow.execute().await
                };
                executions.fetch_add(1, Ordering::SeqCst);

                match outcome {
                    Ok(()) => {}
                    Err(WorkflowError::StopPoller) => {
                        info!(poller = %name, "Workflow requested poller stop");
                        break;
                    }
                    Err(e) => {
                        error!(poller = %name, error = %e, "Workflow failed, stopping poller");
                        break;
                    }
                }

                if !config.reschedule || !active.load(Ordering::SeqCst) {
                    break;
                }
            }

            active.store(false, Ordering::SeqCst);
            debug!(poller = %name, "Poller stopped");
        }));

        Ok(())
    }

    /// Stop the poller. Idempotent.
    ///
    /// Waits up to the grace period for an in-flight cycle, then aborts it.
    pub async fn stop_polling(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(mut handle) = handle else {
            return;
        };

        if tokio::time::timeout(self.config.grace_period, &mut handle)
            .await
            .is_err()
        {
            warn!(
                poller = %self.name,
                grace_ms = self.config.grace_period.as_millis() as u64,
                "Poller did not stop within grace period, aborting"
            );
            handle.abort();
            if let Some(task) = self
                .in_flight
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
            {
                task.abort();
            }
        }
    }
}

/// Named registry of pollers.
#[derive(Default)]
pub struct PollingService {
    pollers: Mutex<HashMap<String, Arc<Poller>>>,
}

impl PollingService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new poller. Names are unique.
    pub async fn create_poller(
        &self,
        name: &str,
        workflow: Arc<dyn Workflow>,
        config: PollerConfig,
    ) -> Result<Arc<Poller>> {
        let mut pollers = self.pollers.lock().await;
        if pollers.contains_key(name) {
            return Err(Error::InvalidArgument(format!(
                "poller '{}' already exists",
                name
            )));
        }
        let poller = Arc::new(Poller::new(name, workflow, config));
        pollers.insert(name.to_string(), poller.clone());
        Ok(poller)
    }

    /// Look up a poller.
    pub async fn get(&self, name: &str) -> Option<Arc<Poller>> {
        self.pollers.lock().await.get(name).cloned()
    }

    /// Names of all registered pollers.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pollers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start a poller by name.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.require(name).await?.start_polling()
    }

    /// Stop a poller by name, keeping it registered.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.require(name).await?.stop_polling().await;
        Ok(())
    }

    /// Stop and unregister a poller.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let poller = self
            .pollers
            .lock()
            .await
            .remove(name)
            .ok_or_else(|| Error::not_found("Poller", name))?;
        poller.stop_polling().await;
        Ok(())
    }

    /// Start every registered, still active poller.
    pub async fn start_all(&self) {
        for poller in self.snapshot().await {
            if poller.is_active()
                && let Err(e) = poller.start_polling()
            {
                warn!(poller = %poller.name(), error = %e, "Failed to start poller");
            }
        }
    }

    /// Stop every registered poller.
    pub async fn stop_all(&self) {
        for poller in self.snapshot().await {
            poller.stop_polling().await;
        }
    }

    async fn require(&self, name: &str) -> Result<Arc<Poller>> {
        self.get(name)
            .await
            .ok_or_else(|| Error::not_found("Poller", name))
    }

    async fn snapshot(&self) -> Vec<Arc<Poller>> {
        self.pollers.lock().await.values().cloned().collect()
    }
}
