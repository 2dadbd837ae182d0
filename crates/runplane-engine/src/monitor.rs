// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation of backend truth into runnable state.
//!
//! [`Monitor::refresh`] is a pure function of the runnable and the live
//! backend resource. [`Monitor::reconcile`] wraps it with the store: the
//! refresh runs outside the row lock and is applied only if the stored
//! runnable is still RUNNING, so an interleaved stop/delete request or a
//! concurrent refresh is never overwritten by a stale result.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::{EventBus, RunnableChanged};
use crate::framework::Framework;
use crate::poller::{Workflow, WorkflowError};
use crate::runnable::Runnable;
use crate::state::State;
use crate::store::RunnableStore;

/// Message recorded when the backend resource cannot be found.
pub const MISSING_RESOURCE_MESSAGE: &str = "Resource is missing or invalid";

/// Reconciles runnables of one type tag against one framework.
#[derive(Clone)]
pub struct Monitor {
    framework: Arc<dyn Framework>,
    store: RunnableStore,
    events: EventBus,
}

impl Monitor {
    /// Create a monitor.
    pub fn new(framework: Arc<dyn Framework>, store: RunnableStore, events: EventBus) -> Self {
        Self {
            framework,
            store,
            events,
        }
    }

    /// Type tag reconciled by this monitor.
    pub fn kind(&self) -> &str {
        self.store.kind()
    }

    /// Framework this monitor reads from.
    pub fn framework(&self) -> &Arc<dyn Framework> {
        &self.framework
    }

    /// Map the live backend resource onto the runnable.
    ///
    /// Idempotent: diagnostics are replaced, never appended, so refreshing
    /// twice against an unchanged resource yields the same runnable.
    pub async fn refresh(&self, mut runnable: Runnable) -> Runnable {
        let spec = match self.framework.build(&runnable) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(runnable_id = %runnable.id, error = %e, "Failed to build backend spec");
                runnable.fail(MISSING_RESOURCE_MESSAGE);
                return runnable;
            }
        };

        let resource = match self.framework.get_resource(&spec).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                warn!(
                    runnable_id = %runnable.id,
                    resource = %spec.name,
                    "Backend resource is missing"
                );
                runnable.fail(MISSING_RESOURCE_MESSAGE);
                return runnable;
            }
            Err(e) => {
                // Transient read failure: leave the runnable as is, the next
                // tick retries.
                warn!(runnable_id = %runnable.id, error = %e, "Failed to read backend resource");
                return runnable;
            }
        };

        let status = &resource.status;
        if status.succeeded > 0 {
            runnable.state = State::Completed;
            runnable.error = None;
            runnable.message = Some(format!("Job completed: {} unit(s) succeeded", status.succeeded));
        } else if status.failed > 0 {
            let message = match &status.reason {
                Some(reason) => format!("Job failed: {} unit(s) failed: {}", status.failed, reason),
                None => format!("Job failed: {} unit(s) failed", status.failed),
            };
            runnable.fail(message);
        }

        match self.framework.pods(&resource).await {
            Ok(pods) => runnable.pods = pods,
            Err(e) => warn!(runnable_id = %runnable.id, error = %e, "Failed to collect pods"),
        }
        match self.framework.logs(&resource).await {
            Ok(logs) => runnable.logs = logs,
            Err(e) => warn!(runnable_id = %runnable.id, error = %e, "Failed to collect logs"),
        }
        match self.framework.metrics(&resource).await {
            Ok(metrics) => runnable.metrics = metrics,
            Err(e) => warn!(runnable_id = %runnable.id, error = %e, "Failed to collect metrics"),
        }
        match self.framework.results(&resource).await {
            Ok(results) => runnable.results = results,
            Err(e) => warn!(runnable_id = %runnable.id, error = %e, "Failed to collect results"),
        }

        runnable
    }

    /// Refresh a stored RUNNING runnable and write the outcome back.
    ///
    /// Returns the written runnable, or `None` when nothing was applied
    /// (missing, not RUNNING, superseded meanwhile, or a dropped diagnostic
    /// write).
    pub async fn reconcile(&self, id: &str) -> Result<Option<Runnable>> {
        let Some(current) = self.store.find(id).await? else {
            debug!(runnable_id = %id, "Runnable not in store, skipping");
            return Ok(None);
        };
        if current.state != State::Running {
            debug!(runnable_id = %id, state = %current.state, "Runnable not running, skipping");
            return Ok(None);
        }

        let refreshed = self.refresh(current).await;
        let next = refreshed.state;

        let written = self
            .store
            .update(id, move |stored| {
                if stored.state != State::Running || !stored.state.can_transition_to(next) {
                    return false;
                }
                *stored = refreshed;
                true
            })
            .await;

        let written = match written {
            Ok(Some(written)) => written,
            Ok(None) => {
                debug!(runnable_id = %id, "Runnable changed during refresh, dropped result");
                return Ok(None);
            }
            Err(e) if next == State::Running => {
                warn!(runnable_id = %id, error = %e, "Failed to store diagnostics");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if written.state != State::Running {
            info!(
                runnable_id = %id,
                kind = %self.kind(),
                state = %written.state,
                "Runnable reconciled"
            );
            self.events
                .publish(RunnableChanged::new(State::Running, written.clone()));
        }
        Ok(Some(written))
    }

    /// Reconcile every RUNNING runnable of this type in parallel.
    ///
    /// Returns how many runnables were written.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let running = self.store.list_by_state(State::Running).await?;
        let mut tasks = JoinSet::new();

        for runnable in running {
            let monitor = self.clone();
            tasks.spawn(async move {
                let result = monitor.reconcile(&runnable.id).await;
                (runnable.id, result)
            });
        }

        let mut written = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Some(_)))) => written += 1,
                Ok((_, Ok(None))) => {}
                Ok((id, Err(e))) => {
                    error!(runnable_id = %id, error = %e, "Failed to reconcile runnable");
                }
                Err(e) => error!(error = %e, "Reconcile task panicked"),
            }
        }
        Ok(written)
    }
}

/// Polling workflow reconciling all RUNNING runnables of one monitor.
pub struct MonitorWorkflow {
    monitor: Monitor,
}

impl MonitorWorkflow {
    /// Wrap a monitor.
    pub fn new(monitor: Monitor) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl Workflow for MonitorWorkflow {
    async fn execute(&self) -> std::result::Result<(), WorkflowError> {
        let written = self.monitor.reconcile_all().await?;
        debug!(kind = %self.monitor.kind(), written, "Monitor cycle finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{MockFramework, MockOperation};
    use crate::runnable::LogRecord;
    use crate::store::testing::memory_store;

    struct Fixture {
        framework: Arc<MockFramework>,
        monitor: Monitor,
        store: RunnableStore,
        events: EventBus,
    }

    async fn fixture() -> Fixture {
        let framework = Arc::new(MockFramework::new());
        let store = memory_store("mock").await;
        let events = EventBus::new(16);
        let monitor = Monitor::new(framework.clone(), store.clone(), events.clone());
        Fixture {
            framework,
            monitor,
            store,
            events,
        }
    }

    /// A runnable whose resource exists and is running.
    async fn running(fx: &Fixture, id: &str) -> Runnable {
        let runnable = Runnable::new(id, "demo", "container", "job", "mock");
        let runnable = fx.framework.run(runnable).await.unwrap();
        fx.store.store(id, &runnable).await.unwrap();
        runnable
    }

    #[tokio::test]
    async fn test_success_counter_completes() {
        let fx = fixture().await;
        let mut runnable = running(&fx, "run-1").await;
        runnable.error = Some("stale".into());
        fx.framework.complete("run-1").await;

        let refreshed = fx.monitor.refresh(runnable).await;

        assert_eq!(refreshed.state, State::Completed);
        assert!(refreshed.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_counter_embeds_count() {
        let fx = fixture().await;
        let runnable = running(&fx, "run-1").await;
        fx.framework.fail("run-1", 1, "BackoffLimitExceeded").await;

        let refreshed = fx.monitor.refresh(runnable).await;

        assert_eq!(refreshed.state, State::Error);
        let error = refreshed.error.unwrap();
        assert!(error.contains("1 unit(s) failed"), "{error}");
        assert!(error.contains("BackoffLimitExceeded"));
    }

    #[tokio::test]
    async fn test_missing_resource_sets_fixed_error_without_diagnostics() {
        let fx = fixture().await;
        let runnable = running(&fx, "run-1").await;
        fx.framework.remove_resource("run-1").await;

        let refreshed = fx.monitor.refresh(runnable).await;

        assert_eq!(refreshed.state, State::Error);
        assert_eq!(refreshed.error.as_deref(), Some(MISSING_RESOURCE_MESSAGE));
        assert!(refreshed.pods.is_empty());
        assert_eq!(fx.framework.calls(MockOperation::Logs).await, 0);
    }

    #[tokio::test]
    async fn test_active_resource_stays_running() {
        let fx = fixture().await;
        let runnable = running(&fx, "run-1").await;

        let refreshed = fx.monitor.refresh(runnable).await;

        assert_eq!(refreshed.state, State::Running);
        assert_eq!(refreshed.pods.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let fx = fixture().await;
        let runnable = running(&fx, "run-1").await;
        fx.framework
            .set_logs(
                "run-1",
                vec![LogRecord {
                    pod: "p".into(),
                    container: "stdout".into(),
                    content: "hello".into(),
                }],
            )
            .await;
        fx.framework.complete("run-1").await;

        let once = fx.monitor.refresh(runnable).await;
        let twice = fx.monitor.refresh(once.clone()).await;

        assert_eq!(once, twice);
        assert_eq!(twice.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_log_failure_does_not_change_state_decision() {
        let fx = fixture().await;
        let runnable = running(&fx, "run-1").await;
        fx.framework.complete("run-1").await;
        fx.framework.fail_on(MockOperation::Logs, "log api down").await;

        let refreshed = fx.monitor.refresh(runnable).await;

        assert_eq!(refreshed.state, State::Completed);
        assert!(refreshed.logs.is_empty());
        assert_eq!(refreshed.metrics.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_writes_and_publishes() {
        let fx = fixture().await;
        let mut rx = fx.events.subscribe();
        running(&fx, "run-1").await;
        fx.framework.complete("run-1").await;

        let written = fx.monitor.reconcile("run-1").await.unwrap().unwrap();

        assert_eq!(written.state, State::Completed);
        let stored = fx.store.find("run-1").await.unwrap().unwrap();
        assert_eq!(stored.state, State::Completed);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.previous, State::Running);
        assert_eq!(event.runnable.state, State::Completed);
    }

    #[tokio::test]
    async fn test_reconcile_skips_non_running() {
        let fx = fixture().await;
        let mut runnable = running(&fx, "run-1").await;
        runnable.state = State::Stop;
        fx.store.store("run-1", &runnable).await.unwrap();
        fx.framework.complete("run-1").await;

        assert!(fx.monitor.reconcile("run-1").await.unwrap().is_none());
        let stored = fx.store.find("run-1").await.unwrap().unwrap();
        assert_eq!(stored.state, State::Stop);
    }

    #[tokio::test]
    async fn test_reconcile_all() {
        let fx = fixture().await;
        running(&fx, "run-1").await;
        running(&fx, "run-2").await;
        fx.framework.complete("run-1").await;

        let written = fx.monitor.reconcile_all().await.unwrap();

        assert_eq!(written, 2);
        let done = fx.store.list_by_state(State::Completed).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, "run-1");
    }

    #[tokio::test]
    async fn test_monitor_workflow_executes_cycle() {
        let fx = fixture().await;
        running(&fx, "run-1").await;
        fx.framework.fail("run-1", 2, "OOMKilled").await;

        MonitorWorkflow::new(fx.monitor.clone())
            .execute()
            .await
            .unwrap();

        let stored = fx.store.find("run-1").await.unwrap().unwrap();
        assert_eq!(stored.state, State::Error);
    }
}
