// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Triggers and the actuators that fire them.
//!
//! An [`Actuator`] turns a [`Trigger`] into runs. The schedule actuator
//! registers one poller per trigger; every cycle submits a fresh run built
//! from the trigger's template.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::RunLifecycleManager;
use crate::poller::{PollerConfig, PollingService, Workflow, WorkflowError};
use crate::run::{Run, RunSpec};

/// Kind of the schedule actuator.
pub const SCHEDULE: &str = "schedule";

/// Run template carried by a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTemplate {
    /// Run kind
    pub kind: String,
    /// Task reference
    pub task: String,
    /// Run parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// A schedule or event source producing runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger ID
    pub id: String,
    /// Owning project
    pub project: String,
    /// Actuator kind
    pub kind: String,
    /// Template of the runs to submit
    pub template: RunTemplate,
    /// Interval between firings
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Stop after this many firings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u64>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Trigger {
    /// Build the next run. IDs are fresh UUIDs.
    pub fn next_run(&self) -> Run {
        let mut run = Run::new(
            uuid::Uuid::new_v4().to_string(),
            &self.project,
            &self.template.kind,
        );
        run.spec = RunSpec {
            task: Some(self.template.task.clone()),
            parameters: self.template.parameters.clone(),
        };
        run
    }

    /// Poller name used for this trigger.
    pub fn poller_name(&self) -> String {
        format!("trigger:{}", self.id)
    }
}

/// Strategy attached to triggers of one kind.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Trigger kind served.
    fn kind(&self) -> &str;

    /// Activate a trigger.
    async fn start(&self, trigger: &Trigger) -> Result<()>;

    /// Deactivate a trigger.
    async fn stop(&self, trigger: &Trigger) -> Result<()>;
}

/// Submits runs on a fixed interval.
pub struct ScheduleActuator {
    polling: Arc<PollingService>,
    manager: Arc<RunLifecycleManager>,
}

impl ScheduleActuator {
    /// Create the actuator over the engine's polling service and manager.
    pub fn new(polling: Arc<PollingService>, manager: Arc<RunLifecycleManager>) -> Self {
        Self { polling, manager }
    }
}

struct FireTrigger {
    trigger: Trigger,
    manager: Arc<RunLifecycleManager>,
    fired: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl Workflow for FireTrigger {
    async fn execute(&self) -> std::result::Result<(), WorkflowError> {
        use std::sync::atomic::Ordering;

        if let Some(max) = self.trigger.max_runs
            && self.fired.load(Ordering::SeqCst) >= max
        {
            info!(trigger_id = %self.trigger.id, max, "Trigger exhausted");
            return Err(WorkflowError::StopPoller);
        }
        self.fired.fetch_add(1, Ordering::SeqCst);

        let run = self.trigger.next_run();
        match self.manager.run(run).await {
            Ok(run) => {
                info!(trigger_id = %self.trigger.id, run_id = %run.id, "Trigger fired");
            }
            Err(e @ Error::NotFound { .. }) | Err(e @ Error::UnsupportedKind { .. }) => {
                return Err(WorkflowError::Failed(e.to_string()));
            }
            Err(e) => {
                warn!(trigger_id = %self.trigger.id, error = %e, "Triggered run failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for ScheduleActuator {
    fn kind(&self) -> &str {
        SCHEDULE
    }

    async fn start(&self, trigger: &Trigger) -> Result<()> {
        if trigger.kind != SCHEDULE {
            return Err(Error::UnsupportedKind {
                expected: SCHEDULE.to_string(),
                actual: trigger.kind.clone(),
            });
        }
        if trigger.interval.is_zero() {
            return Err(Error::InvalidArgument(format!(
                "trigger '{}' needs a non-zero interval",
                trigger.id
            )));
        }

        let workflow = Arc::new(FireTrigger {
            trigger: trigger.clone(),
            manager: self.manager.clone(),
            fired: Default::default(),
        });
        let poller = self
            .polling
            .create_poller(
                &trigger.poller_name(),
                workflow,
                PollerConfig::every(trigger.interval),
            )
            .await?;
        poller.start_polling()?;
        info!(trigger_id = %trigger.id, interval = ?trigger.interval, "Trigger started");
        Ok(())
    }

    async fn stop(&self, trigger: &Trigger) -> Result<()> {
        self.polling.remove(&trigger.poller_name()).await?;
        info!(trigger_id = %trigger.id, "Trigger stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::events::EventBus;
    use crate::lifecycle::InMemoryRunRepository;
    use crate::registry::RuntimeFactory;
    use crate::runnable::Runnable;
    use crate::runtimes::Runtime;

    struct Accepting;

    #[async_trait]
    impl Runtime for Accepting {
        fn kind(&self) -> &str {
            "container"
        }
        async fn build(
            &self,
            _: &crate::run::Executable,
            _: &crate::run::Task,
            _: &Run,
        ) -> Result<RunSpec> {
            Ok(RunSpec::default())
        }
        async fn run(&self, run: &Run) -> Result<Runnable> {
            Ok(Runnable::new(&run.id, &run.project, "container", "job", "mock"))
        }
        async fn stop(&self, run: &Run) -> Result<Runnable> {
            self.run(run).await
        }
        async fn resume(&self, run: &Run) -> Result<Runnable> {
            self.run(run).await
        }
        async fn delete(&self, run: &Run) -> Result<Runnable> {
            self.run(run).await
        }
    }

    fn actuator() -> (ScheduleActuator, Arc<PollingService>, Arc<RunLifecycleManager>) {
        let runtime: Arc<dyn Runtime> = Arc::new(Accepting);
        let factory = Arc::new(RuntimeFactory::new([runtime]).unwrap());
        let manager = Arc::new(RunLifecycleManager::new(
            factory,
            Arc::new(InMemoryRunRepository::new()),
            EventBus::new(16),
        ));
        let polling = Arc::new(PollingService::new());
        (
            ScheduleActuator::new(polling.clone(), manager.clone()),
            polling,
            manager,
        )
    }

    fn trigger(kind: &str, max_runs: Option<u64>) -> Trigger {
        Trigger {
            id: "nightly".into(),
            project: "demo".into(),
            kind: kind.into(),
            template: RunTemplate {
                kind: "container".into(),
                task: "container+job://demo/train".into(),
                parameters: Map::from_iter([("command".to_string(), json!("train"))]),
            },
            interval: Duration::from_secs(60),
            max_runs,
        }
    }

    #[test]
    fn test_next_run_uses_template() {
        let t = trigger(SCHEDULE, None);
        let a = t.next_run();
        let b = t.next_run();

        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, "container");
        assert_eq!(a.spec.task.as_deref(), Some("container+job://demo/train"));
        assert_eq!(a.spec.parameters.get("command"), Some(&json!("train")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_submits_runs_until_exhausted() {
        let (actuator, polling, manager) = actuator();
        actuator.start(&trigger(SCHEDULE, Some(2))).await.unwrap();

        tokio::time::sleep(Duration::from_secs(60 * 4 + 1)).await;

        assert_eq!(manager.list_runs().await.unwrap().len(), 2);
        let poller = polling.get("trigger:nightly").await.unwrap();
        assert!(!poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_removes_poller() {
        let (actuator, polling, _manager) = actuator();
        let t = trigger(SCHEDULE, None);
        actuator.start(&t).await.unwrap();
        assert_eq!(polling.names().await, vec!["trigger:nightly"]);

        actuator.stop(&t).await.unwrap();
        assert!(polling.names().await.is_empty());
        assert!(actuator.stop(&t).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_foreign_kind_and_duplicates() {
        let (actuator, _polling, _manager) = actuator();
        assert!(matches!(
            actuator.start(&trigger("webhook", None)).await,
            Err(Error::UnsupportedKind { .. })
        ));

        let t = trigger(SCHEDULE, None);
        actuator.start(&t).await.unwrap();
        assert!(matches!(
            actuator.start(&t).await,
            Err(Error::InvalidArgument(_))
        ));
        actuator.stop(&t).await.unwrap();
    }
}
