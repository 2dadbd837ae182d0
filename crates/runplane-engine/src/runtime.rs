// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`EngineRuntime`] wires every component together and owns the background
//! tasks. For each registered framework it starts a listener, a watcher and
//! a monitor poller; runtimes are constructed against the resulting
//! dispatcher, and the lifecycle worker consumes the change bus.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runplane_engine::framework::{ProcessFramework, ProcessFrameworkConfig};
//! use runplane_engine::runtime::EngineRuntime;
//! use runplane_engine::runtimes::ContainerRuntime;
//! use runplane_engine::store::sqlite::SqliteRecordRepository;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let repository = Arc::new(SqliteRecordRepository::from_path(".data/runplane.db").await?);
//!     let framework = Arc::new(ProcessFramework::new(ProcessFrameworkConfig::new(".data")));
//!
//!     let engine = EngineRuntime::builder()
//!         .repository(repository)
//!         .framework(framework)
//!         .runtime(|wiring| {
//!             let base = wiring.base_runtime("container", &["process"])?;
//!             Ok(Arc::new(ContainerRuntime::new(base, "process")))
//!         })
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... submit runs through engine.manager() ...
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::actuator::{Actuator, ScheduleActuator};
use crate::config::Config;
use crate::events::EventBus;
use crate::framework::{Framework, LabelSelector};
use crate::lifecycle::{InMemoryRunRepository, RunLifecycleManager, RunRepository};
use crate::listener::{Dispatcher, Listener};
use crate::monitor::{Monitor, MonitorWorkflow};
use crate::poller::{PollerConfig, PollingService};
use crate::registry::{ActuatorFactory, RuntimeFactory};
use crate::runtimes::{BaseRuntime, Runtime};
use crate::store::{RecordRepository, RunnableStore};
use crate::watcher::Watcher;

/// Deferred runtime construction; runs once the dispatcher exists.
pub type RuntimeConstructor =
    Box<dyn FnOnce(&Wiring) -> crate::error::Result<Arc<dyn Runtime>> + Send>;

/// What runtimes are built against.
pub struct Wiring {
    dispatcher: Arc<Dispatcher>,
}

impl Wiring {
    /// Shared plumbing for a runtime of `kind` whose runnables use the given type tags.
    pub fn base_runtime(&self, kind: &str, frameworks: &[&str]) -> crate::error::Result<BaseRuntime> {
        BaseRuntime::with_frameworks(kind, frameworks, self.dispatcher.clone())
    }

    /// The engine's dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    repository: Option<Arc<dyn RecordRepository>>,
    run_repository: Option<Arc<dyn RunRepository>>,
    frameworks: Vec<Arc<dyn Framework>>,
    runtimes: Vec<RuntimeConstructor>,
    namespace: String,
    monitor_delay: Duration,
    listener_concurrency: usize,
    event_capacity: usize,
    channel_capacity: usize,
    poller_grace_period: Duration,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            repository: None,
            run_repository: None,
            frameworks: Vec::new(),
            runtimes: Vec::new(),
            namespace: "default".to_string(),
            monitor_delay: Duration::from_secs(60),
            listener_concurrency: 8,
            event_capacity: 1024,
            channel_capacity: 256,
            poller_grace_period: Duration::from_secs(10),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply namespace and tuning values from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.namespace = config.namespace.clone();
        self.monitor_delay = config.monitor_delay;
        self.listener_concurrency = config.listener_concurrency;
        self.event_capacity = config.event_capacity;
        self
    }

    /// Set the runnable record repository (required).
    pub fn repository(mut self, repository: Arc<dyn RecordRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set the run repository.
    ///
    /// Default: [`InMemoryRunRepository`]
    pub fn run_repository(mut self, repository: Arc<dyn RunRepository>) -> Self {
        self.run_repository = Some(repository);
        self
    }

    /// Register a framework (at least one is required).
    pub fn framework(mut self, framework: Arc<dyn Framework>) -> Self {
        self.frameworks.push(framework);
        self
    }

    /// Register a runtime, constructed at start against the engine's wiring.
    pub fn runtime<F>(mut self, constructor: F) -> Self
    where
        F: FnOnce(&Wiring) -> crate::error::Result<Arc<dyn Runtime>> + Send + 'static,
    {
        self.runtimes.push(Box::new(constructor));
        self
    }

    /// Set the namespace watched by the watchers.
    ///
    /// Default: `default`
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the delay between monitor polling cycles.
    ///
    /// Default: 60 seconds
    pub fn monitor_delay(mut self, delay: Duration) -> Self {
        self.monitor_delay = delay;
        self
    }

    /// Set the maximum number of in-flight listener operations per type tag.
    ///
    /// Default: 8
    pub fn listener_concurrency(mut self, concurrency: usize) -> Self {
        self.listener_concurrency = concurrency;
        self
    }

    /// Set the capacity of the change event bus.
    ///
    /// Default: 1024
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the capacity of each pending-request channel.
    ///
    /// Default: 256
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set how long pollers get to finish in-flight work on shutdown.
    ///
    /// Default: 10 seconds
    pub fn poller_grace_period(mut self, grace: Duration) -> Self {
        self.poller_grace_period = grace;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let repository = self
            .repository
            .ok_or_else(|| anyhow::anyhow!("repository is required"))?;
        if self.frameworks.is_empty() {
            anyhow::bail!("at least one framework is required");
        }
        if self.listener_concurrency == 0 {
            anyhow::bail!("listener_concurrency must be at least 1");
        }

        Ok(EngineRuntimeConfig {
            repository,
            run_repository: self
                .run_repository
                .unwrap_or_else(|| Arc::new(InMemoryRunRepository::new())),
            frameworks: self.frameworks,
            runtimes: self.runtimes,
            namespace: self.namespace,
            monitor_delay: self.monitor_delay,
            listener_concurrency: self.listener_concurrency,
            event_capacity: self.event_capacity,
            channel_capacity: self.channel_capacity,
            poller_grace_period: self.poller_grace_period,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    repository: Arc<dyn RecordRepository>,
    run_repository: Arc<dyn RunRepository>,
    frameworks: Vec<Arc<dyn Framework>>,
    runtimes: Vec<RuntimeConstructor>,
    namespace: String,
    monitor_delay: Duration,
    listener_concurrency: usize,
    event_capacity: usize,
    channel_capacity: usize,
    poller_grace_period: Duration,
}

struct Worker {
    name: String,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl EngineRuntimeConfig {
    /// Start the engine: listeners, watchers, monitor pollers and the lifecycle worker.
    pub async fn start(self) -> Result<EngineRuntime> {
        let events = EventBus::new(self.event_capacity);
        let polling = Arc::new(PollingService::new());
        let mut dispatcher = Dispatcher::new();
        let mut workers = Vec::new();
        let mut monitors = Vec::new();

        for framework in &self.frameworks {
            let kind = framework.kind().to_string();
            let store = RunnableStore::new(kind.clone(), self.repository.clone());

            let pending = dispatcher.route(store.clone(), self.channel_capacity)?;
            let listener = Listener::new(
                framework.clone(),
                store.clone(),
                events.clone(),
                self.listener_concurrency,
            );
            let listener_shutdown = Arc::new(Notify::new());
            workers.push(Worker {
                name: format!("Listener '{}'", kind),
                shutdown: listener_shutdown.clone(),
                handle: tokio::spawn(listener.run(pending, listener_shutdown)),
            });

            let monitor = Monitor::new(framework.clone(), store, events.clone());
            let watcher = Watcher::new(monitor.clone(), LabelSelector::namespace(&self.namespace));
            workers.push(Worker {
                name: format!("Watcher '{}'", kind),
                shutdown: watcher.shutdown_handle(),
                handle: tokio::spawn(watcher.run()),
            });

            let mut poller_config = PollerConfig::every(self.monitor_delay).asynchronous();
            poller_config.grace_period = self.poller_grace_period;
            polling
                .create_poller(
                    &format!("monitor:{}", kind),
                    Arc::new(MonitorWorkflow::new(monitor.clone())),
                    poller_config,
                )
                .await?;
            monitors.push(monitor);
        }

        let dispatcher = Arc::new(dispatcher);
        let wiring = Wiring {
            dispatcher: dispatcher.clone(),
        };
        let runtimes = self
            .runtimes
            .into_iter()
            .map(|construct| construct(&wiring))
            .collect::<crate::error::Result<Vec<_>>>()?;
        let factory = Arc::new(RuntimeFactory::new(runtimes)?);

        let manager = Arc::new(RunLifecycleManager::new(
            factory,
            self.run_repository,
            events.clone(),
        ));
        let worker = manager.worker();
        workers.push(Worker {
            name: "Lifecycle worker".to_string(),
            shutdown: worker.shutdown_handle(),
            handle: tokio::spawn(worker.run()),
        });

        let schedule: Arc<dyn Actuator> =
            Arc::new(ScheduleActuator::new(polling.clone(), manager.clone()));
        let actuators = Arc::new(ActuatorFactory::new([schedule])?);

        // Requests persisted before a restart never reached their listener
        match recover_pending(&dispatcher).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Re-enqueued pending runnables"),
            Err(e) => warn!(error = %e, "Failed to recover pending runnables"),
        }

        polling.start_all().await;

        info!(
            frameworks = ?self.frameworks.iter().map(|f| f.kind().to_string()).collect::<Vec<_>>(),
            runtimes = ?manager.runtimes().kinds(),
            namespace = %self.namespace,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            events,
            dispatcher,
            manager,
            actuators,
            polling,
            monitors,
            workers,
        })
    }
}

async fn recover_pending(dispatcher: &Dispatcher) -> crate::error::Result<usize> {
    let mut recovered = 0;
    for store in dispatcher.stores() {
        for runnable in store.list().await? {
            if runnable.state.is_request() {
                dispatcher.enqueue(runnable).await?;
                recovered += 1;
            }
        }
    }
    Ok(recovered)
}

/// A running engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    events: EventBus,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<RunLifecycleManager>,
    actuators: Arc<ActuatorFactory>,
    polling: Arc<PollingService>,
    monitors: Vec<Monitor>,
    workers: Vec<Worker>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Caller-facing run operations.
    pub fn manager(&self) -> &Arc<RunLifecycleManager> {
        &self.manager
    }

    /// Registered actuators.
    pub fn actuators(&self) -> &Arc<ActuatorFactory> {
        &self.actuators
    }

    /// Runnable change bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Named pollers, including one monitor poller per framework.
    pub fn polling(&self) -> &Arc<PollingService> {
        &self.polling
    }

    /// Store for a runnable type tag.
    pub fn store(&self, kind: &str) -> Option<&RunnableStore> {
        self.dispatcher.store(kind)
    }

    /// Monitor for a runnable type tag.
    pub fn monitor(&self, kind: &str) -> Option<&Monitor> {
        self.monitors.iter().find(|m| m.kind() == kind)
    }

    /// Check if every background task is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().all(|w| !w.handle.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Pollers are stopped first, then every worker is signalled and awaited.
    /// Listeners finish their in-flight operations before exiting.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.polling.stop_all().await;

        for worker in &self.workers {
            worker.shutdown.notify_one();
        }

        let mut panicked = 0;
        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                error!("{} task panicked: {}", worker.name, e);
                panicked += 1;
            }
        }

        if panicked > 0 {
            anyhow::bail!("{} background task(s) panicked", panicked);
        }
        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}
