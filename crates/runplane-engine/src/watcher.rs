// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event-driven reconciliation.
//!
//! The watcher subscribes to a framework's resource events at construction
//! time and, for every event in scope, spawns a [`Monitor::reconcile`] for
//! the affected runnable. Errors are logged, never propagated to the stream.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::framework::{LabelSelector, ResourceEvent};
use crate::monitor::Monitor;

/// Background worker turning resource events into monitor reconciles.
pub struct Watcher {
    monitor: Monitor,
    selector: LabelSelector,
    events: Option<broadcast::Receiver<ResourceEvent>>,
    shutdown: Arc<Notify>,
}

impl Watcher {
    /// Create a watcher. Subscribes immediately so no event after this call is missed.
    pub fn new(monitor: Monitor, selector: LabelSelector) -> Self {
        let events = monitor.framework().subscribe();
        Self {
            monitor,
            selector,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Whether the framework pushes events at all.
    pub fn is_subscribed(&self) -> bool {
        self.events.is_some()
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the watch loop until shutdown is signalled or the stream closes.
    pub async fn run(mut self) {
        let Some(mut events) = self.events.take() else {
            info!(kind = %self.monitor.kind(), "Framework pushes no events, watcher idle");
            self.shutdown.notified().await;
            return;
        };

        info!(
            kind = %self.monitor.kind(),
            namespace = ?self.selector.namespace,
            "Watcher started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(kind = %self.monitor.kind(), "Watcher shutting down");
                    break;
                }

                received = events.recv() => match received {
                    Ok(event) => self.dispatch(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(kind = %self.monitor.kind(), skipped, "Watcher lagged behind, events skipped");
                    }
                    Err(RecvError::Closed) => {
                        info!(kind = %self.monitor.kind(), "Resource event stream closed");
                        break;
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: ResourceEvent) {
        if !self.selector.matches(&event) {
            return;
        }
        let Some(id) = event.runnable_id().map(str::to_string) else {
            debug!(resource = %event.name, "Event without runnable label, ignored");
            return;
        };

        let monitor = self.monitor.clone();
        tokio::spawn(async move {
            if let Err(e) = monitor.reconcile(&id).await {
                warn!(runnable_id = %id, error = %e, "Event-driven reconcile failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::events::EventBus;
    use crate::framework::{Framework, MockFramework};
    use crate::runnable::Runnable;
    use crate::state::State;
    use crate::store::RunnableStore;
    use crate::store::testing::memory_store;

    async fn wait_for_state(store: &RunnableStore, id: &str, state: State) -> bool {
        for _ in 0..100 {
            if let Some(r) = store.find(id).await.unwrap()
                && r.state == state
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_event_triggers_reconcile() {
        let framework = Arc::new(MockFramework::new());
        let store = memory_store("mock").await;
        let monitor = Monitor::new(framework.clone(), store.clone(), EventBus::new(16));

        let runnable = framework
            .run(Runnable::new("run-1", "demo", "container", "job", "mock"))
            .await
            .unwrap();
        store.store("run-1", &runnable).await.unwrap();

        let watcher = Watcher::new(monitor, LabelSelector::namespace("default"));
        let shutdown = watcher.shutdown_handle();
        let handle = tokio::spawn(watcher.run());

        framework.complete("run-1").await;

        assert!(wait_for_state(&store, "run-1", State::Completed).await);
        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_scope_events_are_ignored() {
        let framework = Arc::new(MockFramework::new());
        let store = memory_store("mock").await;
        let monitor = Monitor::new(framework.clone(), store.clone(), EventBus::new(16));

        let runnable = framework
            .run(Runnable::new("run-1", "demo", "container", "job", "mock"))
            .await
            .unwrap();
        store.store("run-1", &runnable).await.unwrap();

        let watcher = Watcher::new(monitor, LabelSelector::namespace("elsewhere"));
        let shutdown = watcher.shutdown_handle();
        let handle = tokio::spawn(watcher.run());

        framework.complete("run-1").await;

        assert!(!wait_for_state(&store, "run-1", State::Completed).await);
        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_without_event_stream() {
        let framework = Arc::new(MockFramework::without_events());
        let store = memory_store("mock").await;
        let monitor = Monitor::new(framework, store, EventBus::new(16));

        let watcher = Watcher::new(monitor, LabelSelector::default());
        assert!(!watcher.is_subscribed());
        let shutdown = watcher.shutdown_handle();
        let handle = tokio::spawn(watcher.run());

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
