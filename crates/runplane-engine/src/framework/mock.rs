// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock framework for testing.
//!
//! Keeps resources in memory. Tests drive the native status directly
//! (`complete`, `fail`, `set_status`) and can make individual operations fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, broadcast};

use super::*;
use crate::runnable::{LogRecord, MetricsRecord, PodInfo, Runnable};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// `create_resource`
    Create,
    /// `get_resource`
    Get,
    /// `stop_resource`
    Stop,
    /// `delete_resource`
    Delete,
    /// `pods`
    Pods,
    /// `logs`
    Logs,
    /// `metrics`
    Metrics,
    /// `results`
    Results,
}

#[derive(Debug, Clone)]
struct MockResource {
    resource: BackendResource,
    logs: Vec<LogRecord>,
    results: Map<String, Value>,
}

#[derive(Default)]
struct MockState {
    resources: HashMap<String, MockResource>,
    failures: HashMap<MockOperation, String>,
    delays: HashMap<MockOperation, Duration>,
    calls: HashMap<MockOperation, usize>,
}

/// In-memory framework for tests.
pub struct MockFramework {
    kind: String,
    namespace: String,
    state: Arc<Mutex<MockState>>,
    events: broadcast::Sender<ResourceEvent>,
    /// Whether `subscribe()` exposes the event stream
    pub push_events: bool,
}

impl Default for MockFramework {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFramework {
    /// Create a mock framework with type tag `mock` in namespace `default`.
    pub fn new() -> Self {
        Self::with_kind("mock")
    }

    /// Create a mock framework serving another type tag.
    pub fn with_kind(kind: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            kind: kind.into(),
            namespace: "default".to_string(),
            state: Arc::new(Mutex::new(MockState::default())),
            events,
            push_events: true,
        }
    }

    /// Create a mock framework that does not push events.
    pub fn without_events() -> Self {
        Self {
            push_events: false,
            ..Self::new()
        }
    }

    /// Make `operation` fail with `message` until cleared.
    pub async fn fail_on(&self, operation: MockOperation, message: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert(operation, message.to_string());
    }

    /// Make `operation` take at least `delay` before it acts.
    pub async fn delay_on(&self, operation: MockOperation, delay: Duration) {
        self.state.lock().await.delays.insert(operation, delay);
    }

    /// Clear all injected failures.
    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// How many times `operation` was called.
    pub async fn calls(&self, operation: MockOperation) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a resource exists for the runnable.
    pub async fn has_resource(&self, runnable_id: &str) -> bool {
        self.state
            .lock()
            .await
            .resources
            .contains_key(&resource_name(runnable_id))
    }

    /// Current status of the runnable's resource.
    pub async fn status(&self, runnable_id: &str) -> Option<ResourceStatus> {
        self.state
            .lock()
            .await
            .resources
            .get(&resource_name(runnable_id))
            .map(|r| r.resource.status.clone())
    }

    /// Replace the native status of the runnable's resource and push an event.
    pub async fn set_status(&self, runnable_id: &str, status: ResourceStatus) {
        let event = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.resources.get_mut(&resource_name(runnable_id)) else {
                return;
            };
            entry.resource.status = status;
            ResourceEvent::new(ResourceEventKind::Modified, &entry.resource)
        };
        let _ = self.events.send(event);
    }

    /// Report one successful unit.
    pub async fn complete(&self, runnable_id: &str) {
        self.set_status(
            runnable_id,
            ResourceStatus {
                phase: Some("Succeeded".to_string()),
                succeeded: 1,
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
    }

    /// Report `failed` failed units with a native reason.
    pub async fn fail(&self, runnable_id: &str, failed: u32, reason: &str) {
        self.set_status(
            runnable_id,
            ResourceStatus {
                phase: Some("Failed".to_string()),
                failed,
                reason: Some(reason.to_string()),
                completed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await;
    }

    /// Attach logs to the runnable's resource.
    pub async fn set_logs(&self, runnable_id: &str, logs: Vec<LogRecord>) {
        if let Some(entry) = self
            .state
            .lock()
            .await
            .resources
            .get_mut(&resource_name(runnable_id))
        {
            entry.logs = logs;
        }
    }

    /// Attach results to the runnable's resource.
    pub async fn set_results(&self, runnable_id: &str, results: Map<String, Value>) {
        if let Some(entry) = self
            .state
            .lock()
            .await
            .resources
            .get_mut(&resource_name(runnable_id))
        {
            entry.results = results;
        }
    }

    /// Drop the runnable's resource behind the engine's back.
    pub async fn remove_resource(&self, runnable_id: &str) {
        self.state
            .lock()
            .await
            .resources
            .remove(&resource_name(runnable_id));
    }

    async fn enter(&self, operation: MockOperation) -> Result<()> {
        let (delay, failure) = {
            let mut state = self.state.lock().await;
            *state.calls.entry(operation).or_insert(0) += 1;
            (
                state.delays.get(&operation).copied(),
                state.failures.get(&operation).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => Err(BackendError::Operation(message)),
            None => Ok(()),
        }
    }

    async fn find(&self, name: &str) -> Option<MockResource> {
        self.state.lock().await.resources.get(name).cloned()
    }
}

#[async_trait]
impl Framework for MockFramework {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn build(&self, runnable: &Runnable) -> Result<BackendSpec> {
        BackendSpec::from_runnable(runnable, &self.namespace)
    }

    async fn create_resource(&self, spec: &BackendSpec) -> Result<BackendResource> {
        self.enter(MockOperation::Create).await?;

        let (resource, event) = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.resources.get(&spec.name)
                && existing.resource.status.active > 0
            {
                return Ok(existing.resource.clone());
            }

            let resource = BackendResource {
                name: spec.name.clone(),
                namespace: spec.namespace.clone(),
                labels: spec.labels.clone(),
                status: ResourceStatus {
                    phase: Some("Running".to_string()),
                    active: spec.parallelism,
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            };
            state.resources.insert(
                spec.name.clone(),
                MockResource {
                    resource: resource.clone(),
                    logs: Vec::new(),
                    results: Map::new(),
                },
            );
            let event = ResourceEvent::new(ResourceEventKind::Added, &resource);
            (resource, event)
        };

        let _ = self.events.send(event);
        Ok(resource)
    }

    async fn get_resource(&self, spec: &BackendSpec) -> Result<Option<BackendResource>> {
        self.enter(MockOperation::Get).await?;
        Ok(self.find(&spec.name).await.map(|r| r.resource))
    }

    async fn stop_resource(&self, resource: &BackendResource) -> Result<()> {
        self.enter(MockOperation::Stop).await?;

        let event = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.resources.get_mut(&resource.name) else {
                return Ok(());
            };
            entry.resource.status.active = 0;
            entry.resource.status.phase = Some("Stopped".to_string());
            ResourceEvent::new(ResourceEventKind::Modified, &entry.resource)
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn delete_resource(&self, resource: &BackendResource) -> Result<()> {
        self.enter(MockOperation::Delete).await?;

        let removed = self.state.lock().await.resources.remove(&resource.name);
        if let Some(entry) = removed {
            let _ = self
                .events
                .send(ResourceEvent::new(ResourceEventKind::Deleted, &entry.resource));
        }
        Ok(())
    }

    async fn pods(&self, resource: &BackendResource) -> Result<Vec<PodInfo>> {
        self.enter(MockOperation::Pods).await?;
        let Some(entry) = self.find(&resource.name).await else {
            return Ok(Vec::new());
        };
        let status = &entry.resource.status;
        Ok(vec![PodInfo {
            name: format!("{}-0", entry.resource.name),
            phase: status.phase.clone().unwrap_or_else(|| "Unknown".to_string()),
            exit_code: match (status.succeeded, status.failed) {
                (s, _) if s > 0 => Some(0),
                (_, f) if f > 0 => Some(1),
                _ => None,
            },
            started_at: status.started_at,
        }])
    }

    async fn logs(&self, resource: &BackendResource) -> Result<Vec<LogRecord>> {
        self.enter(MockOperation::Logs).await?;
        Ok(self
            .find(&resource.name)
            .await
            .map(|r| r.logs)
            .unwrap_or_default())
    }

    async fn metrics(&self, resource: &BackendResource) -> Result<Vec<MetricsRecord>> {
        self.enter(MockOperation::Metrics).await?;
        Ok(vec![MetricsRecord {
            pod: format!("{}-0", resource.name),
            memory_current_bytes: Some(1024),
            ..Default::default()
        }])
    }

    async fn results(&self, resource: &BackendResource) -> Result<Map<String, Value>> {
        self.enter(MockOperation::Results).await?;
        Ok(self
            .find(&resource.name)
            .await
            .map(|r| r.results)
            .unwrap_or_default())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ResourceEvent>> {
        self.push_events.then(|| self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    fn runnable() -> Runnable {
        Runnable::new("run-1", "demo", "container", "job", "mock")
    }

    #[tokio::test]
    async fn test_run_creates_resource() {
        let framework = MockFramework::new();

        let result = framework.run(runnable()).await.unwrap();

        assert_eq!(result.state, State::Running);
        assert!(framework.has_resource("run-1").await);
        assert_eq!(framework.status("run-1").await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_run_failure_is_backend_error() {
        let framework = MockFramework::new();
        framework
            .fail_on(MockOperation::Create, "quota exceeded")
            .await;

        let err = framework.run(runnable()).await.unwrap_err();

        assert_eq!(err.to_string(), "quota exceeded");
        assert!(!framework.has_resource("run-1").await);
    }

    #[tokio::test]
    async fn test_stop_and_delete_missing_resource_succeed() {
        let framework = MockFramework::new();

        let stopped = framework.stop(runnable()).await.unwrap();
        assert_eq!(stopped.state, State::Stopped);

        let deleted = framework.delete(runnable()).await.unwrap();
        assert_eq!(deleted.state, State::Deleted);
        assert_eq!(framework.calls(MockOperation::Delete).await, 0);
    }

    #[tokio::test]
    async fn test_events_are_pushed() {
        let framework = MockFramework::new();
        let mut rx = framework.subscribe().unwrap();

        framework.run(runnable()).await.unwrap();
        framework.complete("run-1").await;

        assert_eq!(rx.recv().await.unwrap().kind, ResourceEventKind::Added);
        let modified = rx.recv().await.unwrap();
        assert_eq!(modified.kind, ResourceEventKind::Modified);
        assert_eq!(modified.runnable_id(), Some("run-1"));
    }

    #[test]
    fn test_without_events_has_no_stream() {
        assert!(MockFramework::without_events().subscribe().is_none());
    }
}
