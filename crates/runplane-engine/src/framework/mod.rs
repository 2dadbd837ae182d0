// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend adapters.
//!
//! A [`Framework`] translates a [`Runnable`] into operations on one execution
//! backend. The six primitive operations (`build`, `create_resource`,
//! `get_resource`, `stop_resource`, `delete_resource` and the best-effort
//! introspection calls) are implemented per backend; the composite
//! `run`/`stop`/`delete` used by listeners are provided on top of them.
//!
//! Frameworks are PURE backend clients - they do NOT access the runnable
//! store. Persistence is handled by the caller (listener or monitor).

pub mod mock;
pub mod process;

pub use mock::{MockFramework, MockOperation};
pub use process::{ProcessFramework, ProcessFrameworkConfig};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::runnable::{LogRecord, MetricsRecord, PodInfo, Requirements, Runnable};
use crate::state::State;

/// Label carrying the runnable ID on every backend resource.
pub const LABEL_RUNNABLE_ID: &str = "runplane.io/runnable-id";
/// Label carrying the runtime kind.
pub const LABEL_RUNTIME: &str = "runplane.io/runtime";
/// Label carrying the task kind.
pub const LABEL_TASK: &str = "runplane.io/task";
/// Label carrying the owning project.
pub const LABEL_PROJECT: &str = "runplane.io/project";

/// Errors crossing the backend boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// Backend operation failed.
    #[error("{0}")]
    Operation(String),

    /// The runnable cannot be expressed on this backend.
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Deterministic backend resource name for a runnable.
///
/// Repeated creation for the same runnable addresses the same resource.
pub fn resource_name(runnable_id: &str) -> String {
    let digest = Sha256::digest(runnable_id.as_bytes());
    let hex = format!("{:x}", digest);
    format!("rp-{}", &hex[..16])
}

/// Backend-neutral description of the resource to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Resource name (see [`resource_name`])
    pub name: String,
    /// Backend namespace
    pub namespace: String,
    /// Runnable the resource belongs to
    pub runnable_id: String,
    /// Labels attached to the resource
    pub labels: BTreeMap<String, String>,
    /// Container image
    pub image: Option<String>,
    /// Entry command
    pub command: Option<String>,
    /// Command arguments
    pub args: Vec<String>,
    /// Number of parallel units
    pub parallelism: u32,
    /// Requirements (limits, volumes, env, placement)
    pub requirements: Requirements,
}

impl BackendSpec {
    /// Translate a runnable into a spec for `namespace`. No I/O.
    pub fn from_runnable(runnable: &Runnable, namespace: &str) -> Result<Self> {
        if runnable.id.is_empty() {
            return Err(BackendError::InvalidResource(
                "runnable id is required".to_string(),
            ));
        }

        let mut labels = runnable.labels.clone();
        labels.insert(LABEL_RUNNABLE_ID.to_string(), runnable.id.clone());
        labels.insert(LABEL_RUNTIME.to_string(), runnable.runtime.clone());
        labels.insert(LABEL_TASK.to_string(), runnable.task.clone());
        labels.insert(LABEL_PROJECT.to_string(), runnable.project.clone());

        Ok(Self {
            name: resource_name(&runnable.id),
            namespace: namespace.to_string(),
            runnable_id: runnable.id.clone(),
            labels,
            image: runnable.image.clone(),
            command: runnable.command.clone(),
            args: runnable.args.clone(),
            parallelism: runnable.parallelism.max(1),
            requirements: runnable.requirements.clone(),
        })
    }
}

/// Native status of a backend resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Native phase string
    pub phase: Option<String>,
    /// Units currently executing
    pub active: u32,
    /// Success counter
    pub succeeded: u32,
    /// Failure counter
    pub failed: u32,
    /// Native failure reason
    pub reason: Option<String>,
    /// When the resource started
    pub started_at: Option<DateTime<Utc>>,
    /// When the resource finished
    pub completed_at: Option<DateTime<Utc>>,
}

/// A live backend resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResource {
    /// Resource name
    pub name: String,
    /// Backend namespace
    pub namespace: String,
    /// Labels on the resource
    pub labels: BTreeMap<String, String>,
    /// Native status
    pub status: ResourceStatus,
}

impl BackendResource {
    /// Runnable the resource belongs to, if labelled.
    pub fn runnable_id(&self) -> Option<&str> {
        self.labels.get(LABEL_RUNNABLE_ID).map(String::as_str)
    }
}

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceEventKind {
    /// Resource created
    Added,
    /// Resource status changed
    Modified,
    /// Resource removed
    Deleted,
}

/// Push notification from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEvent {
    /// What happened
    pub kind: ResourceEventKind,
    /// Resource name
    pub name: String,
    /// Backend namespace
    pub namespace: String,
    /// Labels on the resource
    pub labels: BTreeMap<String, String>,
}

impl ResourceEvent {
    /// Build an event for a resource.
    pub fn new(kind: ResourceEventKind, resource: &BackendResource) -> Self {
        Self {
            kind,
            name: resource.name.clone(),
            namespace: resource.namespace.clone(),
            labels: resource.labels.clone(),
        }
    }

    /// Runnable the event refers to, if labelled.
    pub fn runnable_id(&self) -> Option<&str> {
        self.labels.get(LABEL_RUNNABLE_ID).map(String::as_str)
    }
}

/// Namespace and label scope of a watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    /// Only events in this namespace (any namespace when `None`)
    pub namespace: Option<String>,
    /// All of these labels must be present with equal values
    pub labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector for one namespace.
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            labels: BTreeMap::new(),
        }
    }

    /// Require a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether an event is in scope.
    pub fn matches(&self, event: &ResourceEvent) -> bool {
        if let Some(namespace) = &self.namespace
            && namespace != &event.namespace
        {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| event.labels.get(k) == Some(v))
    }
}

/// Adapter between runnables and one execution backend.
#[async_trait]
pub trait Framework: Send + Sync {
    /// Runnable type tag served by this framework (e.g. "process", "mock").
    fn kind(&self) -> &str;

    /// Translate a runnable into a backend spec. Pure, no I/O.
    fn build(&self, runnable: &Runnable) -> Result<BackendSpec>;

    /// Create the resource. Creating an existing live resource returns it.
    async fn create_resource(&self, spec: &BackendSpec) -> Result<BackendResource>;

    /// Read the live resource, `None` when absent.
    async fn get_resource(&self, spec: &BackendSpec) -> Result<Option<BackendResource>>;

    /// Ask the resource to stop.
    async fn stop_resource(&self, resource: &BackendResource) -> Result<()>;

    /// Remove the resource.
    async fn delete_resource(&self, resource: &BackendResource) -> Result<()>;

    /// Execution units of the resource.
    async fn pods(&self, resource: &BackendResource) -> Result<Vec<PodInfo>>;

    /// Logs of the resource's units.
    async fn logs(&self, resource: &BackendResource) -> Result<Vec<LogRecord>>;

    /// Resource usage of the resource's units.
    async fn metrics(&self, resource: &BackendResource) -> Result<Vec<MetricsRecord>>;

    /// Structured results written by the workload.
    async fn results(&self, resource: &BackendResource) -> Result<Map<String, Value>> {
        let _ = resource;
        Ok(Map::new())
    }

    /// Stream of resource change notifications, if the backend pushes them.
    fn subscribe(&self) -> Option<broadcast::Receiver<ResourceEvent>> {
        None
    }

    /// Create the backend resource and mark the runnable RUNNING.
    async fn run(&self, mut runnable: Runnable) -> Result<Runnable> {
        let spec = self.build(&runnable)?;
        let resource = self.create_resource(&spec).await?;

        runnable.state = State::Running;
        runnable.error = None;
        runnable.message = Some(format!("Resource {} created", resource.name));
        Ok(runnable)
    }

    /// Stop the backend resource and mark the runnable STOPPED.
    ///
    /// A missing resource counts as stopped.
    async fn stop(&self, mut runnable: Runnable) -> Result<Runnable> {
        let spec = self.build(&runnable)?;
        if let Some(resource) = self.get_resource(&spec).await? {
            self.stop_resource(&resource).await?;
        }

        runnable.state = State::Stopped;
        runnable.message = Some(format!("Resource {} stopped", spec.name));
        Ok(runnable)
    }

    /// Delete the backend resource and mark the runnable DELETED.
    ///
    /// A missing resource counts as deleted.
    async fn delete(&self, mut runnable: Runnable) -> Result<Runnable> {
        let spec = self.build(&runnable)?;
        if let Some(resource) = self.get_resource(&spec).await? {
            self.delete_resource(&resource).await?;
        }

        runnable.state = State::Deleted;
        runnable.message = Some(format!("Resource {} deleted", spec.name));
        Ok(runnable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_name_is_deterministic() {
        let a = resource_name("run-1");
        assert_eq!(a, resource_name("run-1"));
        assert_ne!(a, resource_name("run-2"));
        assert!(a.starts_with("rp-"));
        assert_eq!(a.len(), 3 + 16);
    }

    #[test]
    fn test_spec_carries_identity_labels() {
        let mut runnable = Runnable::new("run-1", "demo", "container", "job", "mock");
        runnable.labels.insert("team".into(), "ml".into());
        runnable.parallelism = 0;

        let spec = BackendSpec::from_runnable(&runnable, "default").unwrap();

        assert_eq!(spec.labels[LABEL_RUNNABLE_ID], "run-1");
        assert_eq!(spec.labels[LABEL_TASK], "job");
        assert_eq!(spec.labels["team"], "ml");
        assert_eq!(spec.parallelism, 1);
    }

    #[test]
    fn test_spec_rejects_empty_id() {
        let runnable = Runnable::new("", "demo", "container", "job", "mock");
        assert!(matches!(
            BackendSpec::from_runnable(&runnable, "default"),
            Err(BackendError::InvalidResource(_))
        ));
    }

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_RUNTIME.to_string(), "container".to_string());
        let event = ResourceEvent {
            kind: ResourceEventKind::Modified,
            name: "rp-1".into(),
            namespace: "default".into(),
            labels,
        };

        assert!(LabelSelector::default().matches(&event));
        assert!(LabelSelector::namespace("default").matches(&event));
        assert!(!LabelSelector::namespace("other").matches(&event));
        assert!(
            LabelSelector::namespace("default")
                .with_label(LABEL_RUNTIME, "container")
                .matches(&event)
        );
        assert!(
            !LabelSelector::default()
                .with_label(LABEL_RUNTIME, "batch")
                .matches(&event)
        );
    }
}
