// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runnable: the execution descriptor produced for a run.
//!
//! A runnable carries everything a framework needs to create the backend
//! resource, plus the live state reconciled back from the backend. Its
//! identity (`id`, `runtime`, `task`, `framework`) never changes after
//! creation; only `state`, `error`, `message` and the diagnostics mutate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::State;

/// Compute limits for the workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit (e.g. "500m", "2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory limit (e.g. "512Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// GPU count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
}

/// A volume mounted into the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Mount path inside the workload
    pub mount_path: String,
    /// Volume type (e.g. "empty_dir", "persistent_volume_claim")
    #[serde(default = "default_volume_type")]
    pub volume_type: String,
}

fn default_volume_type() -> String {
    "empty_dir".to_string()
}

/// Resource requirements and placement for a runnable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    /// Compute limits
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Mounted volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Plain environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Names of secrets exposed to the workload
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Node placement constraints
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Status of one backend execution unit (a pod, a process).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    /// Unit name
    pub name: String,
    /// Native phase string (e.g. "Running", "Succeeded", "Failed")
    pub phase: String,
    /// Exit code when finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// When the unit started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Log output of one execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unit the log belongs to
    pub pod: String,
    /// Container or stream name
    pub container: String,
    /// Log content
    pub content: String,
}

/// Resource usage sample of one execution unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// Unit the sample belongs to
    pub pod: String,
    /// Peak memory usage in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak_bytes: Option<u64>,
    /// Current memory usage in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_current_bytes: Option<u64>,
    /// Total CPU time in microseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage_usec: Option<u64>,
}

/// Execution descriptor and live state for one run on one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runnable {
    /// Runnable ID (equal to the run ID)
    pub id: String,
    /// Owning project
    pub project: String,
    /// Submitting user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Runtime kind that produced it
    pub runtime: String,
    /// Task kind it executes
    pub task: String,
    /// Concrete runnable type tag; selects store, listener and framework
    pub framework: String,
    /// Current lifecycle state
    pub state: State,
    /// Error message (set when state is ERROR)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Informational message from the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Container image (backend-specific meaning)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Entry command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Number of parallel execution units
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    /// Resource requirements
    #[serde(default)]
    pub requirements: Requirements,
    /// Extra labels attached to backend resources
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Structured results collected from the backend
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub results: Map<String, Value>,
    /// Execution units observed on the last refresh
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<PodInfo>,
    /// Logs observed on the last refresh
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogRecord>,
    /// Metrics observed on the last refresh
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<MetricsRecord>,
}

fn default_parallelism() -> u32 {
    1
}

impl Runnable {
    /// Create a new runnable in state READY.
    pub fn new(
        id: impl Into<String>,
        project: impl Into<String>,
        runtime: impl Into<String>,
        task: impl Into<String>,
        framework: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            project: project.into(),
            user: None,
            runtime: runtime.into(),
            task: task.into(),
            framework: framework.into(),
            state: State::Ready,
            error: None,
            message: None,
            image: None,
            command: None,
            args: Vec::new(),
            parallelism: 1,
            requirements: Requirements::default(),
            labels: BTreeMap::new(),
            results: Map::new(),
            pods: Vec::new(),
            logs: Vec::new(),
            metrics: Vec::new(),
        }
    }

    /// Move to ERROR with the given message.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.state = State::Error;
        self.message = Some(message.clone());
        self.error = Some(message);
    }

    /// Whether this runnable has the same identity as `other`.
    pub fn same_identity(&self, other: &Runnable) -> bool {
        self.id == other.id
            && self.runtime == other.runtime
            && self.task == other.task
            && self.framework == other.framework
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_runnable_is_ready() {
        let runnable = Runnable::new("run-1", "demo", "container", "job", "process");
        assert_eq!(runnable.state, State::Ready);
        assert_eq!(runnable.parallelism, 1);
        assert!(runnable.error.is_none());
    }

    #[test]
    fn test_fail_sets_error_and_message() {
        let mut runnable = Runnable::new("run-1", "demo", "container", "job", "process");
        runnable.fail("boom");
        assert_eq!(runnable.state, State::Error);
        assert_eq!(runnable.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_payload_defaults_on_deserialize() {
        let json = serde_json::json!({
            "id": "run-1",
            "project": "demo",
            "runtime": "container",
            "task": "job",
            "framework": "process",
            "state": "RUNNING"
        });
        let runnable: Runnable = serde_json::from_value(json).unwrap();
        assert_eq!(runnable.state, State::Running);
        assert_eq!(runnable.parallelism, 1);
        assert!(runnable.logs.is_empty());
    }
}
