// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runs and the read-only entities they reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::state::State;

/// Partial run status returned by runtime callbacks, merged into [`RunStatus::extra`].
pub type StatusFragment = Map<String, Value>;

/// Parsed task reference: `<runtime>+<task>://<project>/<function>[:<version>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    /// Runtime kind
    pub runtime: String,
    /// Task kind within the runtime
    pub task: String,
    /// Project of the executable
    pub project: String,
    /// Executable name
    pub function: String,
    /// Executable version
    pub version: Option<String>,
}

impl TaskRef {
    /// Parse a task reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("invalid task reference '{}'", reference));

        let (scheme, rest) = reference.split_once("://").ok_or_else(invalid)?;
        let (runtime, task) = scheme.split_once('+').ok_or_else(invalid)?;
        let (project, function) = rest.split_once('/').ok_or_else(invalid)?;
        let (function, version) = match function.split_once(':') {
            Some((f, v)) => (f, Some(v.to_string())),
            None => (function, None),
        };

        if runtime.is_empty() || task.is_empty() || project.is_empty() || function.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            runtime: runtime.to_string(),
            task: task.to_string(),
            project: project.to_string(),
            function: function.to_string(),
            version,
        })
    }
}

/// Kind-specific configuration of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    /// Task reference (see [`TaskRef`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    /// Kind-specific parameters
    #[serde(default, flatten)]
    pub parameters: Map<String, Value>,
}

/// Coarse status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Current lifecycle state
    pub state: State,
    /// Informational message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Diagnostic string when in ERROR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last status change
    pub updated: DateTime<Utc>,
    /// Fields contributed by runtime callbacks
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            state: State::Ready,
            message: None,
            error: None,
            updated: Utc::now(),
            extra: Map::new(),
        }
    }
}

impl RunStatus {
    /// Merge a callback fragment; `null` values remove keys.
    pub fn merge(&mut self, fragment: StatusFragment) {
        for (key, value) in fragment {
            if value.is_null() {
                self.extra.remove(&key);
            } else {
                self.extra.insert(key, value);
            }
        }
    }
}

/// A submitted job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run ID
    pub id: String,
    /// Owning project
    pub project: String,
    /// Kind; selects the runtime
    pub kind: String,
    /// Submitting user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Configuration
    #[serde(default)]
    pub spec: RunSpec,
    /// Status (mutated only by the lifecycle manager)
    #[serde(default)]
    pub status: RunStatus,
}

impl Run {
    /// Create a new run in state READY.
    pub fn new(id: impl Into<String>, project: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project: project.into(),
            kind: kind.into(),
            user: None,
            spec: RunSpec::default(),
            status: RunStatus::default(),
        }
    }

    /// Set the task reference.
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.spec.task = Some(task.into());
        self
    }

    /// Set a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.spec.parameters.insert(key.into(), value);
        self
    }

    /// Parse the task reference, failing when it is missing.
    pub fn task_ref(&self) -> Result<TaskRef> {
        let reference = self.spec.task.as_deref().ok_or_else(|| {
            Error::InvalidArgument(format!("run '{}' has no task reference", self.id))
        })?;
        TaskRef::parse(reference)
    }
}

/// Task definition referenced by a run. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task ID
    pub id: String,
    /// Task kind (e.g. "container+job")
    pub kind: String,
    /// Owning project
    pub project: String,
    /// Task configuration
    #[serde(default)]
    pub spec: Map<String, Value>,
}

/// Function or workflow definition referenced by a run. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Executable {
    /// Executable ID
    pub id: String,
    /// Executable kind (matches the runtime kind)
    pub kind: String,
    /// Owning project
    pub project: String,
    /// Executable configuration
    #[serde(default)]
    pub spec: Map<String, Value>,
}
