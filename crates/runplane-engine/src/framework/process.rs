// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local process backend.
//!
//! Executes a [`BackendSpec`] as plain OS processes, one per unit of
//! `parallelism`. Each resource gets a working directory under the data dir:
//!
//! ```text
//! {data_dir}/{namespace}/{resource_name}/
//!   ├── {unit}.stdout.log
//!   ├── {unit}.stderr.log
//!   └── results.json        (written by the workload, optional)
//! ```
//!
//! Native counters follow job semantics: `active` counts running units,
//! `failed` counts units that exited unsuccessfully, and `succeeded` is only
//! reported once every unit has exited cleanly.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{Map, Value};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use super::*;
use crate::runnable::{LogRecord, MetricsRecord, PodInfo, Runnable};

/// Environment variable carrying the runnable ID into the workload.
pub const ENV_RUNNABLE_ID: &str = "RUNPLANE_RUNNABLE_ID";
/// Environment variable carrying the path the workload may write results to.
pub const ENV_RESULTS_PATH: &str = "RUNPLANE_RESULTS_PATH";
/// Environment variable carrying the unit index.
pub const ENV_UNIT_INDEX: &str = "RUNPLANE_UNIT_INDEX";

const RESULTS_FILE: &str = "results.json";

/// Process framework configuration.
#[derive(Debug, Clone)]
pub struct ProcessFrameworkConfig {
    /// Root of the per-resource working directories
    pub data_dir: PathBuf,
    /// Namespace resources are created in
    pub namespace: String,
    /// Capacity of the resource event channel
    pub event_capacity: usize,
    /// Only the last this-many bytes of each log are returned
    pub max_log_bytes: usize,
}

impl ProcessFrameworkConfig {
    /// Configuration with defaults for everything but the data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            namespace: "default".to_string(),
            event_capacity: 1024,
            max_log_bytes: 64 * 1024,
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

#[derive(Debug)]
struct Unit {
    name: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    running: bool,
    exit_code: Option<i32>,
    signal: Option<i32>,
}

impl Unit {
    fn succeeded(&self) -> bool {
        !self.running && self.exit_code == Some(0)
    }

    fn failed(&self) -> bool {
        !self.running && self.exit_code != Some(0)
    }

    fn phase(&self) -> &'static str {
        if self.running {
            "Running"
        } else if self.succeeded() {
            "Succeeded"
        } else {
            "Failed"
        }
    }

    fn failure_reason(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("unit {} exited with code {}", self.name, code),
            (None, Some(sig)) => format!("unit {} was killed by signal {}", self.name, sig),
            (None, None) => format!("unit {} exited abnormally", self.name),
        }
    }
}

#[derive(Debug)]
struct ProcessResource {
    generation: u64,
    namespace: String,
    labels: BTreeMap<String, String>,
    run_dir: PathBuf,
    units: Vec<Unit>,
    stopped: bool,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl ProcessResource {
    fn is_active(&self) -> bool {
        self.units.iter().any(|u| u.running)
    }

    fn status(&self) -> ResourceStatus {
        let active = self.units.iter().filter(|u| u.running).count() as u32;

        if self.stopped {
            return ResourceStatus {
                phase: Some("Stopped".to_string()),
                active,
                succeeded: 0,
                failed: 0,
                reason: Some("Stopped".to_string()),
                started_at: Some(self.started_at),
                completed_at: self.completed_at,
            };
        }

        let failed = self.units.iter().filter(|u| u.failed()).count() as u32;
        let succeeded = if active == 0 && failed == 0 {
            self.units.iter().filter(|u| u.succeeded()).count() as u32
        } else {
            0
        };
        let phase = if failed > 0 {
            "Failed"
        } else if active > 0 {
            "Running"
        } else {
            "Succeeded"
        };

        ResourceStatus {
            phase: Some(phase.to_string()),
            active,
            succeeded,
            failed,
            reason: self
                .units
                .iter()
                .find(|u| u.failed())
                .map(Unit::failure_reason),
            started_at: Some(self.started_at),
            completed_at: self.completed_at,
        }
    }

    fn snapshot(&self, name: &str) -> BackendResource {
        BackendResource {
            name: name.to_string(),
            namespace: self.namespace.clone(),
            labels: self.labels.clone(),
            status: self.status(),
        }
    }

    /// Send SIGTERM to every running unit.
    fn terminate(&self) -> Result<()> {
        for unit in self.units.iter().filter(|u| u.running) {
            let Some(pid) = unit.pid else { continue };
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(BackendError::Operation(format!(
                        "Failed to signal unit {} (pid {}): {}",
                        unit.name, pid, e
                    )));
                }
            }
        }
        Ok(())
    }
}

type ResourceTable = Arc<Mutex<HashMap<String, ProcessResource>>>;

/// Framework running workloads as local processes.
pub struct ProcessFramework {
    config: ProcessFrameworkConfig,
    resources: ResourceTable,
    events: broadcast::Sender<ResourceEvent>,
    generation: AtomicU64,
}

impl ProcessFramework {
    /// Create a process framework.
    pub fn new(config: ProcessFrameworkConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            resources: Arc::new(Mutex::new(HashMap::new())),
            events,
            generation: AtomicU64::new(0),
        }
    }

    /// Data directory root.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn run_dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.config.data_dir.join(namespace).join(name)
    }

    fn emit(&self, kind: ResourceEventKind, resource: &BackendResource) {
        let _ = self.events.send(ResourceEvent::new(kind, resource));
    }

    /// Wait for a unit to exit and record its outcome.
    fn watch_unit(&self, name: String, generation: u64, index: usize, mut child: Child) {
        let resources = self.resources.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let status = child.wait().await;

            let snapshot = {
                let mut resources = resources.lock().await;
                let Some(resource) = resources.get_mut(&name) else {
                    return;
                };
                if resource.generation != generation {
                    return;
                }
                let Some(unit) = resource.units.get_mut(index) else {
                    return;
                };

                unit.running = false;
                match status {
                    Ok(status) => {
                        unit.exit_code = status.code();
                        unit.signal = status.signal();
                    }
                    Err(e) => {
                        warn!(unit = %unit.name, error = %e, "Failed to wait for unit");
                    }
                }
                debug!(
                    unit = %unit.name,
                    exit_code = ?unit.exit_code,
                    signal = ?unit.signal,
                    "Unit exited"
                );

                if !resource.is_active() {
                    resource.completed_at = Some(Utc::now());
                }
                resource.snapshot(&name)
            };

            let _ = events.send(ResourceEvent::new(ResourceEventKind::Modified, &snapshot));
        });
    }
}

#[async_trait]
impl Framework for ProcessFramework {
    fn kind(&self) -> &str {
        "process"
    }

    fn build(&self, runnable: &Runnable) -> Result<BackendSpec> {
        BackendSpec::from_runnable(runnable, &self.config.namespace)
    }

    async fn create_resource(&self, spec: &BackendSpec) -> Result<BackendResource> {
        let command = spec.command.clone().ok_or_else(|| {
            BackendError::InvalidResource(format!("resource {} has no command", spec.name))
        })?;

        let mut resources = self.resources.lock().await;
        if let Some(existing) = resources.get(&spec.name)
            && existing.is_active()
        {
            debug!(resource = %spec.name, "Resource already running");
            return Ok(existing.snapshot(&spec.name));
        }

        let run_dir = self.run_dir(&spec.namespace, &spec.name);
        tokio::fs::create_dir_all(&run_dir).await?;
        let results_path = run_dir.join(RESULTS_FILE);
        match tokio::fs::remove_file(&results_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let mut units = Vec::new();
        let mut children: Vec<Child> = Vec::new();

        for index in 0..spec.parallelism.max(1) {
            let unit_name = format!("{}-{}", spec.name, index);
            let stdout = std::fs::File::create(run_dir.join(format!("{}.stdout.log", unit_name)))?;
            let stderr = std::fs::File::create(run_dir.join(format!("{}.stderr.log", unit_name)))?;

            let mut cmd = Command::new(&command);
            cmd.args(&spec.args)
                .envs(&spec.requirements.env)
                .env(ENV_RUNNABLE_ID, &spec.runnable_id)
                .env(ENV_RESULTS_PATH, &results_path)
                .env(ENV_UNIT_INDEX, index.to_string())
                .current_dir(&run_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr));

            let child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    for child in children.iter_mut() {
                        let _ = child.start_kill();
                    }
                    return Err(BackendError::Operation(format!(
                        "Failed to start '{}' for {}: {}",
                        command, spec.name, e
                    )));
                }
            };

            units.push(Unit {
                name: unit_name,
                pid: child.id(),
                started_at: now,
                running: true,
                exit_code: None,
                signal: None,
            });
            children.push(child);
        }

        let resource = ProcessResource {
            generation,
            namespace: spec.namespace.clone(),
            labels: spec.labels.clone(),
            run_dir,
            units,
            stopped: false,
            started_at: now,
            completed_at: None,
        };
        let snapshot = resource.snapshot(&spec.name);
        resources.insert(spec.name.clone(), resource);
        drop(resources);

        for (index, child) in children.into_iter().enumerate() {
            self.watch_unit(spec.name.clone(), generation, index, child);
        }

        info!(
            resource = %spec.name,
            runnable_id = %spec.runnable_id,
            units = spec.parallelism.max(1),
            "Process resource created"
        );
        self.emit(ResourceEventKind::Added, &snapshot);
        Ok(snapshot)
    }

    async fn get_resource(&self, spec: &BackendSpec) -> Result<Option<BackendResource>> {
        let resources = self.resources.lock().await;
        Ok(resources
            .get(&spec.name)
            .filter(|r| r.namespace == spec.namespace)
            .map(|r| r.snapshot(&spec.name)))
    }

    async fn stop_resource(&self, resource: &BackendResource) -> Result<()> {
        let snapshot = {
            let mut resources = self.resources.lock().await;
            let Some(entry) = resources.get_mut(&resource.name) else {
                return Ok(());
            };
            entry.stopped = true;
            entry.terminate()?;
            entry.snapshot(&resource.name)
        };

        info!(resource = %resource.name, "Process resource stopped");
        self.emit(ResourceEventKind::Modified, &snapshot);
        Ok(())
    }

    async fn delete_resource(&self, resource: &BackendResource) -> Result<()> {
        let removed = {
            let mut resources = self.resources.lock().await;
            if let Some(entry) = resources.get(&resource.name) {
                entry.terminate()?;
            }
            resources.remove(&resource.name)
        };

        let Some(entry) = removed else {
            return Ok(());
        };

        match tokio::fs::remove_dir_all(&entry.run_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    resource = %resource.name,
                    path = %entry.run_dir.display(),
                    error = %e,
                    "Failed to remove run directory"
                );
            }
        }

        info!(resource = %resource.name, "Process resource deleted");
        self.emit(ResourceEventKind::Deleted, &entry.snapshot(&resource.name));
        Ok(())
    }

    async fn pods(&self, resource: &BackendResource) -> Result<Vec<PodInfo>> {
        let resources = self.resources.lock().await;
        let Some(entry) = resources.get(&resource.name) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .units
            .iter()
            .map(|u| PodInfo {
                name: u.name.clone(),
                phase: u.phase().to_string(),
                exit_code: u.exit_code,
                started_at: Some(u.started_at),
            })
            .collect())
    }

    async fn logs(&self, resource: &BackendResource) -> Result<Vec<LogRecord>> {
        let (run_dir, unit_names) = {
            let resources = self.resources.lock().await;
            let Some(entry) = resources.get(&resource.name) else {
                return Ok(Vec::new());
            };
            let names: Vec<String> = entry.units.iter().map(|u| u.name.clone()).collect();
            (entry.run_dir.clone(), names)
        };

        let mut logs = Vec::new();
        for unit in unit_names {
            for stream in ["stdout", "stderr"] {
                let path = run_dir.join(format!("{}.{}.log", unit, stream));
                let bytes = match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                logs.push(LogRecord {
                    pod: unit.clone(),
                    container: stream.to_string(),
                    content: tail(&bytes, self.config.max_log_bytes),
                });
            }
        }
        Ok(logs)
    }

    async fn metrics(&self, resource: &BackendResource) -> Result<Vec<MetricsRecord>> {
        let running: Vec<(String, u32)> = {
            let resources = self.resources.lock().await;
            let Some(entry) = resources.get(&resource.name) else {
                return Ok(Vec::new());
            };
            entry
                .units
                .iter()
                .filter(|u| u.running)
                .filter_map(|u| u.pid.map(|pid| (u.name.clone(), pid)))
                .collect()
        };

        let mut metrics = Vec::new();
        for (unit, pid) in running {
            // The process may exit between the snapshot and the read.
            let Ok(status) = tokio::fs::read_to_string(format!("/proc/{}/status", pid)).await
            else {
                continue;
            };
            metrics.push(MetricsRecord {
                pod: unit,
                memory_peak_bytes: parse_status_kib(&status, "VmHWM:"),
                memory_current_bytes: parse_status_kib(&status, "VmRSS:"),
                cpu_usage_usec: None,
            });
        }
        Ok(metrics)
    }

    async fn results(&self, resource: &BackendResource) -> Result<Map<String, Value>> {
        let run_dir = {
            let resources = self.resources.lock().await;
            let Some(entry) = resources.get(&resource.name) else {
                return Ok(Map::new());
            };
            entry.run_dir.clone()
        };

        let content = match tokio::fs::read(run_dir.join(RESULTS_FILE)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            other => Err(BackendError::InvalidResource(format!(
                "{} of {} must hold a JSON object, found {}",
                RESULTS_FILE, resource.name, other
            ))),
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ResourceEvent>> {
        Some(self.events.subscribe())
    }
}

/// Parse a `/proc/<pid>/status` line such as `VmRSS:  1234 kB` into bytes.
fn parse_status_kib(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(key))?
        .split_whitespace()
        .nth(1)?
        .parse::<u64>()
        .ok()
        .map(|kib| kib * 1024)
}

/// Last `max` bytes of a log, lossily decoded.
fn tail(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}
