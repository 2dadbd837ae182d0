// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for runplane-engine.

use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (`sqlite:` or `postgres:` scheme)
    pub database_url: String,
    /// Working area for the process backend (logs, results)
    pub data_dir: PathBuf,
    /// Namespace watched and populated by the backend
    pub namespace: String,
    /// Delay between monitor polling cycles
    pub monitor_delay: Duration,
    /// Maximum number of listener operations in flight per runnable type
    pub listener_concurrency: usize,
    /// Capacity of the runnable change event bus
    pub event_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNPLANE_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("RUNPLANE_DATABASE_URL"))?;

        let data_dir =
            PathBuf::from(std::env::var("RUNPLANE_DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let namespace =
            std::env::var("RUNPLANE_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let monitor_delay = Duration::from_secs(parse_var("RUNPLANE_MONITOR_DELAY_SECS", 60)?);

        let listener_concurrency = parse_var("RUNPLANE_LISTENER_CONCURRENCY", 8)? as usize;
        if listener_concurrency == 0 {
            return Err(ConfigError::InvalidValue("RUNPLANE_LISTENER_CONCURRENCY"));
        }

        let event_capacity = parse_var("RUNPLANE_EVENT_CAPACITY", 1024)? as usize;

        Ok(Self {
            database_url,
            data_dir,
            namespace,
            monitor_delay,
            listener_concurrency,
            event_capacity,
        })
    }
}

fn parse_var(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue(var)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
