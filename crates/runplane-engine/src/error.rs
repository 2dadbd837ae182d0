// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runplane-engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend (framework) operation failed.
    #[error("Backend error: {0}")]
    Backend(#[from] crate::framework::BackendError),

    /// No matching entity (runnable, runtime, store entry, run, poller).
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up.
        entity: &'static str,
        /// Identifier that did not match.
        id: String,
    },

    /// The run kind does not match the runtime it was routed to.
    #[error("Unsupported kind: expected '{expected}', got '{actual}'")]
    UnsupportedKind {
        /// Kind the runtime is registered for.
        expected: String,
        /// Kind carried by the run.
        actual: String,
    },

    /// Request validation failed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Two registry entries declared the same kind.
    #[error("Duplicate kind registered: {0}")]
    DuplicateKind(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether this error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type using engine Error.
pub type Result<T> = std::result::Result<T, Error>;
