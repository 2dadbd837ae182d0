// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent runnable store.
//!
//! All runnable types share one logical `runnables` table keyed by
//! `(id, kind)`, where `kind` is the runnable's type tag and `payload` is the
//! opaque JSON-serialized runnable. [`RecordRepository`] is the row-level
//! backend (SQLite or PostgreSQL); [`RunnableStore`] is the typed view for one
//! type tag and serializes concurrent writes to the same id.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresRecordRepository;
pub use self::sqlite::SqliteRecordRepository;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};
use crate::runnable::Runnable;
use crate::state::State;

/// Persisted form of a runnable.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunnableRecord {
    /// Runnable ID (part of the key)
    pub id: String,
    /// Type tag (part of the key)
    pub kind: String,
    /// Owning user
    pub owner: Option<String>,
    /// When the row was first written
    pub created: DateTime<Utc>,
    /// When the row was last written
    pub updated: DateTime<Utc>,
    /// Opaque serialized runnable
    pub payload: Vec<u8>,
}

/// Row-level access to the `runnables` table.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// Fetch one record by key.
    async fn find(&self, kind: &str, id: &str) -> Result<Option<RunnableRecord>>;

    /// List all records of a type tag.
    async fn list(&self, kind: &str) -> Result<Vec<RunnableRecord>>;

    /// Insert or replace a record. `created` is preserved on replace.
    async fn upsert(&self, record: &RunnableRecord) -> Result<()>;

    /// Delete a record. Returns whether a row was removed.
    async fn delete(&self, kind: &str, id: &str) -> Result<bool>;
}

/// Per-key async mutexes. No cross-key locking.
#[derive(Default)]
struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Above this many idle entries the lock table is pruned.
const LOCK_TABLE_PRUNE_THRESHOLD: usize = 1024;

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if locks.len() > LOCK_TABLE_PRUNE_THRESHOLD {
                locks.retain(|_, m| Arc::strong_count(m) > 1);
            }
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

/// Typed store for one runnable type tag.
///
/// Cheap to clone; clones share the repository and the row locks.
#[derive(Clone)]
pub struct RunnableStore {
    kind: String,
    repo: Arc<dyn RecordRepository>,
    locks: Arc<KeyedLocks>,
}

impl RunnableStore {
    /// Create a store for `kind` over the given repository.
    pub fn new(kind: impl Into<String>, repo: Arc<dyn RecordRepository>) -> Self {
        Self {
            kind: kind.into(),
            repo,
            locks: Arc::new(KeyedLocks::default()),
        }
    }

    /// Type tag served by this store.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Persist a runnable under `id`.
    pub async fn store(&self, id: &str, runnable: &Runnable) -> Result<()> {
        self.validate(id, runnable)?;
        let _guard = self.locks.lock(id).await;
        self.write(runnable).await
    }

    /// Look up a runnable by id.
    pub async fn find(&self, id: &str) -> Result<Option<Runnable>> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("runnable id is required".to_string()));
        }
        match self.repo.find(&self.kind, id).await? {
            Some(record) => Ok(Some(decode(&record)?)),
            None => Ok(None),
        }
    }

    /// Remove a runnable. Removing a missing runnable is not an error.
    pub async fn remove(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("runnable id is required".to_string()));
        }
        let _guard = self.locks.lock(id).await;
        let removed = self.repo.delete(&self.kind, id).await?;
        debug!(kind = %self.kind, runnable_id = %id, removed, "Removed runnable");
        Ok(())
    }

    /// Remove a runnable under the row lock if `f` accepts the stored value.
    ///
    /// Returns whether a row was removed. A missing row is left missing.
    pub async fn remove_if<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&Runnable) -> bool + Send,
    {
        if id.is_empty() {
            return Err(Error::InvalidArgument("runnable id is required".to_string()));
        }
        let _guard = self.locks.lock(id).await;

        let Some(current) = self.find(id).await? else {
            return Ok(false);
        };
        if !f(&current) {
            return Ok(false);
        }
        let removed = self.repo.delete(&self.kind, id).await?;
        debug!(kind = %self.kind, runnable_id = %id, removed, "Removed runnable");
        Ok(removed)
    }

    /// List all runnables of this type.
    pub async fn list(&self) -> Result<Vec<Runnable>> {
        self.repo
            .list(&self.kind)
            .await?
            .iter()
            .map(decode)
            .collect()
    }

    /// List runnables currently in `state`.
    pub async fn list_by_state(&self, state: State) -> Result<Vec<Runnable>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.state == state)
            .collect())
    }

    /// Serialized read-modify-write on one row.
    ///
    /// `f` receives the current runnable and returns whether it should be
    /// written back. Returns the written runnable, or `None` when the row is
    /// missing or `f` declined.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Option<Runnable>>
    where
        F: FnOnce(&mut Runnable) -> bool + Send,
    {
        if id.is_empty() {
            return Err(Error::InvalidArgument("runnable id is required".to_string()));
        }
        let _guard = self.locks.lock(id).await;

        let Some(mut current) = self.find(id).await? else {
            return Ok(None);
        };
        if !f(&mut current) {
            return Ok(None);
        }
        self.write(&current).await?;
        Ok(Some(current))
    }

    /// Persist a pending request, rejecting moves the lifecycle forbids.
    ///
    /// New runnables are inserted as-is. For existing ones the identity must
    /// match and the stored state must be allowed to move to the requested one.
    pub async fn request(&self, runnable: &Runnable) -> Result<()> {
        self.validate(&runnable.id, runnable)?;
        let _guard = self.locks.lock(&runnable.id).await;

        if let Some(current) = self.find(&runnable.id).await? {
            if !current.same_identity(runnable) {
                return Err(Error::InvalidArgument(format!(
                    "runnable '{}' identity mismatch ({}+{} vs {}+{})",
                    runnable.id, current.runtime, current.task, runnable.runtime, runnable.task
                )));
            }
            if !current.state.can_transition_to(runnable.state) {
                return Err(Error::InvalidArgument(format!(
                    "runnable '{}' cannot move from {} to {}",
                    runnable.id, current.state, runnable.state
                )));
            }
        }

        self.write(runnable).await
    }

    fn validate(&self, id: &str, runnable: &Runnable) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidArgument("runnable id is required".to_string()));
        }
        if runnable.id != id {
            return Err(Error::InvalidArgument(format!(
                "runnable id '{}' does not match key '{}'",
                runnable.id, id
            )));
        }
        if runnable.framework != self.kind {
            return Err(Error::InvalidArgument(format!(
                "runnable '{}' has type '{}', store serves '{}'",
                id, runnable.framework, self.kind
            )));
        }
        Ok(())
    }

    async fn write(&self, runnable: &Runnable) -> Result<()> {
        let now = Utc::now();
        let record = RunnableRecord {
            id: runnable.id.clone(),
            kind: self.kind.clone(),
            owner: runnable.user.clone(),
            created: now,
            updated: now,
            payload: serde_json::to_vec(runnable)?,
        };
        self.repo.upsert(&record).await?;
        debug!(
            kind = %self.kind,
            runnable_id = %runnable.id,
            state = %runnable.state,
            "Stored runnable"
        );
        Ok(())
    }
}

fn decode(record: &RunnableRecord) -> Result<Runnable> {
    Ok(serde_json::from_slice(&record.payload)?)
}
