// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed runnable records.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{RecordRepository, RunnableRecord};
use crate::error::{Error, Result};

/// SQLite-backed record repository.
#[derive(Clone)]
pub struct SqliteRecordRepository {
    pool: SqlitePool,
}

impl SqliteRecordRepository {
    /// Create a repository from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let repo = SqliteRecordRepository::from_path(".data/runplane.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Other(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl RecordRepository for SqliteRecordRepository {
    async fn find(&self, kind: &str, id: &str) -> Result<Option<RunnableRecord>> {
        let record = sqlx::query_as::<_, RunnableRecord>(
            r#"
            SELECT id, kind, owner, created, updated, payload
            FROM runnables
            WHERE id = ? AND kind = ?
            "#,
        )
        .bind(id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list(&self, kind: &str) -> Result<Vec<RunnableRecord>> {
        let records = sqlx::query_as::<_, RunnableRecord>(
            r#"
            SELECT id, kind, owner, created, updated, payload
            FROM runnables
            WHERE kind = ?
            ORDER BY created ASC
            "#,
        )
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn upsert(&self, record: &RunnableRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runnables (id, kind, owner, created, updated, payload)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id, kind) DO UPDATE SET
                owner = excluded.owner,
                updated = excluded.updated,
                payload = excluded.payload
            "#,
        )
        .bind(&record.id)
        .bind(&record.kind)
        .bind(&record.owner)
        .bind(record.created)
        .bind(record.updated)
        .bind(&record.payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM runnables WHERE id = ? AND kind = ?")
            .bind(id)
            .bind(kind)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
