// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed runnable records.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{RecordRepository, RunnableRecord};
use crate::error::Result;

/// PostgreSQL-backed record repository.
#[derive(Clone)]
pub struct PostgresRecordRepository {
    pool: PgPool,
}

impl PostgresRecordRepository {
    /// Create a repository from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordRepository for PostgresRecordRepository {
    async fn find(&self, kind: &str, id: &str) -> Result<Option<RunnableRecord>> {
        let record = sqlx::query_as::<_, RunnableRecord>(
            r#"
            SELECT id, kind, owner, created, updated, payload
            FROM runnables
            WHERE id = $1 AND kind = $2
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
            WHERE kind = $1
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
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id, kind) DO UPDATE SET
                owner = EXCLUDED.owner,
                updated = EXCLUDED.updated,
                payload = EXCLUDED.payload
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
        let result = sqlx::query("DELETE FROM runnables WHERE id = $1 AND kind = $2")
            .bind(id)
            .bind(kind)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
