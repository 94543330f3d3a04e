//! PostgreSQL keyed store
//!
//! Rows live in `kv_entries(key, value jsonb, expires_at)`. Conditional updates
//! lock the row with `SELECT ... FOR UPDATE` and evaluate the predicate inside
//! the same transaction.

use super::{KeyedStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl)
    }
}

#[async_trait]
impl KeyedStore for PgStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let row = sqlx::query(
            "SELECT value FROM kv_entries WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| row.get::<Value, _>("value")))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Self::expiry(ttl))
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM kv_entries WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(key)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn conditional_update(
        &self,
        key: &str,
        predicate: &(dyn for<'v> Fn(&'v Value) -> bool + Send + Sync),
        new_value: Value,
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT value FROM kv_entries
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            FOR UPDATE
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let current: Value = row.get("value");
        if !predicate(&current) {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE kv_entries SET value = $2, updated_at = NOW() WHERE key = $1")
            .bind(key)
            .bind(new_value)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        // LIKE 通配符需要转义
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows = sqlx::query(
            "SELECT key FROM kv_entries WHERE key LIKE $1 AND (expires_at IS NULL OR expires_at > NOW())",
        )
        .bind(pattern)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>("key")).collect())
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= NOW()")
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
