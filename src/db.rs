//! Postgres 存储后端的连接与维护
//! 建立连接池、应用 kv_entries 表结构，并为就绪探针统计表状态

use crate::config::DatabaseConfig;
use secrecy::ExposeSecret;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};

/// 建立连接池并应用迁移，返回可直接交给 `PgStore` 的连接池
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .connect(config.url.expose_secret())
        .await
        .map_err(DbError::Connect)?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Security state pool connected"
    );

    run_migrations(&pool).await?;
    Ok(pool)
}

/// 应用 kv_entries 表结构
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(DbError::Migrate)?;

    tracing::info!("kv_entries schema up to date");
    Ok(())
}

/// kv_entries 表的当前状态
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    /// 未过期的条目数
    pub live_entries: i64,
    /// 已过期但尚未被清理任务删除的条目数
    pub expired_backlog: i64,
    pub latency_ms: u64,
}

impl StoreSnapshot {
    /// 过期积压超过存活条目时，说明清理任务跟不上
    pub fn sweep_lagging(&self) -> bool {
        self.expired_backlog > 0 && self.expired_backlog > self.live_entries
    }

    pub fn summary(&self) -> String {
        format!(
            "{} live, {} expired awaiting sweep, {}ms",
            self.live_entries, self.expired_backlog, self.latency_ms
        )
    }
}

/// 统计 kv_entries 的存活与积压条目，同时验证表可读
pub async fn inspect(pool: &PgPool) -> Result<StoreSnapshot, DbError> {
    let started = Instant::now();
    let (live_entries, expired_backlog): (i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE expires_at IS NULL OR expires_at > NOW()),
            COUNT(*) FILTER (WHERE expires_at <= NOW())
        FROM kv_entries
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(DbError::Inspect)?;

    let snapshot = StoreSnapshot {
        live_entries,
        expired_backlog,
        latency_ms: started.elapsed().as_millis() as u64,
    };

    if snapshot.sweep_lagging() {
        tracing::warn!(
            live = snapshot.live_entries,
            expired = snapshot.expired_backlog,
            "Expired security state is piling up"
        );
    }
    Ok(snapshot)
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("kv_entries migration failed: {0}")]
    Migrate(#[source] sqlx::migrate::MigrateError),

    #[error("kv_entries inspection failed: {0}")]
    Inspect(#[source] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(live: i64, expired: i64) -> StoreSnapshot {
        StoreSnapshot {
            live_entries: live,
            expired_backlog: expired,
            latency_ms: 3,
        }
    }

    #[test]
    fn test_sweep_lagging() {
        assert!(!snapshot_with(0, 0).sweep_lagging());
        assert!(!snapshot_with(10, 4).sweep_lagging());
        assert!(snapshot_with(2, 9).sweep_lagging());
        assert_eq!(
            snapshot_with(10, 4).summary(),
            "10 live, 4 expired awaiting sweep, 3ms"
        );
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL"]
    async fn test_inspect_counts_live_and_expired_entries() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
        let pool = PgPool::connect(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let before = inspect(&pool).await.unwrap();
        let key = format!("readiness-test:{}", uuid::Uuid::new_v4());
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, '{}'::jsonb, NOW() - INTERVAL '1 minute')",
        )
        .bind(&key)
        .execute(&pool)
        .await
        .unwrap();

        let after = inspect(&pool).await.unwrap();
        assert_eq!(after.expired_backlog, before.expired_backlog + 1);

        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(&key)
            .execute(&pool)
            .await
            .unwrap();
    }
}
