use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};

use crate::lock::{LockService, LockToken};

/// Lock service on the `lanes_locks` table. Acquisition is a single
/// upsert that only overwrites an expired row, so it never blocks.
#[derive(Debug, Clone)]
pub struct PostgresLockService {
    pool: PgPool,
}

impl PostgresLockService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockService for PostgresLockService {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LockToken>> {
        let token = LockToken::new(key, ttl);
        let now = Utc::now();
        let acquired = sqlx::query(
            r#"
            INSERT INTO lanes_locks (key, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET owner = EXCLUDED.owner,
                    expires_at = EXCLUDED.expires_at
                WHERE lanes_locks.expires_at <= $4
            RETURNING owner
            "#,
        )
        .bind(key)
        .bind(token.owner.0)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.map(|_| token))
    }

    async fn refresh(&self, token: &LockToken) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE lanes_locks SET expires_at = $1 WHERE key = $2 AND owner = $3",
        )
        .bind(Utc::now() + token.ttl)
        .bind(&token.key)
        .bind(token.owner.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, token: &LockToken) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM lanes_locks WHERE key = $1 AND owner = $2")
            .bind(&token.key)
            .bind(token.owner.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_held(&self, key: &str) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM lanes_locks WHERE key = $1 AND expires_at > $2) AS held",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("held")?)
    }

    async fn force_release(&self, key: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM lanes_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn held_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT key FROM lanes_locks
            WHERE left(key, length($1)) = $1 AND expires_at > $2
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(Into::into))
            .collect()
    }
}
