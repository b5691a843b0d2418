use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::config::{validate_identifier, PersistenceConfig};
use crate::message::MessageId;
use crate::store::{
    Eligibility, NewMessage, PartitionFilter, QueueSnapshot, QueueStore, StoredMessage,
};

/// Open a connection pool.
pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(
            config.acquire_timeout_seconds,
        ))
        .connect(&config.connection_string)
        .await?;
    Ok(pool)
}

/// Create the message table (under a custom name) and the lock table if
/// missing. `migrations/` holds the same schema for the default names.
pub async fn ensure_schema(pool: &PgPool, table_name: &str) -> anyhow::Result<()> {
    validate_identifier(table_name)?;
    let statements = [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table_name} (
                id BIGSERIAL PRIMARY KEY,
                body TEXT NOT NULL,
                headers TEXT NOT NULL,
                queue_name VARCHAR(190) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                available_at TIMESTAMPTZ NOT NULL,
                delivered_at TIMESTAMPTZ NULL
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table_name}_claim_idx \
             ON {table_name} (queue_name, created_at, id)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table_name}_eligible_idx \
             ON {table_name} (available_at, delivered_at)"
        ),
        r#"
        CREATE TABLE IF NOT EXISTS lanes_locks (
            key VARCHAR(255) PRIMARY KEY,
            owner UUID NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#
        .to_string(),
    ];
    for statement in statements {
        sqlx::query(&statement).execute(pool).await?;
    }
    Ok(())
}

/// PostgreSQL-backed message store.
///
/// Claims run in a transaction that selects the oldest eligible row with
/// `FOR UPDATE SKIP LOCKED` and stamps `delivered_at` before committing.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
    table: String,
}

impl PostgresQueueStore {
    /// The table name is interpolated into SQL and must be a plain identifier.
    pub fn new(pool: PgPool, table_name: &str) -> anyhow::Result<Self> {
        validate_identifier(table_name)?;
        Ok(Self {
            pool,
            table: table_name.to_string(),
        })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn insert(&self, message: NewMessage) -> anyhow::Result<MessageId> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {} (body, headers, queue_name, created_at, available_at, delivered_at)
            VALUES ($1, $2, $3, $4, $5, NULL)
            RETURNING id
            "#,
            self.table
        ))
        .bind(&message.body)
        .bind(&message.headers)
        .bind(&message.queue_name)
        .bind(message.created_at)
        .bind(message.available_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(row.try_get("id")?))
    }

    async fn pending_partitions(
        &self,
        filter: &PartitionFilter,
        eligibility: &Eligibility,
    ) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT queue_name
            FROM {}
            WHERE available_at <= $1
              AND (delivered_at IS NULL OR delivered_at < $2)
              AND (left(queue_name, length($3)) = $3 OR queue_name = ANY($4))
            ORDER BY queue_name
            "#,
            self.table
        ))
        .bind(eligibility.now)
        .bind(eligibility.stale_before)
        .bind(&filter.prefix)
        .bind(&filter.names)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("queue_name").map_err(Into::into))
            .collect()
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        eligibility: &Eligibility,
    ) -> anyhow::Result<Option<StoredMessage>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT id, body, headers, queue_name, created_at, available_at, delivered_at
            FROM {}
            WHERE queue_name = $1
              AND available_at <= $2
              AND (delivered_at IS NULL OR delivered_at < $3)
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            self.table
        ))
        .bind(queue_name)
        .bind(eligibility.now)
        .bind(eligibility.stale_before)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let message = StoredMessage {
            id: MessageId(row.try_get("id")?),
            body: row.try_get("body")?,
            headers: row.try_get("headers")?,
            queue_name: row.try_get("queue_name")?,
            created_at: row.try_get("created_at")?,
            available_at: row.try_get("available_at")?,
            delivered_at: row.try_get("delivered_at")?,
        };

        sqlx::query(&format!(
            "UPDATE {} SET delivered_at = $1 WHERE id = $2",
            self.table
        ))
        .bind(eligibility.now)
        .bind(message.id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(message_id = %message.id, queue_name = %queue_name, "row claimed");
        Ok(Some(message))
    }

    async fn touch(&self, id: MessageId, at: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET delivered_at = $1 WHERE id = $2 AND delivered_at IS NOT NULL",
            self.table
        ))
        .bind(at)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: MessageId) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn relocate(&self, id: MessageId, queue_name: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET queue_name = $1, delivered_at = NULL WHERE id = $2",
            self.table
        ))
        .bind(queue_name)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let now = Utc::now();
        let rows = sqlx::query(&format!(
            r#"
            SELECT queue_name,
                   COUNT(*) FILTER (WHERE delivered_at IS NULL AND available_at <= $1) AS ready,
                   COUNT(*) FILTER (WHERE delivered_at IS NOT NULL) AS delivered,
                   COUNT(*) FILTER (WHERE delivered_at IS NULL AND available_at > $1) AS delayed,
                   COUNT(*) AS total
            FROM {}
            GROUP BY queue_name
            "#,
            self.table
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot::new(now);
        for row in rows {
            let queue_name: String = row.try_get("queue_name")?;
            let entry = snapshot.entry_mut(&queue_name);
            entry.ready_count = row.try_get::<i64, _>("ready")? as usize;
            entry.delivered_count = row.try_get::<i64, _>("delivered")? as usize;
            entry.delayed_count = row.try_get::<i64, _>("delayed")? as usize;
            entry.total_count = row.try_get::<i64, _>("total")? as usize;
        }
        Ok(snapshot)
    }
}
