//! SQLite-backed flow store.
//!
//! One row per customer identity with idempotent upsert semantics. Partial
//! updates (`set_status`, `set_step_status`) are single UPDATE statements,
//! so concurrent writers to the same identity serialize at the database and
//! never lose each other's writes.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::warn;

use super::{FlowRecord, FlowStats, FlowStore, NewFlow, StoreError};
use crate::{now_ms, FlowStatus, StepStatusMap};

pub struct SqliteFlowStore {
    pool: SqlitePool,
}

impl SqliteFlowStore {
    /// Convert an sqlx error to a StoreError with retry classification.
    fn sqlx_to_store_error(operation: &str, e: sqlx::Error) -> StoreError {
        let msg = e.to_string();
        if msg.contains("database is locked") || msg.contains("SQLITE_BUSY") {
            return StoreError::retryable(operation, format!("database locked: {msg}"));
        }
        if msg.contains("UNIQUE constraint") || msg.contains("PRIMARY KEY") {
            return StoreError::permanent(operation, format!("constraint violation: {msg}"));
        }
        if msg.contains("connection") || msg.contains("timeout") {
            return StoreError::retryable(operation, format!("connection error: {msg}"));
        }
        StoreError::retryable(operation, msg)
    }

    /// Open a store at `database_url`, e.g. `sqlite:flows.db` or
    /// `sqlite::memory:`. The schema is created idempotently on open.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        // WAL for concurrent readers while a flow task writes.
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database with a shared cache so all pooled connections see
    /// the same data (test utility).
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:?cache=shared").await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkout_flows (
                email TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                step_status TEXT NOT NULL DEFAULT '{}',
                customer_name TEXT,
                customer_phone TEXT NOT NULL,
                client_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkout_flows_status ON checkout_flows(status)")
            .execute(pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkout_flows_phone_created ON checkout_flows(customer_phone, created_at_ms)",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkout_flows_updated_at ON checkout_flows(updated_at_ms)")
            .execute(pool)
            .await?;
        Ok(())
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FlowRecord, StoreError> {
        let status_raw: String = row
            .try_get("status")
            .map_err(|e| Self::sqlx_to_store_error("get", e))?;
        let status = FlowStatus::parse(&status_raw)
            .ok_or_else(|| StoreError::permanent("get", format!("unknown status value: {status_raw}")))?;
        let step_raw: String = row
            .try_get("step_status")
            .map_err(|e| Self::sqlx_to_store_error("get", e))?;
        let step_status: StepStatusMap = serde_json::from_str(&step_raw)
            .map_err(|e| StoreError::permanent("get", format!("corrupt step_status: {e}")))?;
        Ok(FlowRecord {
            email: row.try_get("email").map_err(|e| Self::sqlx_to_store_error("get", e))?,
            status,
            step_status,
            customer_name: row
                .try_get("customer_name")
                .map_err(|e| Self::sqlx_to_store_error("get", e))?,
            customer_phone: row
                .try_get("customer_phone")
                .map_err(|e| Self::sqlx_to_store_error("get", e))?,
            client_id: row
                .try_get("client_id")
                .map_err(|e| Self::sqlx_to_store_error("get", e))?,
            created_at_ms: row
                .try_get("created_at_ms")
                .map_err(|e| Self::sqlx_to_store_error("get", e))?,
            updated_at_ms: row
                .try_get("updated_at_ms")
                .map_err(|e| Self::sqlx_to_store_error("get", e))?,
        })
    }

    /// Rewrite a record's timestamps (test utility for windowed admission
    /// and retention checks).
    pub async fn backdate(&self, email: &str, timestamp_ms: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE checkout_flows SET created_at_ms = ?1, updated_at_ms = ?1 WHERE email = ?2")
            .bind(timestamp_ms)
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("backdate", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl FlowStore for SqliteFlowStore {
    async fn upsert(&self, flow: NewFlow) -> Result<(), StoreError> {
        let step_status = serde_json::to_string(&flow.step_status)
            .map_err(|e| StoreError::permanent("upsert", format!("unserializable step_status: {e}")))?;
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO checkout_flows
                (email, status, step_status, customer_name, customer_phone, client_id, created_at_ms, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(email) DO UPDATE SET
                status = excluded.status,
                step_status = excluded.step_status,
                customer_name = excluded.customer_name,
                customer_phone = excluded.customer_phone,
                client_id = excluded.client_id,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&flow.email)
        .bind(flow.status.as_str())
        .bind(&step_status)
        .bind(&flow.customer_name)
        .bind(&flow.customer_phone)
        .bind(&flow.client_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("upsert", e))?;
        Ok(())
    }

    async fn get(&self, email: &str) -> Result<Option<FlowRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM checkout_flows WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("get", e))?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn set_status(&self, email: &str, status: FlowStatus) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE checkout_flows SET status = ?1, updated_at_ms = ?2 WHERE email = ?3")
            .bind(status.as_str())
            .bind(now_ms())
            .bind(email)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("set_status", e))?;
        if result.rows_affected() == 0 {
            warn!(identity = %email, %status, "set_status for unknown identity, ignoring");
            return Ok(false);
        }
        Ok(true)
    }

    async fn set_step_status(&self, email: &str, step: &str, outcome: &str) -> Result<(), StoreError> {
        // json_set merges one key without read-modify-write, so a concurrent
        // status update on the same row cannot be lost.
        sqlx::query(
            r#"
            UPDATE checkout_flows
            SET step_status = json_set(step_status, '$.' || ?1, ?2), updated_at_ms = ?3
            WHERE email = ?4
            "#,
        )
        .bind(step)
        .bind(outcome)
        .bind(now_ms())
        .bind(email)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("set_step_status", e))?;
        Ok(())
    }

    async fn recent_flow_exists(&self, email: &str, within_ms: i64) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM checkout_flows WHERE email = ?1 AND created_at_ms > ?2",
        )
        .bind(email)
        .bind(now_ms() - within_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("recent_flow_exists", e))?;
        Ok(count > 0)
    }

    async fn recipient_flow_count_since(&self, recipient: &str, window_ms: i64) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM checkout_flows
            WHERE customer_phone = ?1 AND created_at_ms > ?2 AND status != 'blocked'
            "#,
        )
        .bind(recipient)
        .bind(now_ms() - window_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("recipient_flow_count_since", e))?;
        Ok(count as u64)
    }

    async fn delete_older_than(&self, age_ms: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM checkout_flows WHERE updated_at_ms < ?1")
            .bind(now_ms() - age_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("delete_older_than", e))?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM checkout_flows")
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("delete_all", e))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FlowRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM checkout_flows ORDER BY created_at_ms")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_store_error("list", e))?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn stats(&self) -> Result<FlowStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(status = 'pending'), 0) AS pending,
                COALESCE(SUM(status = 'completed'), 0) AS completed,
                COALESCE(SUM(status = 'blocked'), 0) AS blocked,
                COALESCE(SUM(created_at_ms > ?1), 0) AS started_last_24h
            FROM checkout_flows
            "#,
        )
        .bind(now_ms() - 24 * 60 * 60 * 1000)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_store_error("stats", e))?;

        let col = |name: &str| -> Result<u64, StoreError> {
            let v: i64 = row.try_get(name).map_err(|e| Self::sqlx_to_store_error("stats", e))?;
            Ok(v as u64)
        };
        Ok(FlowStats {
            total: col("total")?,
            pending: col("pending")?,
            completed: col("completed")?,
            blocked: col("blocked")?,
            started_last_24h: col("started_last_24h")?,
        })
    }
}
