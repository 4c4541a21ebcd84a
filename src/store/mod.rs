//! Durable flow-state persistence: one record per customer identity.
//!
//! Stores are datastores only; the runtime owns tasks and scheduling.

use serde::{Deserialize, Serialize};

use crate::{FlowStatus, StepStatusMap};

/// In-memory store for tests and local development.
pub mod in_memory;
/// SQLite-backed store with atomic partial step updates.
pub mod sqlite;
/// Read-through cache decorator over any other store.
pub mod cached;

pub use cached::CachedFlowStore;
pub use in_memory::InMemoryFlowStore;
pub use sqlite::SqliteFlowStore;

/// One persisted flow record. `email` is the sole identity; at most one
/// record exists per identity at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub email: String,
    pub status: FlowStatus,
    pub step_status: StepStatusMap,
    pub customer_name: Option<String>,
    pub customer_phone: String,
    pub client_id: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Write payload for `FlowStore::upsert`. Timestamps are store-managed:
/// `created_at` is set once on insert, `updated_at` refreshes on every write.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFlow {
    pub email: String,
    pub status: FlowStatus,
    pub step_status: StepStatusMap,
    pub customer_name: Option<String>,
    pub customer_phone: String,
    pub client_id: String,
}

/// Aggregate counts over persisted records, for the operational surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    pub total: u64,
    pub pending: u64,
    pub completed: u64,
    pub blocked: u64,
    pub started_last_24h: u64,
}

/// Storage abstraction for flow records keyed by customer email.
///
/// Upsert semantics are idempotent overwrite (no append-only log), so
/// duplicate webhook deliveries and process restarts converge on one row.
/// Partial updates (`set_status`, `set_step_status`) must be atomic at the
/// storage layer so concurrent writers never lose each other's writes.
#[async_trait::async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert or fully overwrite the record for `flow.email`.
    async fn upsert(&self, flow: NewFlow) -> Result<(), StoreError>;

    /// Point read by identity.
    async fn get(&self, email: &str) -> Result<Option<FlowRecord>, StoreError>;

    /// Point read that bypasses any cache layer. The flow engine uses this
    /// for the step-boundary completion check, where freshness is bounded by
    /// the store read, not the cache. Defaults to `get` for uncached stores.
    async fn get_fresh(&self, email: &str) -> Result<Option<FlowRecord>, StoreError> {
        self.get(email).await
    }

    /// Update status only. Returns false (after a logged warning) when no
    /// record exists for the identity: a completion event may race ahead of
    /// or arrive without a checkout-started event, and that is recoverable.
    async fn set_status(&self, email: &str, status: FlowStatus) -> Result<bool, StoreError>;

    /// Merge one entry into the step-status map without clobbering sibling
    /// entries. No-op when the identity is absent.
    async fn set_step_status(&self, email: &str, step: &str, outcome: &str) -> Result<(), StoreError>;

    /// Whether a record for `email` was created within the trailing window.
    async fn recent_flow_exists(&self, email: &str, within_ms: i64) -> Result<bool, StoreError>;

    /// Flow starts for `recipient` created within the trailing window,
    /// excluding Blocked records (a Blocked record is a suppressed attempt,
    /// not a delivered campaign).
    async fn recipient_flow_count_since(&self, recipient: &str, window_ms: i64) -> Result<u64, StoreError>;

    /// Retention cleanup: delete records not updated within `age_ms`.
    /// Returns the number of deleted records. Cache layers drop their whole
    /// cache on completion.
    async fn delete_older_than(&self, age_ms: i64) -> Result<u64, StoreError>;

    /// Remove every record (admin/test utility).
    async fn delete_all(&self) -> Result<(), StoreError>;

    /// Enumerate all persisted records (admin surface; not used by the
    /// engine).
    async fn list(&self) -> Result<Vec<FlowRecord>, StoreError>;

    /// Aggregate counts for the operational surface.
    async fn stats(&self) -> Result<FlowStats, StoreError>;
}

/// Store-specific error with retry classification.
///
/// Retryable: busy/locked database, connection timeouts, transient I/O.
/// Permanent: corrupt rows (unparseable status or step map), constraint
/// violations, malformed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Operation that failed (e.g. "upsert", "set_step_status").
    pub operation: String,
    /// Human-readable error message.
    pub message: String,
    /// Whether retrying the operation could succeed.
    pub retryable: bool,
}

impl StoreError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for StoreError {}
