//! Thin control-plane client.
//!
//! This client is intentionally limited to store-backed operations: the
//! order-completion signal, derived flow progress, operational stats and
//! retention cleanup. It communicates with running flows exclusively
//! through the shared `FlowStore`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::flowdef::{step_id, FlowCatalog};
use crate::store::{FlowRecord, FlowStats, FlowStore, StoreError};
use crate::FlowStatus;

/// High-level flow progress derived from the persisted record.
///
/// `Exhausted` is not a persisted status: a record stays `pending` in
/// storage, and is reported exhausted once every configured step has an
/// outcome recorded without an external completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowProgress {
    NotFound,
    Running,
    Completed,
    Blocked,
    Exhausted,
}

impl FlowProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowProgress::Completed | FlowProgress::Blocked | FlowProgress::Exhausted)
    }
}

/// Error type returned by the wait helper.
#[derive(Debug)]
pub enum WaitError {
    Timeout,
    Store(StoreError),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for flow progress"),
            WaitError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for WaitError {}

pub struct Client {
    store: Arc<dyn FlowStore>,
    catalog: FlowCatalog,
}

impl Client {
    pub fn new(store: Arc<dyn FlowStore>, catalog: FlowCatalog) -> Self {
        Self { store, catalog }
    }

    /// Order-completion signal. May arrive before, during, after, or
    /// without a flow; an unknown identity is logged by the store and
    /// reported as `false` here, never an error.
    pub async fn complete_order(&self, email: &str) -> Result<bool, StoreError> {
        let updated = self.store.set_status(email, FlowStatus::Completed).await?;
        if updated {
            info!(identity = %email, "order completed, reminder flow cancelled");
        }
        Ok(updated)
    }

    /// Point read of the raw persisted record.
    pub async fn get_flow(&self, email: &str) -> Result<Option<FlowRecord>, StoreError> {
        self.store.get(email).await
    }

    /// Derived progress for one identity (see `FlowProgress`).
    pub async fn flow_progress(&self, email: &str) -> Result<FlowProgress, StoreError> {
        let Some(rec) = self.store.get(email).await? else {
            return Ok(FlowProgress::NotFound);
        };
        Ok(match rec.status {
            FlowStatus::Completed => FlowProgress::Completed,
            FlowStatus::Blocked => FlowProgress::Blocked,
            FlowStatus::Pending => match self.catalog.get(&rec.client_id) {
                Some(def)
                    if !def.steps.is_empty()
                        && (0..def.steps.len()).all(|i| rec.step_status.contains_key(&step_id(i))) =>
                {
                    FlowProgress::Exhausted
                }
                _ => FlowProgress::Running,
            },
        })
    }

    /// Poll until the identity reaches a terminal progress state.
    pub async fn wait_for_terminal(&self, email: &str, timeout: Duration) -> Result<FlowProgress, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            let progress = self.flow_progress(email).await.map_err(WaitError::Store)?;
            if progress.is_terminal() {
                return Ok(progress);
            }
            if Instant::now() > deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Enumerate every persisted record (admin surface).
    pub async fn list_flows(&self) -> Result<Vec<FlowRecord>, StoreError> {
        self.store.list().await
    }

    /// Aggregate counts for dashboards and smoke checks.
    pub async fn stats(&self) -> Result<FlowStats, StoreError> {
        self.store.stats().await
    }

    /// Retention cleanup: drop records untouched for `age`.
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64, StoreError> {
        self.store.delete_older_than(age.as_millis() as i64).await
    }

    /// Remove every record (admin utility).
    pub async fn purge_all(&self) -> Result<(), StoreError> {
        self.store.delete_all().await
    }
}
