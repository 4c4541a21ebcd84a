use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::warn;

use super::{FlowRecord, FlowStats, FlowStore, NewFlow, StoreError};
use crate::{now_ms, FlowStatus};

/// In-memory store for tests and single-process development. The single map
/// lock serializes writes per identity, which is all the engine requires.
#[derive(Default)]
pub struct InMemoryFlowStore {
    inner: Mutex<HashMap<String, FlowRecord>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite a record's timestamps (test utility for windowed admission
    /// and retention checks).
    pub async fn backdate(&self, email: &str, timestamp_ms: i64) {
        let mut g = self.inner.lock().await;
        if let Some(rec) = g.get_mut(email) {
            rec.created_at_ms = timestamp_ms;
            rec.updated_at_ms = timestamp_ms;
        }
    }
}

#[async_trait::async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn upsert(&self, flow: NewFlow) -> Result<(), StoreError> {
        let now = now_ms();
        let mut g = self.inner.lock().await;
        let created_at_ms = g.get(&flow.email).map(|r| r.created_at_ms).unwrap_or(now);
        g.insert(
            flow.email.clone(),
            FlowRecord {
                email: flow.email,
                status: flow.status,
                step_status: flow.step_status,
                customer_name: flow.customer_name,
                customer_phone: flow.customer_phone,
                client_id: flow.client_id,
                created_at_ms,
                updated_at_ms: now,
            },
        );
        Ok(())
    }

    async fn get(&self, email: &str) -> Result<Option<FlowRecord>, StoreError> {
        Ok(self.inner.lock().await.get(email).cloned())
    }

    async fn set_status(&self, email: &str, status: FlowStatus) -> Result<bool, StoreError> {
        let mut g = self.inner.lock().await;
        match g.get_mut(email) {
            Some(rec) => {
                rec.status = status;
                rec.updated_at_ms = now_ms();
                Ok(true)
            }
            None => {
                warn!(identity = %email, %status, "set_status for unknown identity, ignoring");
                Ok(false)
            }
        }
    }

    async fn set_step_status(&self, email: &str, step: &str, outcome: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if let Some(rec) = g.get_mut(email) {
            rec.step_status.insert(step.to_string(), outcome.to_string());
            rec.updated_at_ms = now_ms();
        }
        Ok(())
    }

    async fn recent_flow_exists(&self, email: &str, within_ms: i64) -> Result<bool, StoreError> {
        let cutoff = now_ms() - within_ms;
        let g = self.inner.lock().await;
        Ok(g.get(email).is_some_and(|r| r.created_at_ms > cutoff))
    }

    async fn recipient_flow_count_since(&self, recipient: &str, window_ms: i64) -> Result<u64, StoreError> {
        let cutoff = now_ms() - window_ms;
        let g = self.inner.lock().await;
        Ok(g.values()
            .filter(|r| {
                r.customer_phone == recipient && r.created_at_ms > cutoff && r.status != FlowStatus::Blocked
            })
            .count() as u64)
    }

    async fn delete_older_than(&self, age_ms: i64) -> Result<u64, StoreError> {
        let cutoff = now_ms() - age_ms;
        let mut g = self.inner.lock().await;
        let before = g.len();
        g.retain(|_, r| r.updated_at_ms >= cutoff);
        Ok((before - g.len()) as u64)
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        self.inner.lock().await.clear();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FlowRecord>, StoreError> {
        Ok(self.inner.lock().await.values().cloned().collect())
    }

    async fn stats(&self) -> Result<FlowStats, StoreError> {
        let day_ago = now_ms() - 24 * 60 * 60 * 1000;
        let g = self.inner.lock().await;
        let mut stats = FlowStats {
            total: g.len() as u64,
            ..FlowStats::default()
        };
        for r in g.values() {
            match r.status {
                FlowStatus::Pending => stats.pending += 1,
                FlowStatus::Completed => stats.completed += 1,
                FlowStatus::Blocked => stats.blocked += 1,
            }
            if r.created_at_ms > day_ago {
                stats.started_last_24h += 1;
            }
        }
        Ok(stats)
    }
}
