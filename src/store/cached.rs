//! Read-through cache decorator for any `FlowStore`.
//!
//! The cache is best-effort and non-authoritative: it only saves a storage
//! round trip on repeated point reads. Every mutating call invalidates the
//! touched entry (bulk deletes drop the whole cache), and `get_fresh`
//! always goes to the underlying store, so losing the cache can never
//! affect correctness, only locality.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{FlowRecord, FlowStats, FlowStore, NewFlow, StoreError};
use crate::FlowStatus;

pub struct CachedFlowStore {
    inner: Arc<dyn FlowStore>,
    cache: Mutex<HashMap<String, FlowRecord>>,
}

impl CachedFlowStore {
    pub fn new(inner: Arc<dyn FlowStore>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached entries (test utility).
    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[async_trait::async_trait]
impl FlowStore for CachedFlowStore {
    async fn upsert(&self, flow: NewFlow) -> Result<(), StoreError> {
        let email = flow.email.clone();
        self.inner.upsert(flow).await?;
        // Store-managed timestamps make the cached copy unknowable here;
        // drop the entry and let the next read repopulate it.
        self.cache.lock().await.remove(&email);
        Ok(())
    }

    async fn get(&self, email: &str) -> Result<Option<FlowRecord>, StoreError> {
        if let Some(rec) = self.cache.lock().await.get(email) {
            return Ok(Some(rec.clone()));
        }
        let rec = self.inner.get(email).await?;
        if let Some(ref r) = rec {
            self.cache.lock().await.insert(email.to_string(), r.clone());
        }
        Ok(rec)
    }

    async fn get_fresh(&self, email: &str) -> Result<Option<FlowRecord>, StoreError> {
        let rec = self.inner.get(email).await?;
        let mut cache = self.cache.lock().await;
        match &rec {
            Some(r) => {
                cache.insert(email.to_string(), r.clone());
            }
            None => {
                cache.remove(email);
            }
        }
        Ok(rec)
    }

    async fn set_status(&self, email: &str, status: FlowStatus) -> Result<bool, StoreError> {
        let updated = self.inner.set_status(email, status).await?;
        self.cache.lock().await.remove(email);
        Ok(updated)
    }

    async fn set_step_status(&self, email: &str, step: &str, outcome: &str) -> Result<(), StoreError> {
        self.inner.set_step_status(email, step, outcome).await?;
        self.cache.lock().await.remove(email);
        Ok(())
    }

    async fn recent_flow_exists(&self, email: &str, within_ms: i64) -> Result<bool, StoreError> {
        self.inner.recent_flow_exists(email, within_ms).await
    }

    async fn recipient_flow_count_since(&self, recipient: &str, window_ms: i64) -> Result<u64, StoreError> {
        self.inner.recipient_flow_count_since(recipient, window_ms).await
    }

    async fn delete_older_than(&self, age_ms: i64) -> Result<u64, StoreError> {
        let deleted = self.inner.delete_older_than(age_ms).await?;
        // The cache never tracked per-entry eviction timing, so it cannot
        // invalidate selectively.
        self.cache.lock().await.clear();
        Ok(deleted)
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        self.inner.delete_all().await?;
        self.cache.lock().await.clear();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FlowRecord>, StoreError> {
        self.inner.list().await
    }

    async fn stats(&self) -> Result<FlowStats, StoreError> {
        self.inner.stats().await
    }
}
