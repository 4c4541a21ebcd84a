//! Per-recipient sliding-window send limiter.
//!
//! State is process-local and intentionally ephemeral: losing it on restart
//! only loosens the ceiling until the window refills. Entries are pruned
//! lazily on each check, which stays O(window) because the ceiling itself
//! bounds how many timestamps a recipient can accumulate.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tracks recent send timestamps per recipient and answers "may I send now?".
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    sends: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            sends: Mutex::new(HashMap::new()),
        }
    }

    /// True when the recipient already has `limit` sends inside the window.
    /// Prunes aged-out timestamps for this recipient as a side effect.
    pub async fn is_limited(&self, recipient: &str) -> bool {
        let mut sends = self.sends.lock().await;
        let Some(entries) = sends.get_mut(recipient) else {
            return false;
        };
        let now = Instant::now();
        entries.retain(|t| now.duration_since(*t) < self.window);
        if entries.is_empty() {
            sends.remove(recipient);
            return false;
        }
        entries.len() >= self.limit
    }

    /// Record a successful send for the recipient at the current instant.
    pub async fn record_send(&self, recipient: &str) {
        let mut sends = self.sends.lock().await;
        sends.entry(recipient.to_string()).or_default().push(Instant::now());
    }

    /// Number of in-window sends currently recorded for the recipient.
    pub async fn recent_count(&self, recipient: &str) -> usize {
        let mut sends = self.sends.lock().await;
        let Some(entries) = sends.get_mut(recipient) else {
            return 0;
        };
        let now = Instant::now();
        entries.retain(|t| now.duration_since(*t) < self.window);
        entries.len()
    }
}
