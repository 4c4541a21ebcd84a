//! Outbound delivery capability.
//!
//! The engine only depends on this seam: success carries an opaque delivery
//! id, and failures are classified by the sender into rate-limit signals
//! (which terminate the remainder of a flow) and everything else (which is
//! step-local).

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Successful delivery: opaque downstream message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

/// Delivery failure, classified by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The channel refused the send for rate reasons; further attempts in
    /// this flow instance are expected to fail too.
    RateLimited { message: String },
    /// Any other delivery failure; the flow moves on to its next step.
    Failed { message: String },
}

impl SendError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SendError::RateLimited { .. })
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::RateLimited { message } => write!(f, "rate limited: {message}"),
            SendError::Failed { message } => write!(f, "send failed: {message}"),
        }
    }
}

impl std::error::Error for SendError {}

/// Templated-message delivery channel.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, recipient: &str, template: &str, params: &[String]) -> Result<SendReceipt, SendError>;
}

/// Sender that logs instead of delivering and returns synthetic receipt ids.
/// Stands in for the real channel in demos and local development.
#[derive(Default)]
pub struct DryRunSender {
    counter: AtomicU64,
}

impl DryRunSender {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MessageSender for DryRunSender {
    async fn send(&self, recipient: &str, template: &str, params: &[String]) -> Result<SendReceipt, SendError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!(recipient = %recipient, template = %template, ?params, "dry-run send");
        Ok(SendReceipt {
            message_id: format!("dry_msg_{n}"),
        })
    }
}
