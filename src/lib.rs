//! Abandoned-checkout reminder flow engine.
//!
//! A `Runtime` drives one multi-step, time-delayed reminder sequence per
//! customer: an admission `Gate` decides whether a flow may start, a
//! `FlowStore` persists per-customer flow state durably and idempotently,
//! and a sliding-window `RateLimiter` caps per-recipient sends. Delivery
//! goes through the abstract `MessageSender` capability; a completion
//! signal observed between steps stops a flow early.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod flowdef;
pub mod gating;
pub mod ratelimit;
pub mod runtime;
pub mod sender;
pub mod store;

pub use client::{Client, FlowProgress};
pub use flowdef::{FlowCatalog, FlowDefinition, GatePolicy, StepDefinition};
pub use gating::Admission;
pub use ratelimit::RateLimiter;
pub use runtime::{Runtime, RuntimeOptions};
pub use sender::{DryRunSender, MessageSender, SendError, SendReceipt};
pub use store::{FlowRecord, FlowStore, StoreError};

/// Milliseconds since the Unix epoch. All persisted timestamps use this form.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Canonical checkout-abandonment trigger, as produced by the webhook
/// ingress after payload normalization (normalization itself lives upstream).
///
/// `customer_email` is the flow identity; `customer_phone` is the delivery
/// recipient that rate limiting is keyed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutTrigger {
    pub customer_name: Option<String>,
    pub customer_email: String,
    pub customer_phone: String,
    #[serde(default)]
    pub cart_items: Vec<CartItem>,
    /// When the checkout was abandoned, per the upstream payload.
    #[serde(default)]
    pub occurred_at_ms: Option<i64>,
}

/// One line item of the abandoned cart. Carried for audit/template use only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub name: String,
    pub quantity: u32,
    pub price: f64,
}

/// Persisted status of a flow record. Terminal states are sticky: the only
/// legal transitions are Pending -> Completed and Pending -> Blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Pending,
    Completed,
    Blocked,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Pending => "pending",
            FlowStatus::Completed => "completed",
            FlowStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FlowStatus::Pending),
            "completed" => Some(FlowStatus::Completed),
            "blocked" => Some(FlowStatus::Blocked),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one executed step, recorded in the flow record's step map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Sent,
    Failed,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Sent => "sent",
            StepOutcome::Failed => "failed",
        }
    }
}

/// Step-status map persisted with each flow record: step id -> outcome.
///
/// Values are plain strings rather than a closed enum because Blocked audit
/// records reuse the same map for `{"reason": "daily_limit_exceeded"}`.
pub type StepStatusMap = BTreeMap<String, String>;

/// Errors surfaced by the trigger path. Flow execution itself never returns
/// through this type: outcomes of a running flow are visible only in the
/// persisted record and the logs.
#[derive(Debug)]
pub enum EngineError {
    /// Trigger missing a required field (email or phone).
    InvalidTrigger(&'static str),
    /// No flow definition is configured for the requested client.
    UnknownClient(String),
    /// The flow store refused an admission-time read or write.
    Store(StoreError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTrigger(field) => write!(f, "invalid trigger: missing {field}"),
            EngineError::UnknownClient(id) => write!(f, "unknown client id: {id}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}
