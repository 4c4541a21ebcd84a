//! Anti-spam gating: flow admission and per-send eligibility.
//!
//! Admission distinguishes Deny (benign duplicate trigger, nothing written)
//! from Block (policy ceiling hit, audit record written) so operators can
//! tell webhook-retry noise apart from customers hitting the spam ceiling.

use std::sync::Arc;

use tracing::{info, warn};

use crate::flowdef::GatePolicy;
use crate::ratelimit::RateLimiter;
use crate::store::{FlowStore, NewFlow, StoreError};
use crate::{CheckoutTrigger, FlowStatus, StepStatusMap};

pub const REASON_DUPLICATE_RECENT_FLOW: &str = "duplicate_recent_flow";
pub const REASON_DAILY_LIMIT_EXCEEDED: &str = "daily_limit_exceeded";

/// Admission decision for one checkout trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    /// Duplicate of a recent flow; the trigger is silently dropped.
    Deny { reason: &'static str },
    /// Anti-spam ceiling hit; a Blocked audit record was written.
    Block { reason: &'static str },
}

/// Combines persisted flow history and the in-process rate limiter into the
/// two gating questions: may this flow start, and may this message go out.
pub struct Gate {
    store: Arc<dyn FlowStore>,
    limiter: Arc<RateLimiter>,
    policy: GatePolicy,
}

impl Gate {
    pub fn new(store: Arc<dyn FlowStore>, limiter: Arc<RateLimiter>, policy: GatePolicy) -> Self {
        Self { store, limiter, policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Decide whether a flow may start for this trigger. Checks run in
    /// order and short-circuit on the first failure.
    pub async fn admit(&self, trigger: &CheckoutTrigger, client_id: &str) -> Result<Admission, StoreError> {
        let email = &trigger.customer_email;
        let recipient = &trigger.customer_phone;

        if self.store.recent_flow_exists(email, self.policy.min_ms_between_flows).await? {
            info!(identity = %email, "duplicate trigger for recent flow, dropping");
            return Ok(Admission::Deny {
                reason: REASON_DUPLICATE_RECENT_FLOW,
            });
        }

        let starts = self
            .store
            .recipient_flow_count_since(recipient, self.policy.flow_window_ms)
            .await?;
        if starts >= u64::from(self.policy.max_flows_per_recipient) {
            warn!(identity = %email, recipient = %recipient, starts, "daily flow ceiling hit, blocking");
            let mut step_status = StepStatusMap::new();
            step_status.insert("reason".to_string(), REASON_DAILY_LIMIT_EXCEEDED.to_string());
            self.store
                .upsert(NewFlow {
                    email: email.clone(),
                    status: FlowStatus::Blocked,
                    step_status,
                    customer_name: trigger.customer_name.clone(),
                    customer_phone: recipient.clone(),
                    client_id: client_id.to_string(),
                })
                .await?;
            return Ok(Admission::Block {
                reason: REASON_DAILY_LIMIT_EXCEEDED,
            });
        }

        Ok(Admission::Allow)
    }

    /// Per-message gate inside the step loop. A refusal is retryable in
    /// principle but terminates the remainder of the flow instance.
    pub async fn can_send(&self, recipient: &str) -> bool {
        !self.limiter.is_limited(recipient).await
    }

    /// Record a delivered message against the recipient's window.
    pub async fn record_send(&self, recipient: &str) {
        self.limiter.record_send(recipient).await;
    }
}
