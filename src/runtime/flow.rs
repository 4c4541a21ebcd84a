//! Per-flow step loop: the state machine driving one customer's reminder
//! sequence.
//!
//! Steps run strictly in order. The only suspension points are the
//! inter-step delay and the outbound delivery call. Failure handling is
//! step-local except for the two flow-terminating conditions: an external
//! completion observed at a step boundary, and a rate-limit signal
//! (detected locally or reported by the sender).

use tokio::time::sleep;
use tracing::{error, info, warn};

use super::Runtime;
use crate::flowdef::{resolve_params, step_id, FlowDefinition};
use crate::{CheckoutTrigger, FlowStatus, StepOutcome};

pub(crate) async fn run_flow(rt: &Runtime, trigger: &CheckoutTrigger, client_id: &str, definition: &FlowDefinition) {
    let email = trigger.customer_email.as_str();
    let recipient = trigger.customer_phone.as_str();
    info!(identity = %email, client = %client_id, steps = definition.steps.len(), "flow started");

    for (index, step) in definition.steps.iter().enumerate() {
        let id = step_id(index);
        sleep(step.delay()).await;

        // Completion must win the race against the delay just slept
        // through: bypass the cache so freshness is bounded by the store
        // read.
        match rt.store.get_fresh(email).await {
            Ok(Some(rec)) if rec.status == FlowStatus::Completed => {
                info!(identity = %email, step = %id, "order completed, stopping flow");
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                // Record vanished (retention cleanup or reset); nothing
                // left to update.
                warn!(identity = %email, step = %id, "flow record missing, stopping flow");
                return;
            }
            Err(e) => {
                // Without a readable status a send could reach a customer
                // who already ordered. Stop instead.
                error!(identity = %email, step = %id, error = %e, "status re-read failed, stopping flow");
                return;
            }
        }

        let params = resolve_params(&step.params, trigger.customer_name.as_deref(), &definition.checkout_url);

        if !rt.gate.can_send(recipient).await {
            warn!(identity = %email, step = %id, recipient = %recipient, "recipient rate limited, suppressing rest of flow");
            mark_step(rt, email, &id, StepOutcome::Failed).await;
            return;
        }

        match rt.sender.send(recipient, &step.template, &params).await {
            Ok(receipt) => {
                rt.gate.record_send(recipient).await;
                info!(identity = %email, step = %id, template = %step.template, message_id = %receipt.message_id, "step sent");
                mark_step(rt, email, &id, StepOutcome::Sent).await;
            }
            Err(e) if e.is_rate_limited() => {
                warn!(identity = %email, step = %id, error = %e, "sender reported rate limit, suppressing rest of flow");
                mark_step(rt, email, &id, StepOutcome::Failed).await;
                return;
            }
            Err(e) => {
                warn!(identity = %email, step = %id, error = %e, "step delivery failed, continuing with next step");
                mark_step(rt, email, &id, StepOutcome::Failed).await;
            }
        }
    }

    info!(identity = %email, "flow ran all steps without completion");
}

/// Persist one step outcome. A storage failure here is surfaced to the
/// operational logs and otherwise swallowed: the step must not silently
/// count as done, and the task must not crash the process.
async fn mark_step(rt: &Runtime, email: &str, step: &str, outcome: StepOutcome) {
    if let Err(e) = rt.store.set_step_status(email, step, outcome.as_str()).await {
        error!(identity = %email, step = %step, error = %e, "failed to persist step outcome");
    }
}
