//! Flow runtime: admission, dispatch and lifecycle of per-customer flow
//! tasks.
//!
//! Each admitted flow runs as its own tokio task so a multi-minute delay
//! chain never blocks the trigger path or other customers. Tasks are
//! tracked and bounded: a semaphore caps concurrently executing flows and
//! `shutdown` aborts whatever is still sleeping, which is safe because
//! every step write is atomic and self-contained.

mod flow;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::flowdef::{FlowCatalog, FlowDefinition, GatePolicy};
use crate::gating::{Admission, Gate};
use crate::ratelimit::RateLimiter;
use crate::sender::MessageSender;
use crate::store::{FlowStore, NewFlow};
use crate::{CheckoutTrigger, EngineError, FlowStatus, StepStatusMap};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Ceiling on concurrently executing flow tasks. Excess admitted flows
    /// wait for a permit inside their own task; the trigger path never
    /// blocks on this.
    pub max_concurrent_flows: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_flows: 256,
        }
    }
}

/// In-process runtime that admits checkout triggers and drives flow tasks
/// against a `FlowStore` and a `MessageSender`.
pub struct Runtime {
    pub(crate) store: Arc<dyn FlowStore>,
    pub(crate) sender: Arc<dyn MessageSender>,
    pub(crate) gate: Gate,
    catalog: FlowCatalog,
    joins: Mutex<Vec<JoinHandle<()>>>,
    flow_permits: Arc<Semaphore>,
}

impl Runtime {
    /// Start a runtime with the default gating policy and options.
    pub async fn start(
        store: Arc<dyn FlowStore>,
        sender: Arc<dyn MessageSender>,
        catalog: FlowCatalog,
    ) -> Arc<Self> {
        Self::start_with_options(store, sender, catalog, GatePolicy::default(), RuntimeOptions::default()).await
    }

    /// Start a runtime with explicit policy and options.
    pub async fn start_with_options(
        store: Arc<dyn FlowStore>,
        sender: Arc<dyn MessageSender>,
        catalog: FlowCatalog,
        policy: GatePolicy,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let limiter = Arc::new(RateLimiter::new(
            policy.max_sends_per_recipient as usize,
            Duration::from_millis(policy.send_window_ms),
        ));
        let gate = Gate::new(store.clone(), limiter, policy);

        Arc::new(Self {
            store,
            sender,
            gate,
            catalog,
            joins: Mutex::new(Vec::new()),
            flow_permits: Arc::new(Semaphore::new(options.max_concurrent_flows)),
        })
    }

    /// Trigger entry point for a checkout-abandonment event.
    ///
    /// Makes the admission decision, persists the initial Pending record on
    /// Allow, and dispatches the flow task. Returns as soon as dispatch is
    /// done: the caller gets an immediate acknowledgment and flow outcomes
    /// are visible only through the persisted record.
    pub async fn trigger_checkout(
        self: &Arc<Self>,
        trigger: CheckoutTrigger,
        client_id: &str,
    ) -> Result<Admission, EngineError> {
        if trigger.customer_email.is_empty() {
            warn!("trigger missing email, dropping");
            return Err(EngineError::InvalidTrigger("customer_email"));
        }
        if trigger.customer_phone.is_empty() {
            warn!(identity = %trigger.customer_email, "trigger missing phone, dropping");
            return Err(EngineError::InvalidTrigger("customer_phone"));
        }
        let Some(definition) = self.catalog.get(client_id).cloned() else {
            error!(client = %client_id, "no flow definition for client");
            return Err(EngineError::UnknownClient(client_id.to_string()));
        };

        let decision = self.gate.admit(&trigger, client_id).await?;
        if decision != Admission::Allow {
            return Ok(decision);
        }

        self.store
            .upsert(NewFlow {
                email: trigger.customer_email.clone(),
                status: FlowStatus::Pending,
                step_status: StepStatusMap::new(),
                customer_name: trigger.customer_name.clone(),
                customer_phone: trigger.customer_phone.clone(),
                client_id: client_id.to_string(),
            })
            .await?;

        info!(identity = %trigger.customer_email, client = %client_id, "flow admitted, dispatching");
        self.dispatch(trigger, client_id.to_string(), definition).await;
        Ok(Admission::Allow)
    }

    async fn dispatch(self: &Arc<Self>, trigger: CheckoutTrigger, client_id: String, definition: FlowDefinition) {
        let rt = self.clone();
        let handle = tokio::spawn(async move {
            let _permit = match rt.flow_permits.clone().acquire_owned().await {
                Ok(p) => p,
                // Semaphore closed: runtime is shutting down.
                Err(_) => return,
            };
            flow::run_flow(&rt, &trigger, &client_id, &definition).await;
        });

        let mut joins = self.joins.lock().await;
        joins.retain(|j| !j.is_finished());
        joins.push(handle);
    }

    /// Number of dispatched flow tasks that have not finished yet.
    pub async fn in_flight(&self) -> usize {
        self.joins.lock().await.iter().filter(|j| !j.is_finished()).count()
    }

    /// Wait for every dispatched flow task to run to completion.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut joins = self.joins.lock().await;
            joins.drain(..).collect()
        };
        let _ = futures::future::join_all(handles).await;
    }

    /// Abort in-flight flow tasks. A task aborted mid-delay simply never
    /// executes its pending step; nothing is marked for it.
    pub async fn shutdown(self: Arc<Self>) {
        self.flow_permits.close();
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }
}
