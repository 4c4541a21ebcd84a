#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::Mutex;

use cartflow::store::{FlowRecord, FlowStore, InMemoryFlowStore, SqliteFlowStore};
use cartflow::{CheckoutTrigger, FlowCatalog, FlowDefinition, MessageSender, SendError, SendReceipt, StepDefinition};

pub const CLIENT: &str = "shopdemo";
pub const CHECKOUT_URL: &str = "https://shopdemo.example/checkout";

/// Catalog with `steps` uniform-delay steps for the test client.
pub fn quick_catalog(delay_ms: u64, steps: usize) -> FlowCatalog {
    let steps = (1..=steps)
        .map(|n| StepDefinition {
            delay_ms,
            template: format!("abandoned_cart_reminder_{n}"),
            params: vec!["{customer_name}".to_string(), "{checkout_url}".to_string()],
        })
        .collect();
    FlowCatalog::builder()
        .register(
            CLIENT,
            FlowDefinition {
                checkout_url: CHECKOUT_URL.to_string(),
                steps,
            },
        )
        .build()
}

pub fn trigger(email: &str, phone: &str) -> CheckoutTrigger {
    CheckoutTrigger {
        customer_name: Some("Alice".to_string()),
        customer_email: email.to_string(),
        customer_phone: phone.to_string(),
        cart_items: vec![],
        occurred_at_ms: None,
    }
}

pub fn anonymous_trigger(email: &str, phone: &str) -> CheckoutTrigger {
    CheckoutTrigger {
        customer_name: None,
        ..trigger(email, phone)
    }
}

pub async fn create_sqlite_store_disk() -> (Arc<SqliteFlowStore>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("flows.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteFlowStore::new(&db_url).await.unwrap());
    (store, td)
}

pub fn create_in_memory_store() -> Arc<InMemoryFlowStore> {
    Arc::new(InMemoryFlowStore::new())
}

/// One observed call on the recording sender.
#[derive(Debug, Clone, PartialEq)]
pub struct SendCall {
    pub recipient: String,
    pub template: String,
    pub params: Vec<String>,
}

/// Sender that records every call. Outcomes follow a script of errors (one
/// entry consumed per call); once the script is exhausted every call
/// succeeds.
#[derive(Default)]
pub struct RecordingSender {
    calls: Mutex<Vec<SendCall>>,
    script: Mutex<VecDeque<Option<SendError>>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<Option<SendError>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(script.into()),
        }
    }

    pub async fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait::async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, recipient: &str, template: &str, params: &[String]) -> Result<SendReceipt, SendError> {
        let mut calls = self.calls.lock().await;
        calls.push(SendCall {
            recipient: recipient.to_string(),
            template: template.to_string(),
            params: params.to_vec(),
        });
        let n = calls.len();
        drop(calls);

        if let Some(outcome) = self.script.lock().await.pop_front() {
            if let Some(err) = outcome {
                return Err(err);
            }
        }
        Ok(SendReceipt {
            message_id: format!("msg_{n}"),
        })
    }
}

/// Poll the store until the record satisfies the predicate or the timeout
/// elapses.
pub async fn wait_for_record<F>(store: &Arc<dyn FlowStore>, email: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&FlowRecord) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(Some(rec)) = store.get_fresh(email).await {
            if predicate(&rec) {
                return true;
            }
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
