//! Demo: two abandoned checkouts, one completed mid-flow.
//!
//! Runs entirely in-process with the in-memory store and the dry-run
//! sender; step delays are shortened so the whole thing finishes in a few
//! seconds. `RUST_LOG=info` shows each send as it happens.

use std::sync::Arc;
use std::time::Duration;

use cartflow::store::{CachedFlowStore, InMemoryFlowStore};
use cartflow::{
    CheckoutTrigger, Client, DryRunSender, FlowCatalog, FlowDefinition, FlowStore, Runtime, StepDefinition,
};

fn demo_catalog() -> FlowCatalog {
    FlowCatalog::builder()
        .register(
            "shopdemo",
            FlowDefinition {
                checkout_url: "https://shopdemo.example/checkout".to_string(),
                steps: vec![
                    StepDefinition {
                        delay_ms: 1000,
                        template: "abandoned_cart_reminder_1".to_string(),
                        params: vec!["{customer_name}".to_string()],
                    },
                    StepDefinition {
                        delay_ms: 1000,
                        template: "abandoned_cart_reminder_2".to_string(),
                        params: vec!["{customer_name}".to_string(), "{checkout_url}".to_string()],
                    },
                    StepDefinition {
                        delay_ms: 1000,
                        template: "abandoned_cart_final".to_string(),
                        params: vec!["{customer_name}".to_string(), "{checkout_url}".to_string()],
                    },
                ],
            },
        )
        .build()
}

fn trigger(name: &str, email: &str, phone: &str) -> CheckoutTrigger {
    CheckoutTrigger {
        customer_name: Some(name.to_string()),
        customer_email: email.to_string(),
        customer_phone: phone.to_string(),
        cart_items: vec![],
        occurred_at_ms: None,
    }
}

#[tokio::main]
async fn main() {
    let catalog = demo_catalog();
    let store: Arc<dyn FlowStore> = Arc::new(CachedFlowStore::new(Arc::new(InMemoryFlowStore::new())));
    let sender = Arc::new(DryRunSender::new());
    let runtime = Runtime::start(store.clone(), sender, catalog.clone()).await;
    let client = Client::new(store, catalog);

    let d1 = runtime
        .trigger_checkout(trigger("Alice", "alice@example.com", "+15550001111"), "shopdemo")
        .await
        .unwrap();
    let d2 = runtime
        .trigger_checkout(trigger("Bob", "bob@example.com", "+15550002222"), "shopdemo")
        .await
        .unwrap();
    println!("admissions: alice={d1:?} bob={d2:?}");

    // Bob orders between step 1 and step 2; his flow stops there.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    client.complete_order("bob@example.com").await.unwrap();

    runtime.drain().await;

    for email in ["alice@example.com", "bob@example.com"] {
        let rec = client.get_flow(email).await.unwrap().unwrap();
        let progress = client.flow_progress(email).await.unwrap();
        println!("{email}: status={} progress={progress:?} steps={:?}", rec.status, rec.step_status);
    }
    println!("stats: {:?}", client.stats().await.unwrap());
}
