#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use cartflow::store::{CachedFlowStore, FlowStore};
use cartflow::{Admission, Client, FlowProgress, FlowStatus, GatePolicy, Runtime, RuntimeOptions, SendError};

mod common;
use common::{
    anonymous_trigger, create_in_memory_store, quick_catalog, trigger, wait_for_record, RecordingSender,
    CHECKOUT_URL, CLIENT,
};

/// Happy path: all configured steps run in order and the record ends up
/// Pending-with-all-steps-accounted, reported as Exhausted.
#[tokio::test]
async fn three_step_flow_sends_all_steps_in_order() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::new());
    let catalog = quick_catalog(30, 3);
    let rt = Runtime::start(store.clone(), sender.clone(), catalog.clone()).await;

    let decision = rt
        .trigger_checkout(trigger("alice@example.com", "+15550001111"), CLIENT)
        .await
        .unwrap();
    assert_eq!(decision, Admission::Allow);
    rt.drain().await;

    let calls = sender.calls().await;
    assert_eq!(calls.len(), 3);
    for (i, call) in calls.iter().enumerate() {
        assert_eq!(call.recipient, "+15550001111");
        assert_eq!(call.template, format!("abandoned_cart_reminder_{}", i + 1));
        assert_eq!(call.params, vec!["Alice".to_string(), CHECKOUT_URL.to_string()]);
    }

    let rec = store.get("alice@example.com").await.unwrap().unwrap();
    assert_eq!(rec.status, FlowStatus::Pending);
    assert_eq!(rec.step_status.get("step_1").map(String::as_str), Some("sent"));
    assert_eq!(rec.step_status.get("step_2").map(String::as_str), Some("sent"));
    assert_eq!(rec.step_status.get("step_3").map(String::as_str), Some("sent"));

    let client = Client::new(store, catalog);
    assert_eq!(client.flow_progress("alice@example.com").await.unwrap(), FlowProgress::Exhausted);
}

/// The central correctness property: a completion signal delivered during
/// an in-flight delay wins the race, and no step executes after it.
#[tokio::test]
async fn completion_mid_flow_stops_remaining_steps() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::new());
    let catalog = quick_catalog(200, 3);
    let rt = Runtime::start(store.clone(), sender.clone(), catalog.clone()).await;
    let client = Client::new(store.clone(), catalog);

    rt.trigger_checkout(trigger("bob@example.com", "+15550002222"), CLIENT)
        .await
        .unwrap();

    // Step 1 lands at ~200ms; the order completes during step 2's delay.
    assert!(wait_for_record(&store, "bob@example.com", |r| r.step_status.contains_key("step_1"), 2000).await);
    assert!(client.complete_order("bob@example.com").await.unwrap());
    rt.drain().await;

    assert_eq!(sender.call_count().await, 1);
    let rec = store.get("bob@example.com").await.unwrap().unwrap();
    assert_eq!(rec.status, FlowStatus::Completed);
    assert_eq!(rec.step_status.get("step_1").map(String::as_str), Some("sent"));
    assert!(!rec.step_status.contains_key("step_2"));
    assert!(!rec.step_status.contains_key("step_3"));
}

/// Completion arriving before the first delay elapses suppresses every
/// send.
#[tokio::test]
async fn completion_before_first_step_yields_no_sends() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::new());
    let rt = Runtime::start(store.clone(), sender.clone(), quick_catalog(150, 2)).await;

    rt.trigger_checkout(trigger("carol@example.com", "+15550003333"), CLIENT)
        .await
        .unwrap();
    assert!(store.set_status("carol@example.com", FlowStatus::Completed).await.unwrap());
    rt.drain().await;

    assert_eq!(sender.call_count().await, 0);
    let rec = store.get("carol@example.com").await.unwrap().unwrap();
    assert_eq!(rec.status, FlowStatus::Completed);
    assert!(rec.step_status.is_empty());
}

/// A plain delivery failure is step-local: the step is marked failed and
/// the flow continues with the next step.
#[tokio::test]
async fn delivery_failure_continues_to_next_step() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::with_script(vec![
        Some(SendError::Failed {
            message: "template rejected".to_string(),
        }),
        None,
    ]));
    let rt = Runtime::start(store.clone(), sender.clone(), quick_catalog(20, 2)).await;

    rt.trigger_checkout(trigger("dave@example.com", "+15550004444"), CLIENT)
        .await
        .unwrap();
    rt.drain().await;

    assert_eq!(sender.call_count().await, 2);
    let rec = store.get("dave@example.com").await.unwrap().unwrap();
    assert_eq!(rec.step_status.get("step_1").map(String::as_str), Some("failed"));
    assert_eq!(rec.step_status.get("step_2").map(String::as_str), Some("sent"));
}

/// A rate-limit signal from the sender terminates the remainder of the
/// flow: further attempts are assumed to fail too.
#[tokio::test]
async fn sender_rate_limit_terminates_flow() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::with_script(vec![Some(SendError::RateLimited {
        message: "429 from channel".to_string(),
    })]));
    let rt = Runtime::start(store.clone(), sender.clone(), quick_catalog(20, 3)).await;

    rt.trigger_checkout(trigger("erin@example.com", "+15550005555"), CLIENT)
        .await
        .unwrap();
    rt.drain().await;

    assert_eq!(sender.call_count().await, 1);
    let rec = store.get("erin@example.com").await.unwrap().unwrap();
    assert_eq!(rec.status, FlowStatus::Pending);
    assert_eq!(rec.step_status.get("step_1").map(String::as_str), Some("failed"));
    assert!(!rec.step_status.contains_key("step_2"));
    assert!(!rec.step_status.contains_key("step_3"));
}

/// The local per-recipient window refuses the send before the sender is
/// even called, and the rest of the campaign is suppressed.
#[tokio::test]
async fn local_rate_limit_suppresses_rest_of_flow() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::new());
    let policy = GatePolicy {
        max_sends_per_recipient: 1,
        ..GatePolicy::default()
    };
    let rt = Runtime::start_with_options(
        store.clone(),
        sender.clone(),
        quick_catalog(20, 3),
        policy,
        RuntimeOptions::default(),
    )
    .await;

    rt.trigger_checkout(trigger("frank@example.com", "+15550006666"), CLIENT)
        .await
        .unwrap();
    rt.drain().await;

    // Step 1 consumed the only permitted send; step 2 was refused locally.
    assert_eq!(sender.call_count().await, 1);
    let rec = store.get("frank@example.com").await.unwrap().unwrap();
    assert_eq!(rec.step_status.get("step_1").map(String::as_str), Some("sent"));
    assert_eq!(rec.step_status.get("step_2").map(String::as_str), Some("failed"));
    assert!(!rec.step_status.contains_key("step_3"));
}

/// A trigger with no display name falls back to the literal default in
/// parameter resolution; the send still happens.
#[tokio::test]
async fn missing_name_substitutes_literal_default() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::new());
    let rt = Runtime::start(store.clone(), sender.clone(), quick_catalog(10, 1)).await;

    rt.trigger_checkout(anonymous_trigger("grace@example.com", "+15550007777"), CLIENT)
        .await
        .unwrap();
    rt.drain().await;

    let calls = sender.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params, vec!["there".to_string(), CHECKOUT_URL.to_string()]);
}

/// The trigger path acknowledges before any delay or delivery work runs.
#[tokio::test]
async fn trigger_returns_before_steps_execute() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::new());
    let rt = Runtime::start(store.clone(), sender.clone(), quick_catalog(300, 1)).await;

    let started = Instant::now();
    rt.trigger_checkout(trigger("heidi@example.com", "+15550008888"), CLIENT)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(150));
    assert_eq!(sender.call_count().await, 0);

    let rec = store.get("heidi@example.com").await.unwrap().unwrap();
    assert_eq!(rec.status, FlowStatus::Pending);
    assert_eq!(rt.in_flight().await, 1);

    rt.shutdown().await;
}

/// Shutdown abandons in-flight delays: the interrupted step never executes
/// and nothing is marked for it.
#[tokio::test]
async fn shutdown_abandons_inflight_delay_without_partial_state() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::new());
    let rt = Runtime::start(store.clone(), sender.clone(), quick_catalog(150, 2)).await;

    rt.trigger_checkout(trigger("ivan@example.com", "+15550009999"), CLIENT)
        .await
        .unwrap();

    // Let step 1 land, then abort during step 2's delay.
    assert!(wait_for_record(&store, "ivan@example.com", |r| r.step_status.contains_key("step_1"), 2000).await);
    rt.shutdown().await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(sender.call_count().await, 1);
    let rec = store.get("ivan@example.com").await.unwrap().unwrap();
    assert_eq!(rec.status, FlowStatus::Pending);
    assert_eq!(rec.step_status.get("step_1").map(String::as_str), Some("sent"));
    assert!(!rec.step_status.contains_key("step_2"));
}

/// Flows for different customers run independently and concurrently.
#[tokio::test]
async fn concurrent_flows_do_not_interfere() {
    let store: Arc<dyn FlowStore> = create_in_memory_store();
    let sender = Arc::new(RecordingSender::new());
    let catalog = quick_catalog(50, 2);
    let rt = Runtime::start(store.clone(), sender.clone(), catalog.clone()).await;

    rt.trigger_checkout(trigger("judy@example.com", "+15551110000"), CLIENT)
        .await
        .unwrap();
    rt.trigger_checkout(trigger("ken@example.com", "+15552220000"), CLIENT)
        .await
        .unwrap();
    rt.drain().await;

    assert_eq!(sender.call_count().await, 4);
    let client = Client::new(store, catalog);
    assert_eq!(client.flow_progress("judy@example.com").await.unwrap(), FlowProgress::Exhausted);
    assert_eq!(client.flow_progress("ken@example.com").await.unwrap(), FlowProgress::Exhausted);

    // Per-recipient call order is still the configured step order.
    let judy_templates: Vec<String> = sender
        .calls()
        .await
        .into_iter()
        .filter(|c| c.recipient == "+15551110000")
        .map(|c| c.template)
        .collect();
    assert_eq!(judy_templates, vec!["abandoned_cart_reminder_1", "abandoned_cart_reminder_2"]);
}

/// Same race as `completion_mid_flow_stops_remaining_steps`, but through
/// the cache decorator: the step-boundary re-read must bypass it.
#[tokio::test]
async fn completion_race_is_won_through_the_cache_layer() {
    let inner = create_in_memory_store();
    let store: Arc<dyn FlowStore> = Arc::new(CachedFlowStore::new(inner));
    let sender = Arc::new(RecordingSender::new());
    let catalog = quick_catalog(200, 3);
    let rt = Runtime::start(store.clone(), sender.clone(), catalog.clone()).await;
    let client = Client::new(store.clone(), catalog);

    rt.trigger_checkout(trigger("leo@example.com", "+15553330000"), CLIENT)
        .await
        .unwrap();
    // Warm the cache with the Pending record, as a status read would.
    let _ = store.get("leo@example.com").await.unwrap();

    assert!(wait_for_record(&store, "leo@example.com", |r| r.step_status.contains_key("step_1"), 2000).await);
    client.complete_order("leo@example.com").await.unwrap();
    rt.drain().await;

    assert_eq!(sender.call_count().await, 1);
    assert_eq!(client.flow_progress("leo@example.com").await.unwrap(), FlowProgress::Completed);
}
