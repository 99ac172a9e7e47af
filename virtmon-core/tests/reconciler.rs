//! Integration tests for get-or-create of items and triggers.

mod common;

use common::MockApi;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use virtmon_core::config::TriggerConfig;
use virtmon_core::zabbix::{CycleScope, ObjectReconciler, RemoteItemRef, TriggerState};
use virtmon_core::{Item, ThresholdRule, VirtmonError};

fn item(key: &str, value: f64) -> Item {
    Item { key: key.to_string(), name: key.to_string(), value, clock: None }
}

fn reconciler(api: Arc<MockApi>) -> ObjectReconciler {
    ObjectReconciler::new(api, "node-1", TriggerConfig::default())
}

fn read_rule() -> ThresholdRule {
    ThresholdRule::new("read_requests", "read_requests_ps", 100.0)
}

#[tokio::test]
async fn test_ensure_item_is_idempotent() {
    let api = Arc::new(MockApi::with_hosts(&["node-1"]));
    let reconciler = reconciler(api.clone());
    let scope = CycleScope::new();
    let item = item("diskstats.read_requests_ps[instance-1,vda]", 120.0);

    let first = reconciler.ensure_item(&scope, &item).await.unwrap();
    let second = reconciler.ensure_item(&scope, &item).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(api.created_items(), 1);
    // host resolved once for the cycle
    assert_eq!(api.host_lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_existing_item_is_reused() {
    let api = Arc::new(MockApi::with_hosts(&["node-1"]));
    api.items.lock().unwrap().push(RemoteItemRef {
        item_id: "999".to_string(),
        key: "state.state[instance-1]".to_string(),
    });
    let reconciler = reconciler(api.clone());

    let found = reconciler
        .ensure_item(&CycleScope::new(), &item("state.state[instance-1]", 1.0))
        .await
        .unwrap();

    assert_eq!(found.item_id, "999");
    assert_eq!(api.created_items(), 0);
}

#[tokio::test]
async fn test_concurrent_ensure_item_creates_once() {
    let api = Arc::new(MockApi::with_hosts(&["node-1"]));
    let reconciler = Arc::new(reconciler(api.clone()));
    let scope = Arc::new(CycleScope::new());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let reconciler = reconciler.clone();
        let scope = scope.clone();
        tasks.push(tokio::spawn(async move {
            let item = item("netstats.rx_bytes_ps[instance-1,vnet0]", 1.0);
            reconciler.ensure_item(&scope, &item).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(api.created_items(), 1);
}

#[tokio::test]
async fn test_missing_host_creates_nothing() {
    let api = Arc::new(MockApi::with_hosts(&["other-node"]));
    let reconciler = reconciler(api.clone());
    let scope = CycleScope::new();
    let state = TriggerState::new();
    let item = item("diskstats.read_requests_ps[instance-1,vda]", 120.0);

    let err = reconciler.ensure_item(&scope, &item).await.unwrap_err();
    assert!(matches!(err, VirtmonError::HostNotFound { .. }));

    let err = reconciler.ensure_trigger(&scope, &state, &item, &read_rule()).await.unwrap_err();
    assert!(matches!(err, VirtmonError::HostNotFound { .. }));

    assert_eq!(api.created_items(), 0);
    assert_eq!(api.created_triggers(), 0);
    assert_eq!(api.item_lookups.load(Ordering::SeqCst), 0);
    assert_eq!(api.host_lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ambiguous_host_creates_nothing() {
    let api = Arc::new(MockApi::with_hosts(&["node-1", "node-1"]));
    let reconciler = reconciler(api.clone());

    let err = reconciler
        .ensure_item(&CycleScope::new(), &item("state.state[instance-1]", 1.0))
        .await
        .unwrap_err();

    assert!(matches!(err, VirtmonError::AmbiguousHost { count: 2, .. }));
    assert_eq!(api.created_items(), 0);
}

#[tokio::test]
async fn test_host_is_resolved_again_next_cycle() {
    let api = Arc::new(MockApi::with_hosts(&["node-1"]));
    let reconciler = reconciler(api.clone());
    let item = item("state.state[instance-1]", 1.0);

    reconciler.ensure_item(&CycleScope::new(), &item).await.unwrap();
    reconciler.ensure_item(&CycleScope::new(), &item).await.unwrap();

    assert_eq!(api.host_lookups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_trigger_created_once_per_run() {
    let api = Arc::new(MockApi::with_hosts(&["node-1"]));
    let reconciler = reconciler(api.clone());
    let state = TriggerState::new();
    let item = item("diskstats.read_requests_ps[instance-1,vda]", 120.0);

    let rule = read_rule();
    let first = reconciler.ensure_trigger(&CycleScope::new(), &state, &item, &rule).await.unwrap();
    let second = reconciler.ensure_trigger(&CycleScope::new(), &state, &item, &rule).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(api.created_triggers(), 1);
    // second call answered from the run state
    assert_eq!(api.trigger_lookups.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.expression,
        "{node-1:diskstats.read_requests_ps[instance-1,vda].min(300s)}>100"
    );
}

#[tokio::test]
async fn test_existing_trigger_is_adopted() {
    let api = Arc::new(MockApi::with_hosts(&["node-1"]));
    let reconciler = reconciler(api.clone());
    let item = item("diskstats.read_requests_ps[instance-1,vda]", 120.0);
    let expression = reconciler.trigger_for(&item, &read_rule()).expression;
    api.triggers.lock().unwrap().push(virtmon_core::zabbix::RemoteTriggerRef {
        trigger_id: "42".to_string(),
        expression: expression.clone(),
    });

    // fresh run state, as after a restart
    let state = TriggerState::new();
    let rule = read_rule();
    let found = reconciler.ensure_trigger(&CycleScope::new(), &state, &item, &rule).await.unwrap();

    assert_eq!(found.trigger_id, "42");
    assert_eq!(api.created_triggers(), 0);
    assert_eq!(state.get(&expression).await.unwrap().trigger_id, "42");
}
