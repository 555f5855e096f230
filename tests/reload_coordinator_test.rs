// tests/reload_coordinator_test.rs

//! Integration coverage for the reload coordinator's concurrency rules —
//! one in-flight reload at a time unless forced, per-round dedup of
//! subtasks by key, and registry-driven handler execution end to end
//! (spec.md §4.9).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use clustercache::error::ClusterError;
use clustercache::reload::{Coordinator, Registry, TaskState};

#[tokio::test]
async fn concurrent_reload_without_force_is_rejected() {
    let coordinator = Coordinator::new();
    let mut first_token = None;
    coordinator.prepare_reload(&mut first_token, "records", false).unwrap();

    let mut second_token = None;
    let err = coordinator.prepare_reload(&mut second_token, "records", false).unwrap_err();
    assert!(matches!(err, ClusterError::ReloadInProgress(_)));
}

#[tokio::test]
async fn registry_and_coordinator_drive_a_handler_to_success() {
    let registry = Registry::new();
    let coordinator = Coordinator::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    registry
        .register_config(
            "storage.records",
            "storage.yaml",
            None,
            Arc::new(move |ctx| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ctx.filename, "storage.yaml");
                Ok(())
            }),
            vec!["proxy.config.storage.filename".to_string()],
        )
        .unwrap();

    let mut token = None;
    let main_task = coordinator.prepare_reload(&mut token, "rpc", false).unwrap();
    registry.execute_reload("storage.records", &coordinator).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(main_task.children().len(), 1);
    assert_eq!(main_task.children()[0].state(), TaskState::Success);
}

#[tokio::test]
async fn a_second_execute_reload_for_the_same_key_is_deduped_within_one_round() {
    let registry = Registry::new();
    let coordinator = Coordinator::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    registry
        .register_config(
            "records",
            "records.yaml",
            None,
            Arc::new(move |_ctx| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            vec![],
        )
        .unwrap();

    let mut token = None;
    coordinator.prepare_reload(&mut token, "rpc", false).unwrap();
    registry.execute_reload("records", &coordinator).unwrap();
    registry.execute_reload("records", &coordinator).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forcing_a_reload_marks_the_superseded_task_timeout() {
    let coordinator = Coordinator::new();
    let mut first_token = None;
    let first = coordinator.prepare_reload(&mut first_token, "rpc", false).unwrap();

    let mut second_token = None;
    coordinator.prepare_reload(&mut second_token, "rpc", true).unwrap();

    assert_eq!(first.state(), TaskState::Timeout);
    assert_ne!(first_token, second_token);
}
