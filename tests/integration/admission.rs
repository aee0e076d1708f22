//! Admission decisions made by the role finder

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use colony::agent::Strategy;
use colony::platform::client::workload_key;
use pretty_assertions::assert_eq;

use crate::helpers::{self, HOSTNAME};

fn registry() -> Arc<colony::role::RoleRegistry> {
    helpers::registry(Arc::new(AtomicUsize::new(0)))
}

#[tokio::test]
async fn test_role_needs_every_required_feature() {
    let platform = helpers::platform();
    let detector = helpers::role("detector", "idle", &["CAMERA"], &[]);

    let runner = helpers::runner();
    let bare = helpers::finder(&platform, Strategy::Eager, &[], &runner, registry());
    let report = bare.try_roles(std::slice::from_ref(&detector)).await;
    assert!(report.started.is_empty());
    assert!(!runner.is_running("detector"));

    let camera_runner = helpers::runner();
    let camera = helpers::finder(
        &platform,
        Strategy::Eager,
        &["CAMERA", "zone-a"],
        &camera_runner,
        registry(),
    );
    let report = camera.try_roles(&[detector]).await;
    assert_eq!(report.started, vec!["detector".to_string()]);
    assert!(camera_runner.is_running("detector"));

    camera_runner.shutdown().await;
}

#[tokio::test]
async fn test_lazy_starts_only_while_a_gate_is_broken() {
    let platform = helpers::platform();
    let scaler = helpers::role("scaler", "idle", &[], &["throughput[100s] >= 100"]);

    // no samples: the sum is 0, the gate is broken
    let runner = helpers::runner();
    let lazy = helpers::finder(&platform, Strategy::Lazy, &[], &runner, registry());
    let report = lazy.try_roles(std::slice::from_ref(&scaler)).await;
    assert_eq!(report.started, vec!["scaler".to_string()]);
    runner.shutdown().await;

    // the window now sums to 100, which meets the gate
    platform.store_metric("throughput", 60.0, None);
    platform.store_metric("throughput", 40.0, None);
    let runner = helpers::runner();
    let lazy = helpers::finder(&platform, Strategy::Lazy, &[], &runner, registry());
    let report = lazy.try_roles(&[scaler]).await;
    assert!(report.started.is_empty());
    assert!(!runner.is_running("scaler"));
}

#[tokio::test]
async fn test_less_than_gate_is_met_at_the_threshold() {
    let platform = helpers::platform();
    platform.store_metric("latency", 5.0, None);
    let role = helpers::role("cache", "idle", &[], &["latency[1h] < 5"]);

    let runner = helpers::runner();
    let lazy = helpers::finder(&platform, Strategy::Lazy, &[], &runner, registry());
    let report = lazy.try_roles(&[role]).await;

    // "<" compares with <=, so a sum equal to the threshold counts as met
    assert!(report.started.is_empty());
}

#[tokio::test]
async fn test_eager_ignores_gates_and_never_stops() {
    let platform = helpers::platform();
    platform.store_metric("throughput", 500.0, None);
    let role = helpers::role("scaler", "idle", &[], &["throughput[100s] >= 100"]);

    let runner = helpers::runner();
    let eager = helpers::finder(&platform, Strategy::Eager, &[], &runner, registry());

    let first = eager.try_roles(std::slice::from_ref(&role)).await;
    assert_eq!(first.started, vec!["scaler".to_string()]);

    let second = eager.try_roles(&[role]).await;
    assert!(second.is_empty());
    assert!(runner.is_running("scaler"));

    runner.shutdown().await;
}

#[tokio::test]
async fn test_lazy_stops_idle_role_once_gates_recover() {
    let platform = helpers::platform();
    let role = helpers::role("scaler", "idle", &[], &["throughput[100s] >= 100"]);

    let runner = helpers::runner();
    let lazy = helpers::finder(&platform, Strategy::Lazy, &[], &runner, registry());
    let first = lazy.try_roles(std::slice::from_ref(&role)).await;
    assert_eq!(first.started, vec!["scaler".to_string()]);

    platform.store_metric("throughput", 150.0, None);
    let second = lazy.try_roles(&[role]).await;

    assert_eq!(second.stopped, vec!["scaler".to_string()]);
    assert!(!runner.is_running("scaler"));
}

#[tokio::test]
async fn test_lazy_keeps_ungated_roles() {
    let platform = helpers::platform();
    let role = helpers::role("logger", "idle", &[], &[]);

    let runner = helpers::runner();
    let lazy = helpers::finder(&platform, Strategy::Lazy, &[], &runner, registry());
    lazy.try_roles(std::slice::from_ref(&role)).await;
    let second = lazy.try_roles(&[role]).await;

    assert!(second.stopped.is_empty());
    assert!(runner.is_running("logger"));
    runner.shutdown().await;
}

#[tokio::test]
async fn test_recent_workload_keeps_role_alive() {
    let platform = helpers::platform();
    let role = helpers::role("scaler", "idle", &[], &["throughput[100s] >= 100"]);

    let runner = helpers::runner();
    let lazy = helpers::finder(&platform, Strategy::Lazy, &[], &runner, registry());
    lazy.try_roles(std::slice::from_ref(&role)).await;

    platform.store_metric("throughput", 150.0, None);
    platform.store_metric(&workload_key(HOSTNAME, "scaler"), 1.0, None);
    let second = lazy.try_roles(&[role]).await;

    assert!(second.stopped.is_empty());
    assert!(runner.is_running("scaler"));
    runner.shutdown().await;
}
