//! Device start, periodic passes and teardown

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use colony::agent::{Device, DeviceConfig, DeviceHandle, DeviceState, Strategy};
use colony::platform::Platform;
use colony::role::ServiceDescription;
use pretty_assertions::assert_eq;

use crate::helpers::{self, HOSTNAME};

fn service(id: &str, roles: &[&str]) -> ServiceDescription {
    ServiceDescription {
        id: id.to_string(),
        roles: roles
            .iter()
            .map(|role_id| helpers::role(role_id, "idle", &[], &[]))
            .collect(),
    }
}

async fn start(platform: &Arc<Platform>, period: Duration) -> DeviceHandle {
    let device = Device::new(
        DeviceConfig {
            hostname: HOSTNAME.to_string(),
            strategy: Strategy::Eager,
            features: Default::default(),
            period,
        },
        helpers::client(platform, "10.0.0.9"),
        helpers::runner(),
        helpers::registry(Arc::new(AtomicUsize::new(0))),
    );
    device.start().await.unwrap()
}

async fn role_ids(handle: &DeviceHandle) -> Vec<String> {
    handle.current_roles().await.unwrap().into_keys().collect()
}

#[tokio::test]
async fn test_registration_starts_known_services() {
    let platform = helpers::platform();
    platform.add_service(service("vision", &["detector", "tracker"]));

    let handle = start(&platform, Duration::from_secs(60)).await;

    assert_eq!(handle.state(), DeviceState::Started);
    assert_eq!(role_ids(&handle).await, vec!["detector", "tracker"]);
    handle.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_service_added_later_is_picked_up_by_the_timer() {
    let platform = helpers::platform();
    let handle = start(&platform, Duration::from_millis(50)).await;
    assert!(role_ids(&handle).await.is_empty());

    platform.add_service(service("audio", &["recorder"]));

    tokio::time::timeout(Duration::from_secs(5), async {
        while role_ids(&handle).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("periodic pass never started the new role");

    assert_eq!(role_ids(&handle).await, vec!["recorder"]);
    handle.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_explicit_pass_reports_changes() {
    let platform = helpers::platform();
    let handle = start(&platform, Duration::from_secs(60)).await;

    platform.add_service(service("audio", &["recorder"]));

    let started = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let report = handle.try_run_roles().await.unwrap();
            if !report.started.is_empty() {
                break report.started;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("service change never reached the device");

    assert_eq!(started, vec!["recorder".to_string()]);
    assert!(handle.try_run_roles().await.unwrap().is_empty());
    handle.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_final() {
    let platform = helpers::platform();
    platform.add_service(service("vision", &["detector"]));
    let handle = start(&platform, Duration::from_secs(60)).await;
    let other = handle.clone();

    handle.disconnect().await.unwrap();
    other.disconnect().await.unwrap();

    assert_eq!(handle.state(), DeviceState::Disconnected);
    assert!(handle.current_roles().await.is_err());
    handle.wait_for_shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_disconnects_both_return() {
    let platform = helpers::platform();
    platform.add_service(service("vision", &["detector"]));
    let handle = start(&platform, Duration::from_secs(60)).await;
    let other = handle.clone();

    let (a, b) = tokio::join!(handle.disconnect(), other.disconnect());

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(handle.state(), DeviceState::Disconnected);
}
