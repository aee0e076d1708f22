//! Helper functions for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use colony::agent::{RoleFinder, Strategy};
use colony::config::RunnerConfig;
use colony::platform::{LocalClient, Platform, PlatformClient};
use colony::role::{Metric, RoleDefinition, RolePayload, RoleProgram, RoleRegistry};
use colony::runner::RoleRunner;

pub const HOSTNAME: &str = "edge-1";

pub fn platform() -> Arc<Platform> {
    Arc::new(Platform::new())
}

pub fn client(platform: &Arc<Platform>, origin: &str) -> Arc<dyn PlatformClient> {
    Arc::new(LocalClient::new(Arc::clone(platform), origin))
}

/// Registry with an `idle` program that waits for cancellation and a
/// `worker` program that counts messages on `<role_id>_in`
pub fn registry(handled: Arc<AtomicUsize>) -> Arc<RoleRegistry> {
    let mut registry = RoleRegistry::new();
    registry.register("idle", |_| {
        Ok(RoleProgram::builder()
            .body(|cancel| async move {
                cancel.cancelled().await;
                Ok(())
            })
            .build())
    });
    registry.register("worker", move |ctx| {
        let handled = Arc::clone(&handled);
        Ok(RoleProgram::builder()
            .subscribe(format!("{}_in", ctx.role_id()), move |_message| {
                let handled = Arc::clone(&handled);
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build())
    });
    Arc::new(registry)
}

pub fn role(
    role_id: &str,
    executable: &str,
    requirements: &[&str],
    metrics: &[&str],
) -> RoleDefinition {
    RoleDefinition {
        role_id: role_id.to_string(),
        requirements: requirements.iter().map(|r| r.parse().unwrap()).collect(),
        metrics: metrics.iter().map(|m| m.parse::<Metric>().unwrap()).collect(),
        payload: RolePayload::InProcess {
            executable: executable.to_string(),
        },
    }
}

pub fn runner() -> Arc<RoleRunner> {
    Arc::new(RoleRunner::new(&RunnerConfig::default()))
}

pub fn finder(
    platform: &Arc<Platform>,
    strategy: Strategy,
    features: &[&str],
    runner: &Arc<RoleRunner>,
    registry: Arc<RoleRegistry>,
) -> RoleFinder {
    RoleFinder::new(
        HOSTNAME,
        strategy,
        features.iter().map(|f| f.parse().unwrap()).collect(),
        client(platform, "10.0.0.1"),
        Arc::clone(runner),
        registry,
    )
}

/// Poll `condition` every 10ms, failing the test after 5s
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
