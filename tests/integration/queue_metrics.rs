//! Queue routing and the depth metric it feeds

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use colony::agent::Strategy;
use colony::metrics::{Aggregation, ThresholdType};
use colony::platform::Platform;
use colony::storage::queue_size_key;
use pretty_assertions::assert_eq;

use crate::helpers;

fn depth(platform: &Platform, key: &str) -> f64 {
    platform
        .metrics()
        .aggregate(&queue_size_key(key), DateTime::<Utc>::MIN_UTC, Aggregation::Sum)
        .unwrap()
}

#[tokio::test]
async fn test_new_subscriber_drains_oldest_backlog_entry() {
    let platform = helpers::platform();
    for message in ["m1", "m2", "m3"] {
        platform.publish("K", Bytes::from(message));
    }
    assert_eq!(depth(&platform, "K"), 3.0);

    let mut rx = platform.subscribe("K", "10.0.0.2");

    assert_eq!(rx.recv().await, Some(Bytes::from("m1")));
    assert_eq!(depth(&platform, "K"), 2.0);
    assert_eq!(platform.queues().queue_len("K"), 2);
}

#[tokio::test]
async fn test_subscriber_receives_later_messages_directly() {
    let platform = helpers::platform();
    let mut rx = platform.subscribe("K", "10.0.0.2");

    platform.publish("K", Bytes::from("live"));

    assert_eq!(rx.recv().await, Some(Bytes::from("live")));
    assert_eq!(depth(&platform, "K"), 0.0);
    assert_eq!(platform.queues().queue_len("K"), 0);
}

#[tokio::test]
async fn test_single_shot_subscriber_leaves_after_one_message() {
    let platform = helpers::platform();
    let rx = platform.get_one("K", "10.0.0.2");
    assert_eq!(platform.queues().number_of_subscribers("K"), 1);

    platform.publish("K", Bytes::from("first"));
    platform.publish("K", Bytes::from("second"));

    assert_eq!(rx.await.unwrap(), Bytes::from("first"));
    assert_eq!(platform.queues().number_of_subscribers("K"), 0);
    assert_eq!(platform.queues().queue_len("K"), 1);
}

#[tokio::test]
async fn test_single_shot_takes_buffered_message_immediately() {
    let platform = helpers::platform();
    platform.publish("K", Bytes::from("waiting"));

    let rx = platform.get_one("K", "10.0.0.2");

    assert_eq!(rx.await.unwrap(), Bytes::from("waiting"));
    assert_eq!(depth(&platform, "K"), 0.0);
}

#[tokio::test]
async fn test_gone_subscriber_is_evicted_and_message_dropped() {
    let platform = helpers::platform();
    let gone = platform.subscribe("K", "10.0.0.2");
    let mut live = platform.subscribe("K", "10.0.0.3");
    drop(gone);

    platform.publish("K", Bytes::from("x"));

    // routed to the lower origin, which is gone: evicted, message dropped
    assert_eq!(platform.queues().number_of_subscribers("K"), 1);
    assert_eq!(platform.queues().queue_len("K"), 0);
    assert_eq!(depth(&platform, "K"), 0.0);
    assert!(live.try_recv().is_err());

    platform.publish("K", Bytes::from("y"));
    assert_eq!(live.recv().await, Some(Bytes::from("y")));
}

#[tokio::test]
async fn test_new_subscription_from_same_origin_replaces_old_one() {
    let platform = helpers::platform();
    let mut old = platform.subscribe("K", "10.0.0.2");
    let mut new = platform.subscribe("K", "10.0.0.2");

    platform.publish("K", Bytes::from("x"));

    assert_eq!(platform.queues().number_of_subscribers("K"), 1);
    assert_eq!(new.recv().await, Some(Bytes::from("x")));
    assert_eq!(old.recv().await, None);
}

#[tokio::test]
async fn test_queue_depth_gates_a_lazy_consumer() {
    let platform = helpers::platform();
    platform.publish("jobs_in", Bytes::from("job-1"));
    assert!(!platform.query_metric(
        &queue_size_key("jobs_in"),
        0.0,
        ThresholdType::LessThan,
        DateTime::<Utc>::MIN_UTC,
    ));

    let handled = Arc::new(AtomicUsize::new(0));
    let runner = helpers::runner();
    let lazy = helpers::finder(
        &platform,
        Strategy::Lazy,
        &[],
        &runner,
        helpers::registry(Arc::clone(&handled)),
    );
    let consumer = helpers::role("jobs", "worker", &[], &["jobs_in_queue_size[1h] < 0"]);

    let report = lazy.try_roles(&[consumer]).await;
    assert_eq!(report.started, vec!["jobs".to_string()]);

    helpers::wait_until(|| handled.load(Ordering::SeqCst) == 1).await;
    assert_eq!(depth(&platform, "jobs_in"), 0.0);

    runner.shutdown().await;
}
