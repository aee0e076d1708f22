//! Per-key mailboxes
//!
//! A key either buffers messages in its backlog (nobody subscribed) or routes
//! them straight to its [`SubscriberSet`]. Every enqueue and dequeue is
//! mirrored into the `<key>_queue_size` metric, so summing that metric over
//! all time gives the backlog length.
//!
//! The backlog and subscriber set of a key share one mutex; the
//! "check subscribers, then deliver or enqueue" decision is atomic per key
//! and never touches another key's lock.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::subscribers::{Delivery, Subscriber, SubscriberSet};
use crate::metrics::MetricsStore;

/// Suffix of the metric that tracks backlog depth
pub const QUEUE_SIZE_SUFFIX: &str = "_queue_size";

/// Name of the depth metric for `key`
pub fn queue_size_key(key: &str) -> String {
    format!("{key}{QUEUE_SIZE_SUFFIX}")
}

#[derive(Debug, Default)]
struct Mailbox {
    backlog: VecDeque<Bytes>,
    subscribers: SubscriberSet,
}

/// Queue-based publish/subscribe over string keys
#[derive(Debug)]
pub struct QueueStore {
    mailboxes: DashMap<String, Arc<Mutex<Mailbox>>>,
    metrics: Arc<MetricsStore>,
}

impl QueueStore {
    pub fn new(metrics: Arc<MetricsStore>) -> Self {
        Self {
            mailboxes: DashMap::new(),
            metrics,
        }
    }

    /// Deliver `value` to a subscriber of `key`, or buffer it
    pub fn publish(&self, key: &str, value: Bytes) {
        let mailbox = self.mailbox(key);
        let mut mailbox = mailbox.lock();

        let value = if mailbox.subscribers.is_empty() {
            value
        } else {
            match mailbox.subscribers.publish(value) {
                Delivery::NoSubscriber(value) => value,
                Delivery::Delivered { origin } => {
                    trace!(key, %origin, "delivered message");
                    return;
                }
                Delivery::Failed { .. } => return,
            }
        };

        mailbox.backlog.push_back(value);
        self.record_depth_change(key, 1.0);
        trace!(key, depth = mailbox.backlog.len(), "buffered message");
    }

    /// Register `subscriber` on `key`; a pending backlog entry is routed
    /// through the subscriber set right away
    pub fn add_subscriber(&self, key: &str, subscriber: Subscriber) {
        let mailbox = self.mailbox(key);
        let mut mailbox = mailbox.lock();

        debug!(key, origin = subscriber.origin(), "subscriber attached");
        mailbox.subscribers.add(subscriber);

        let Some(oldest) = mailbox.backlog.pop_front() else {
            return;
        };
        self.record_depth_change(key, -1.0);

        if let Delivery::NoSubscriber(oldest) = mailbox.subscribers.publish(oldest) {
            mailbox.backlog.push_front(oldest);
            self.record_depth_change(key, 1.0);
        }
    }

    /// Stream every message routed to `origin` on `key`
    pub fn subscribe(&self, key: &str, origin: &str) -> mpsc::UnboundedReceiver<Bytes> {
        let (subscriber, rx) = Subscriber::recurring(origin);
        self.add_subscriber(key, subscriber);
        rx
    }

    /// Take one message from `key`, now if one is buffered or else whenever
    /// the next one is routed here
    pub fn get_one(&self, key: &str, origin: &str) -> oneshot::Receiver<Bytes> {
        let (subscriber, rx) = Subscriber::single_shot(origin);
        self.add_subscriber(key, subscriber);
        rx
    }

    /// Number of buffered messages for `key`
    pub fn queue_len(&self, key: &str) -> usize {
        self.mailboxes
            .get(key)
            .map(|mailbox| mailbox.lock().backlog.len())
            .unwrap_or(0)
    }

    /// Number of live subscribers for `key`
    pub fn number_of_subscribers(&self, key: &str) -> usize {
        self.mailboxes
            .get(key)
            .map(|mailbox| mailbox.value().lock().subscribers.number_of_subscribers())
            .unwrap_or(0)
    }

    /// Keys that have seen a publish or a subscriber
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.mailboxes.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Total messages waiting across all keys
    pub fn total_backlog(&self) -> usize {
        self.mailboxes
            .iter()
            .map(|entry| entry.value().lock().backlog.len())
            .sum()
    }

    /// End every subscriber stream (server shutdown)
    pub fn complete_all(&self) {
        for entry in self.mailboxes.iter() {
            entry.value().lock().subscribers.complete_all();
        }
        debug!("completed all queue subscribers");
    }

    fn mailbox(&self, key: &str) -> Arc<Mutex<Mailbox>> {
        if let Some(mailbox) = self.mailboxes.get(key) {
            return Arc::clone(mailbox.value());
        }
        Arc::clone(self.mailboxes.entry(key.to_string()).or_default().value())
    }

    fn record_depth_change(&self, key: &str, delta: f64) {
        self.metrics.store(&queue_size_key(key), delta, Utc::now());
    }
}
