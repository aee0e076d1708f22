//! Per-key subscriber sets with sticky delivery
//!
//! A set holds at most one subscriber per origin address. Messages go to the
//! subscriber that received the previous message while it stays registered,
//! otherwise to the subscriber with the lowest origin address.

use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// A registered consumer of one key
#[derive(Debug)]
pub enum Subscriber {
    /// Receives every message routed to it until it disconnects
    Recurring {
        origin: String,
        sink: mpsc::UnboundedSender<Bytes>,
    },

    /// Receives exactly one message, then leaves the set
    SingleShot {
        origin: String,
        sink: oneshot::Sender<Bytes>,
    },
}

impl Subscriber {
    /// Create a recurring subscriber and the receiving end of its stream
    pub fn recurring(origin: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (sink, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber::Recurring {
            origin: origin.into(),
            sink,
        };
        (subscriber, rx)
    }

    /// Create a single-shot subscriber and the receiver for its one message
    pub fn single_shot(origin: impl Into<String>) -> (Self, oneshot::Receiver<Bytes>) {
        let (sink, rx) = oneshot::channel();
        let subscriber = Subscriber::SingleShot {
            origin: origin.into(),
            sink,
        };
        (subscriber, rx)
    }

    pub fn origin(&self) -> &str {
        match self {
            Subscriber::Recurring { origin, .. } | Subscriber::SingleShot { origin, .. } => origin,
        }
    }
}

/// Result of routing one message through a [`SubscriberSet`]
#[derive(Debug, PartialEq)]
pub enum Delivery {
    /// Handed to the subscriber at `origin`
    Delivered { origin: String },

    /// The chosen subscriber failed while receiving; it was evicted and the
    /// message is gone
    Failed { origin: String },

    /// Nobody is listening, the message is handed back to the caller
    NoSubscriber(Bytes),
}

/// Subscribers of a single key
#[derive(Debug, Default)]
pub struct SubscriberSet {
    subscribers: BTreeMap<String, Subscriber>,
    last: Option<String>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber, replacing any previous one from the same origin
    pub fn add(&mut self, subscriber: Subscriber) {
        let origin = subscriber.origin().to_string();
        if self.subscribers.insert(origin.clone(), subscriber).is_some() {
            debug!(%origin, "replaced existing subscriber slot");
        }
    }

    pub fn remove(&mut self, origin: &str) -> Option<Subscriber> {
        if self.last.as_deref() == Some(origin) {
            self.last = None;
        }
        self.subscribers.remove(origin)
    }

    pub fn number_of_subscribers(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Route `value` to one subscriber
    ///
    /// A subscriber whose receiver is gone is only noticed when it is picked;
    /// it is evicted then and the message is dropped.
    pub fn publish(&mut self, value: Bytes) -> Delivery {
        let Some(origin) = self.pick() else {
            return Delivery::NoSubscriber(value);
        };
        let Some(subscriber) = self.subscribers.remove(&origin) else {
            return Delivery::NoSubscriber(value);
        };

        match subscriber {
            Subscriber::Recurring { origin, sink } => match sink.send(value) {
                Ok(()) => {
                    self.last = Some(origin.clone());
                    let subscriber = Subscriber::Recurring {
                        origin: origin.clone(),
                        sink,
                    };
                    self.subscribers.insert(origin.clone(), subscriber);
                    Delivery::Delivered { origin }
                }
                Err(_) => {
                    warn!(%origin, "delivery failed, dropping subscriber and message");
                    self.last = None;
                    Delivery::Failed { origin }
                }
            },
            Subscriber::SingleShot { origin, sink } => {
                if self.last.as_deref() == Some(origin.as_str()) {
                    self.last = None;
                }
                match sink.send(value) {
                    Ok(()) => {
                        trace!(%origin, "single-shot subscriber served");
                        Delivery::Delivered { origin }
                    }
                    Err(_) => {
                        warn!(%origin, "single-shot delivery failed, dropping message");
                        Delivery::Failed { origin }
                    }
                }
            }
        }
    }

    /// Drop every subscriber, which ends their streams
    pub fn complete_all(&mut self) {
        self.subscribers.clear();
        self.last = None;
    }

    fn pick(&self) -> Option<String> {
        self.last
            .as_ref()
            .filter(|origin| self.subscribers.contains_key(origin.as_str()))
            .cloned()
            .or_else(|| self.subscribers.keys().next().cloned())
    }
}
