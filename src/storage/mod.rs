//! Shared state held by the coordination point
//!
//! Everything here lives in memory for the lifetime of the platform process:
//!
//! - [`KeyValueStore`]: plain last-write-wins values
//! - [`QueueStore`]: per-key mailboxes with sticky subscriber routing
//! - [`ServiceStorage`]: service descriptions and their change feed

pub mod kv;
pub mod queue;
pub mod services;
pub mod subscribers;

pub use kv::KeyValueStore;
pub use queue::{QUEUE_SIZE_SUFFIX, QueueStore, queue_size_key};
pub use services::ServiceStorage;
pub use subscribers::{Delivery, Subscriber, SubscriberSet};
