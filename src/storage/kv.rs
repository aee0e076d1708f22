//! Last-write-wins key/value store shared between roles

use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

#[derive(Debug, Default)]
pub struct KeyValueStore {
    entries: DashMap<String, Bytes>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, key: &str, value: Bytes) {
        trace!(key, len = value.len(), "storing value");
        self.entries.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
