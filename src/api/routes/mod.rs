//! HTTP route handlers

pub mod health;
pub mod kv;
pub mod metrics;
pub mod queues;
pub mod services;
pub mod stats;
