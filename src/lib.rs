pub mod agent;
pub mod api;
pub mod config;
pub mod metrics;
pub mod platform;
pub mod role;
pub mod runner;
pub mod storage;
pub mod util;
