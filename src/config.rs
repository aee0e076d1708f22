use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::agent::Strategy;
use crate::role::Requirement;
use crate::runner::StoragePolicy;

/// Configuration of one device agent
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentConfig {
    /// Base URL of the coordination point
    #[serde(default = "default_platform_url")]
    pub platform_url: String,

    /// Bearer token presented to the coordination point
    pub token: Option<String>,

    /// Device name, defaults to the system hostname
    pub hostname: Option<String>,

    #[serde(default)]
    pub strategy: Strategy,

    /// Capability tags of this device, e.g. `["CAMERA", "gpu"]`
    #[serde(default)]
    pub features: Vec<Requirement>,

    /// Seconds between admission passes
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    #[serde(default)]
    pub runner: RunnerConfig,

    pub log_level: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            platform_url: default_platform_url(),
            token: None,
            hostname: None,
            strategy: Strategy::default(),
            features: Vec::new(),
            period_secs: default_period_secs(),
            runner: RunnerConfig::default(),
            log_level: None,
        }
    }
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        load_toml(path.as_ref())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs.max(1))
    }
}

/// Execution backends of a device
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of in-process roles executing at once
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Grace period for in-process roles to observe cancellation
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Container backend, disabled when absent
    pub container: Option<ContainerConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            stop_timeout_ms: default_stop_timeout_ms(),
            container: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ContainerConfig {
    /// Docker Engine endpoint, e.g. `tcp://127.0.0.1:2375`
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// Coordination point address as seen from inside containers; defaults
    /// to the host of `platform_url`
    pub platform_host: Option<String>,

    #[serde(default)]
    pub prune_storage: bool,

    #[serde(default = "default_storage_limit_bytes")]
    pub storage_limit_bytes: u64,

    #[serde(default = "default_prune_until")]
    pub prune_until: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_host: default_docker_host(),
            platform_host: None,
            prune_storage: false,
            storage_limit_bytes: default_storage_limit_bytes(),
            prune_until: default_prune_until(),
        }
    }
}

impl ContainerConfig {
    pub fn storage_policy(&self) -> StoragePolicy {
        StoragePolicy {
            prune: self.prune_storage,
            limit_bytes: self.storage_limit_bytes,
            until: self.prune_until.clone(),
        }
    }
}

/// Configuration of the coordination point
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Required bearer token, authentication is disabled when absent
    pub auth_token: Option<String>,

    #[serde(default)]
    pub enable_cors: bool,

    /// Drop metric samples older than this many seconds
    pub metrics_retention_secs: Option<u64>,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// JSON array of service descriptions loaded at startup
    pub services_file: Option<PathBuf>,

    pub log_level: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_token: None,
            enable_cors: false,
            metrics_retention_secs: None,
            cleanup_interval_secs: default_cleanup_interval_secs(),
            services_file: None,
            log_level: None,
        }
    }
}

impl PlatformConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        load_toml(path.as_ref())
    }
}

fn load_toml<T: DeserializeOwned + std::fmt::Debug>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("invalid configuration in {}", path.display()))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

fn default_platform_url() -> String {
    format!(
        "http://{}:{}",
        crate::util::get_platform_addr(),
        crate::util::get_platform_port()
    )
}

fn default_period_secs() -> u64 {
    5
}

fn default_pool_size() -> usize {
    10
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_docker_host() -> String {
    "tcp://127.0.0.1:2375".to_string()
}

fn default_storage_limit_bytes() -> u64 {
    StoragePolicy::default().limit_bytes
}

fn default_prune_until() -> String {
    StoragePolicy::default().until
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::util::DEFAULT_PLATFORM_PORT))
}

fn default_cleanup_interval_secs() -> u64 {
    60
}
