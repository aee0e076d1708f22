use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colony::{
    agent::{Device, DeviceConfig, Strategy},
    config::AgentConfig,
    platform::{PlatformClient, RemoteClient},
    role::{Requirement, RoleProgram, RoleRegistry},
    runner::{ContainerRuntime, ContainerSettings, DockerEngine, RoleRunner},
    util,
};
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long)]
    file: Option<String>,

    /// Coordination point URL, e.g. http://10.0.0.1:5555
    #[arg(long)]
    platform: Option<String>,

    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Comma separated capability tags, e.g. CAMERA,zone-a
    #[arg(long, value_delimiter = ',')]
    features: Option<Vec<String>>,

    #[arg(long)]
    hostname: Option<String>,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![("colony", level), ("agent", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

/// In-process programs this agent can run
fn registry() -> RoleRegistry {
    let mut registry = RoleRegistry::new();
    registry.register("echo", |ctx| {
        let output = ctx.publisher(format!("{}_out", ctx.role_id()));
        let input = format!("{}_in", ctx.role_id());
        Ok(RoleProgram::builder()
            .subscribe(input, move |message| {
                let output = output.clone();
                async move { Ok(output.publish(message).await?) }
            })
            .build())
    });
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.file {
        Some(file) => AgentConfig::load(file)?,
        None => AgentConfig::default(),
    };
    if let Some(platform) = args.platform.clone() {
        config.platform_url = platform;
    }
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(features) = args.features.clone() {
        config.features = features.into_iter().map(Requirement::from).collect();
    }
    if args.hostname.is_some() {
        config.hostname = args.hostname.clone();
    }
    if config.token.is_none() {
        config.token = util::get_token();
    }

    let level = config
        .log_level
        .as_deref()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::INFO);
    init(level);
    trace!("started with args: {args:?}");

    let hostname = config.hostname.clone().unwrap_or_else(util::hostname);

    let client = RemoteClient::new(&config.platform_url, config.token.clone())
        .context("failed to build platform client")?;
    match client.health().await {
        Ok(_) => info!("coordination point at {} is up", config.platform_url),
        Err(e) => warn!("coordination point not healthy yet: {e}"),
    }
    let client: Arc<dyn PlatformClient> = Arc::new(client);

    let runner = match &config.runner.container {
        Some(container) => {
            let engine = DockerEngine::new(&container.docker_host)
                .context("failed to build Docker client")?;
            let runtime: Arc<dyn ContainerRuntime> = Arc::new(engine);
            let platform_host = container
                .platform_host
                .clone()
                .or_else(|| util::url_host(&config.platform_url).map(str::to_string))
                .unwrap_or_else(|| util::get_platform_addr().to_string());
            let settings = ContainerSettings {
                platform_host,
                hostname: hostname.clone(),
                storage: container.storage_policy(),
            };
            RoleRunner::with_containers(&config.runner, runtime, settings)
        }
        None => RoleRunner::new(&config.runner),
    };

    let device = Device::new(
        DeviceConfig {
            hostname,
            strategy: config.strategy,
            features: config.features.iter().cloned().collect::<BTreeSet<_>>(),
            period: config.period(),
        },
        client,
        Arc::new(runner),
        Arc::new(registry()),
    );
    let handle = device.start().await?;

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C");
            if let Err(e) = shutdown.disconnect().await {
                warn!("disconnect failed: {e:#}");
            }
        }
    });

    handle.wait_for_shutdown().await
}
