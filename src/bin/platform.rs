use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use colony::{
    api::{ApiConfig, ApiState, spawn_api_server},
    config::PlatformConfig,
    platform::Platform,
    role::ServiceDescription,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long)]
    file: Option<String>,

    /// Overrides the bind address of the config file
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("colony", level),
        ("platform", level),
        ("tower_http", LevelFilter::DEBUG.min(level)),
    ]);
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.file {
        Some(file) => PlatformConfig::load(file)?,
        None => PlatformConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if config.auth_token.is_none() {
        config.auth_token = colony::util::get_token();
    }

    let level = config
        .log_level
        .as_deref()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::INFO);
    init(level);
    trace!("started with args: {args:?}");

    let platform = Arc::new(Platform::new());

    if let Some(path) = &config.services_file {
        let services = load_services(path)?;
        info!("preloading {} service descriptions", services.len());
        for description in services {
            platform.add_service(description);
        }
    }

    let shutdown = CancellationToken::new();

    if let Some(retention) = config.metrics_retention_secs {
        tokio::spawn(prune_metrics(
            Arc::clone(&platform),
            Duration::from_secs(retention),
            Duration::from_secs(config.cleanup_interval_secs.max(1)),
            shutdown.clone(),
        ));
    }

    let api_config = ApiConfig {
        bind_addr: config.bind,
        auth_token: config.auth_token.clone(),
        enable_cors: config.enable_cors,
    };
    let addr = spawn_api_server(api_config, ApiState::new(Arc::clone(&platform)), shutdown.clone())
        .await?;
    info!("coordination point ready on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutting down");
    platform.shutdown();
    shutdown.cancel();

    Ok(())
}

fn load_services(path: &std::path::Path) -> anyhow::Result<Vec<ServiceDescription>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read services file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid service descriptions in {}", path.display()))
}

#[instrument(skip(platform, shutdown))]
async fn prune_metrics(
    platform: Arc<Platform>,
    retention: Duration,
    every: Duration,
    shutdown: CancellationToken,
) {
    debug!("starting metrics retention");
    let mut ticker = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Ok(retention) = chrono::Duration::from_std(retention) else {
                    break;
                };
                let removed = platform.prune_metrics(Utc::now() - retention);
                if removed > 0 {
                    debug!("pruned {removed} metric samples");
                }
            }
        }
    }
}
