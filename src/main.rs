use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quilt::{FederationContext, GatewayConfig, LoadStatus, LocalContext};

/// GraphQL schema stitching gateway.
#[derive(Parser, Debug)]
#[command(name = "quilt", version, about)]
struct Args {
    /// Path to the gateway configuration file.
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Overrides `listen` from the configuration file.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Overrides `subscriptions_listen` from the configuration file.
    #[arg(long)]
    subscriptions_listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = GatewayConfig::from_path(&args.config).inspect_err(|e| {
        error!(error = %e, "failed to load configuration");
    })?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if args.subscriptions_listen.is_some() {
        config.subscriptions_listen = args.subscriptions_listen;
    }

    let context = Arc::new(FederationContext::from_config(&config)?);

    // Load eagerly so startup logs show which sources are reachable.
    match context.combined_schema(&LocalContext::default()).await {
        Ok(_) => match context.load_status() {
            LoadStatus::AllLoaded => info!("all sources loaded"),
            status => warn!(?status, "started with a partial schema"),
        },
        Err(e) => warn!(error = %e, "no schema available yet, retrying on first request"),
    }

    quilt::server::run(context, config.listen, config.subscriptions_listen).await?;
    Ok(())
}
