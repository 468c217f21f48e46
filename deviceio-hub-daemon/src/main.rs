//! Deviceio Hub daemon
//!
//! Wires the core together: hydrates the store caches, starts the device
//! gateway and the authenticated API listener, and runs until interrupted.

mod api;
mod config;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deviceio_hub_protocol::store::{follow, hydrate, Devices, Members, Users};
use deviceio_hub_protocol::{
    tls, Authenticator, DeviceCache, GatewayServer, HubStore, MemberCache, UserCache,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use store::JsonFileStore;

/// Deviceio Hub provides centralized access to all of your devices
#[derive(Parser, Debug)]
#[command(name = "deviceio-hub")]
#[command(about = "Deviceio Hub provides centralized access to all of your devices")]
#[command(version)]
struct Cli {
    /// Path to the hub configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start an instance of the Deviceio Hub
    Start,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Start => start(&cli).await,
    }
}

async fn start(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    let store: Arc<dyn HubStore> = Arc::new(
        JsonFileStore::open(&config.store.path).context("failed to open hub store")?,
    );

    // First hydration is fatal: until it succeeds the hub could only ever
    // fail requests closed.
    let users = Arc::new(UserCache::new("users"));
    let members = Arc::new(MemberCache::new("members"));
    let devices = Arc::new(DeviceCache::new("devices"));
    hydrate(users.as_ref(), &Users(Arc::clone(&store)))
        .await
        .context("failed to hydrate user cache")?;
    hydrate(members.as_ref(), &Members(Arc::clone(&store)))
        .await
        .context("failed to hydrate member cache")?;
    hydrate(devices.as_ref(), &Devices(Arc::clone(&store)))
        .await
        .context("failed to hydrate device cache")?;

    tokio::spawn(follow(Arc::clone(&users), Users(Arc::clone(&store))));
    tokio::spawn(follow(Arc::clone(&members), Members(Arc::clone(&store))));
    tokio::spawn(follow(Arc::clone(&devices), Devices(Arc::clone(&store))));

    let gateway = Arc::new(GatewayServer::new(config.gateway_config()));
    let gateway_addr = gateway
        .start()
        .await
        .context("failed to start gateway listener")?;

    let authenticator = Authenticator::new(Arc::clone(&users));
    let router = api::router(api::ApiState {
        gateway: Arc::clone(&gateway),
        authenticator,
    });
    let api_tls = tls::server_config(
        config.api.tls_cert_path.as_deref(),
        config.api.tls_key_path.as_deref(),
    )
    .context("failed to load api TLS material")?;
    let (api_addr, api_task) = api::serve(router, config.api.bind_addr, api_tls)
        .await
        .context("failed to start api listener")?;

    info!(
        gateway_addr = %gateway_addr,
        api_addr = %api_addr,
        "deviceio hub started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    api_task.abort();
    gateway.shutdown().await;

    Ok(())
}
