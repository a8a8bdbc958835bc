//! Crimson OSD - prototype object storage daemon
//!
//! Serves object reads and writes from remote clients against the sharded
//! in-memory store.

mod dispatch;

use anyhow::{Context, Result};
use clap::Parser;
use crimson_common::OsdConfig;
use crimson_map::OsdMap;
use crimson_net::{Listener, SocketListener};
use dispatch::OsdServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "crimson-osd")]
#[command(about = "Crimson Object Storage Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/crimson/osd.toml")]
    config: String,

    /// Bind address; empty means all interfaces
    #[arg(long)]
    address: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to the cluster OsdMap file
    #[arg(long)]
    map: Option<PathBuf>,

    /// Worker core count
    #[arg(long)]
    workers: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load the config file if it exists; CLI flags take precedence.
    let config: OsdConfig = if std::path::Path::new(&args.config).exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config))?;
        toml::from_str(&raw).unwrap_or_else(|err| {
            eprintln!("Warning: failed to parse config file: {err}");
            OsdConfig::default()
        })
    } else {
        OsdConfig::default()
    };

    let address = args.address.unwrap_or(config.server.address);
    let port = args.port.unwrap_or(config.server.port);
    let map_path = args.map.or(config.server.map);
    let workers = args
        .workers
        .or(config.server.workers)
        .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
        .unwrap_or(1);
    let log_level = if args.log_level != "info" {
        args.log_level
    } else {
        config.logging.level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting Crimson OSD");

    if let Some(path) = &map_path {
        match OsdMap::load(path) {
            Ok(map) => info!(
                map = %path.display(),
                epoch = map.epoch,
                osds = map.entries.len(),
                "loaded cluster map"
            ),
            Err(err) => warn!(map = %path.display(), %err, "failed to load cluster map"),
        }
    }

    let server = Arc::new(OsdServer::new(workers).await?);
    info!(
        fsid = %server.store().fsid(),
        cores = server.store().cores(),
        "store online"
    );

    let bind = if address.is_empty() {
        format!("0.0.0.0:{port}")
    } else {
        format!("{address}:{port}")
    };
    let listener = SocketListener::bind(
        bind.parse()
            .with_context(|| format!("invalid bind address {bind}"))?,
    )
    .await?;
    info!(address = %listener.local_addr()?, "listening");

    tokio::select! {
        result = accept_loop(listener, server) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

async fn accept_loop(listener: SocketListener, server: Arc<OsdServer>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let server = server.clone();
                tokio::spawn(async move {
                    server.handle_connection(conn).await;
                });
            }
            Err(err) => warn!(%err, "accept failed"),
        }
    }
}
