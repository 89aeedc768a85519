//! diskd-replica - serve file-backed storage to remote diskd instances.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use diskd::replica::serve_replica;
use diskd::store::{FileStore, Storage};
use diskd::{Config, Supervisor, watch_signals};

#[derive(Parser, Debug)]
#[command(name = "diskd-replica")]
#[command(about = "Serve file-backed storage to remote diskd instances over gRPC")]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    listen: Option<String>,

    /// Disk size in bytes.
    #[arg(long, env = "DISK_SIZE")]
    disk_size: Option<u64>,

    /// Backing file.
    #[arg(long, env = "DISK_PATH")]
    disk_path: Option<PathBuf>,

    /// Verbosity level (0-3).
    #[arg(short, default_value = "0")]
    v: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.v {
        0 => "diskd=info,warn",
        1 => "diskd=debug,warn",
        2 => "diskd=trace,warn",
        _ => "diskd=trace,info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let mut config = match args.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.replica.address = listen;
    }
    if let Some(size) = args.disk_size {
        config.storage.size_bytes = size;
    }
    if let Some(path) = args.disk_path {
        config.storage.path = path;
    }
    config.validate()?;

    let store = Arc::new(
        FileStore::open(&config.storage.path, config.storage.size_bytes)
            .with_context(|| format!("Failed to open: {}", config.storage.path.display()))?,
    );
    let listener = TcpListener::bind(&config.replica.address)
        .await
        .with_context(|| format!("Failed to bind: {}", config.replica.address))?;
    info!(
        address = %config.replica.address,
        path = %config.storage.path.display(),
        "diskd-replica started"
    );

    let shutdown = CancellationToken::new();
    let mut supervisor = Supervisor::new(shutdown.clone());
    supervisor.spawn("interrupt handler", watch_signals(shutdown.clone()));
    supervisor.spawn(
        "replica server",
        serve_replica(listener, Arc::clone(&store), shutdown),
    );
    let result = supervisor.wait().await;
    store.release();
    result?;

    Ok(())
}
