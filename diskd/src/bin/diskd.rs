//! diskd - expose memory, file or remote storage as an NBD block device.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use diskd::config::{BackendKind, DeviceMode};
use diskd::{Config, Daemon, Supervisor, watch_signals};

#[derive(Parser, Debug)]
#[command(name = "diskd")]
#[command(about = "Expose memory, file or remote storage as an NBD block device")]
struct Args {
    /// Path to config file. If omitted, uses defaults (100 MiB in-memory disk).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// NBD device node to attach, e.g. /dev/nbd0. Server-only when omitted.
    #[arg(long)]
    client: Option<PathBuf>,

    /// Attach the device over loopback TCP instead of a unix socket pair.
    #[arg(long)]
    tcp: bool,

    /// TCP port of the NBD listener.
    #[arg(long)]
    port: Option<u16>,

    /// Disk size in bytes.
    #[arg(long, env = "DISK_SIZE")]
    disk_size: Option<u64>,

    /// Backing file for the file backend.
    #[arg(long, env = "DISK_PATH")]
    disk_path: Option<PathBuf>,

    /// Storage backend.
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Address of a diskd-replica; selects the remote backend.
    #[arg(long, env = "REMOTE_STORAGE")]
    remote: Option<String>,

    /// Verbosity level (0-3).
    #[arg(short, default_value = "0")]
    v: u8,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(client) = self.client {
            config.device.path = Some(client);
        }
        if self.tcp {
            config.device.mode = DeviceMode::Tcp;
        }
        if let Some(port) = self.port {
            config.nbd.port = port;
        }
        if let Some(size) = self.disk_size {
            config.storage.size_bytes = size;
        }
        if let Some(path) = self.disk_path {
            config.storage.path = path;
        }
        if let Some(backend) = self.backend {
            config.storage.backend = backend;
        }
        if let Some(remote) = self.remote.filter(|r| !r.is_empty()) {
            config.storage.remote = Some(remote);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Only diskd crates get detailed logging; everything else stays at warn.
    let filter = match args.v {
        0 => "diskd=info,nbd=info,warn",
        1 => "diskd=debug,nbd=debug,warn",
        2 => "diskd=trace,nbd=trace,warn",
        _ => "diskd=trace,nbd=trace,info",
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
    args.apply(&mut config);

    let daemon = Daemon::from_config(config).context("Failed to create daemon")?;
    info!(
        backend = daemon.backend().name(),
        size_bytes = daemon.config().storage.size_bytes,
        port = daemon.config().nbd.port,
        device = ?daemon.config().device.path,
        mode = ?daemon.config().device.mode,
        "diskd started"
    );

    let shutdown = CancellationToken::new();
    let mut supervisor = Supervisor::new(shutdown.clone());
    supervisor.spawn("interrupt handler", watch_signals(shutdown));
    daemon.run(supervisor).await?;

    Ok(())
}
