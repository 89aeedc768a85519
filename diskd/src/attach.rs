//! Attaching the kernel NBD device to the local server.
//!
//! Two modes are supported:
//!
//! - socket pair: one end of an in-process unix socket pair is handed to
//!   the kernel, the other end is passed to the server over a oneshot
//!   channel and served without a greeting.
//! - TCP: a loopback connection to the local listener is opened, the
//!   greeting is consumed here and the socket is handed to the kernel.
//!
//! Both modes block a worker thread in `NBD_DO_IT` and issue the device
//! teardown as soon as shutdown is requested.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;

use nbd::{DeviceControl, NbdDevice};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::oneshot;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How often to retry connecting to the local listener.
const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Attach `device_path` through an in-process socket pair.
///
/// The kernel end is configured before the server end is sent over
/// `handoff`, so the server never sees traffic for a device that failed to
/// bind.
pub async fn attach_socket_pair(
    device_path: PathBuf,
    size_bytes: u64,
    flags: u32,
    handoff: oneshot::Sender<UnixStream>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (kernel_end, server_end) = std::os::unix::net::UnixStream::pair()?;

    let device = open_and_configure(device_path, kernel_end.into(), size_bytes, flags).await?;

    server_end.set_nonblocking(true)?;
    let server_end = UnixStream::from_std(server_end)?;
    if handoff.send(server_end).is_err() {
        warn!("server is gone before the socket could be handed off");
    }

    run_device(device, shutdown).await
}

/// Attach `device_path` through a loopback TCP connection to `server`.
pub async fn attach_tcp(
    device_path: PathBuf,
    server: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let Some(mut stream) = connect_with_retry(server, &shutdown).await? else {
        return Ok(());
    };
    let greeting = nbd::read_greeting(&mut stream).await?;
    info!(
        size_bytes = greeting.size_bytes,
        flags = greeting.flags,
        "received greeting from local server"
    );

    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    let device = open_and_configure(
        device_path,
        stream.into(),
        greeting.size_bytes,
        greeting.flags,
    )
    .await?;

    run_device(device, shutdown).await
}

async fn connect_with_retry(
    server: SocketAddr,
    shutdown: &CancellationToken,
) -> Result<Option<TcpStream>> {
    let mut attempt = 1;
    loop {
        match TcpStream::connect(server).await {
            Ok(stream) => return Ok(Some(stream)),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                debug!(%server, attempt, error = %e, "local server not ready, retrying");
            }
            Err(e) => return Err(e.into()),
        }
        attempt += 1;
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(CONNECT_BACKOFF) => {}
        }
    }
}

async fn open_and_configure(
    device_path: PathBuf,
    socket: OwnedFd,
    size_bytes: u64,
    flags: u32,
) -> Result<NbdDevice> {
    let device = spawn_blocking(move || {
        let mut device = NbdDevice::open(&device_path)?;
        device.configure(socket, size_bytes, flags)?;
        Ok::<_, Error>(device)
    })
    .await??;
    Ok(device)
}

/// Hand a configured device to the kernel and wait for it to be released.
///
/// Cancelling `shutdown` issues the one-shot teardown, which makes the
/// kernel return from `NBD_DO_IT`.
pub async fn run_device<C: DeviceControl>(
    device: NbdDevice<C>,
    shutdown: CancellationToken,
) -> Result<()> {
    let teardown = device.teardown();
    let watcher = tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("begin gracefully shutting down device");
        if let Err(e) = spawn_blocking(move || teardown.run()).await {
            warn!(error = %e, "device teardown task failed");
        }
    });

    let result = spawn_blocking(move || device.run()).await;
    watcher.abort();
    result??;
    Ok(())
}
