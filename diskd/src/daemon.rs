//! Daemon API for running diskd.
//!
//! Ties a storage backend to the NBD server and, when a device node is
//! configured, to the kernel device.
//!
//! # Example
//!
//! ```ignore
//! use diskd::{Config, Daemon, Supervisor};
//! use tokio_util::sync::CancellationToken;
//!
//! let daemon = Daemon::from_config(config)?;
//! let supervisor = Supervisor::new(CancellationToken::new());
//! daemon.run(supervisor).await?;
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::attach;
use crate::config::{Config, DeviceMode};
use crate::error::{Error, NbdError, Result};
use crate::nbd::{HandoffListener, Listener, NbdServer};
use crate::shutdown::Supervisor;
use crate::store::{Backend, Storage};

/// A diskd instance.
#[derive(Clone)]
pub struct Daemon {
    backend: Arc<Backend>,
    server: NbdServer<Backend>,
    config: Arc<Config>,
}

impl Daemon {
    /// Create a new daemon from configuration.
    ///
    /// Validates the configuration and builds the storage backend it names.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(Backend::from_config(&config.storage)?);
        Ok(Self {
            server: NbdServer::new(Arc::clone(&backend)),
            backend,
            config: Arc::new(config),
        })
    }

    /// Get the daemon configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Address the TCP listener binds to.
    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.nbd.port))
    }

    /// Run every configured component under `supervisor` until shutdown.
    ///
    /// Starts the TCP listener unless the device is attached through a
    /// socket pair, and the device session when a device node is configured.
    /// Releases the backend after every task has finished.
    pub async fn run(&self, mut supervisor: Supervisor) -> Result<()> {
        let shutdown = supervisor.token().clone();
        let device = self.config.device.path.clone();
        let mode = self.config.device.mode;

        if device.is_none() || mode == DeviceMode::Tcp {
            let address = self.listen_address();
            let listener = TcpListener::bind(address).await?;
            info!(%address, "nbd server listening");

            let daemon = self.clone();
            let token = shutdown.clone();
            supervisor.spawn("tcp server", async move { daemon.listen(listener, token).await });
        }

        if let Some(path) = device {
            match mode {
                DeviceMode::Tcp => {
                    let server = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.nbd.port));
                    supervisor.spawn(
                        "tcp client",
                        attach::attach_tcp(path, server, shutdown.clone()),
                    );
                }
                DeviceMode::SocketPair => {
                    let size_bytes = self.backend.size().await?;
                    let (tx, rx) = oneshot::channel();
                    supervisor.spawn(
                        "domain socket client",
                        attach::attach_socket_pair(
                            path,
                            size_bytes,
                            self.server.transmission_flags(),
                            tx,
                            shutdown.clone(),
                        ),
                    );

                    let daemon = self.clone();
                    let token = shutdown.clone();
                    supervisor.spawn("domain socket server", async move {
                        daemon.serve_handoff(rx, token).await
                    });
                }
            }
        }

        let result = supervisor.wait().await;
        self.backend.release();
        info!("shutdown complete");
        result
    }

    /// Accept NBD sessions until `shutdown` is cancelled or the listener is
    /// exhausted.
    ///
    /// Each session is served on its own task with a child token, so closing
    /// one session never affects the listener. The listener is closed before
    /// waiting for the remaining sessions to finish. Any accept error is
    /// returned after those sessions end.
    ///
    /// # Example
    ///
    /// ```ignore
    /// // Production: TCP listener
    /// let listener = TcpListener::bind("0.0.0.0:10809").await?;
    /// daemon.listen(listener, shutdown).await?;
    ///
    /// // Device socket pair: a single session without greeting
    /// daemon.listen(HandoffListener::new(rx), shutdown).await?;
    /// ```
    pub async fn listen<L>(&self, mut listener: L, shutdown: CancellationToken) -> Result<()>
    where
        L: Listener,
    {
        let sessions = TaskTracker::new();

        let result = loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(Some(stream)) => {
                    let server = self.server.clone();
                    let token = shutdown.child_token();
                    sessions.spawn(async move {
                        let result = if L::SENDS_GREETING {
                            server.serve(stream, token).await
                        } else {
                            server.transmission(stream, token).await.map_err(Error::from)
                        };
                        match result {
                            Ok(()) => debug!("session closed"),
                            Err(Error::Nbd(NbdError::Io(e))) => {
                                debug!(error = %e, "session dropped")
                            }
                            Err(e) => warn!(error = %e, "session failed"),
                        }
                    });
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(Error::from(e)),
            }
        };

        drop(listener);
        info!("nbd listener stopped");
        sessions.close();
        sessions.wait().await;
        result
    }

    /// Serve the server end of a socket pair once it is handed off.
    pub async fn serve_handoff<T>(
        &self,
        handoff: oneshot::Receiver<T>,
        shutdown: CancellationToken,
    ) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.listen(HandoffListener::new(handoff), shutdown).await
    }
}
