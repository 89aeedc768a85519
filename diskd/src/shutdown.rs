//! Process-wide shutdown: signal handling and task supervision.
//!
//! A single root [`CancellationToken`] is cancelled on the first SIGINT or
//! SIGTERM, or as soon as any supervised task exits. A second signal while
//! shutting down exits immediately without teardown.

use std::future::Future;

use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
///
/// Returns once shutdown has begun, for whatever reason. From then on a
/// second signal terminates the process with exit code 1.
pub async fn watch_signals(shutdown: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT, shutting down"),
        _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        warn!("received second signal, exiting without teardown");
        std::process::exit(1);
    });
    Ok(())
}

/// Runs the daemon's long-lived tasks and shuts everything down when any of
/// them exits.
pub struct Supervisor {
    shutdown: CancellationToken,
    tasks: JoinSet<(&'static str, Result<()>)>,
}

impl Supervisor {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// The root token cancelled by this supervisor.
    pub fn token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Spawn a named task. Its exit, clean or not, cancels the root token.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let result = task.await;
            shutdown.cancel();
            (name, result)
        });
    }

    /// Wait for every task to finish.
    ///
    /// Returns the first error reported by any task.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let (name, result) = match joined {
                Ok(exit) => exit,
                Err(e) => {
                    error!(error = %e, "supervised task panicked");
                    self.shutdown.cancel();
                    first_error.get_or_insert(Error::from(e));
                    continue;
                }
            };
            match result {
                Ok(()) => info!(task = name, "exited cleanly"),
                Err(e) => {
                    error!(task = name, error = %e, "exited with error");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
