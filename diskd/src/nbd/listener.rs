//! Connection sources for the NBD accept loop.
//!
//! Every session the daemon serves arrives through a [`Listener`]:
//! - TCP sockets, which start with the oldstyle greeting
//! - [`HandoffListener`], the single server end of a device socket pair,
//!   which skips the greeting because the kernel was configured directly

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Source of NBD sessions.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Whether sessions from this source begin with a greeting.
    const SENDS_GREETING: bool = true;

    /// Accept the next session.
    ///
    /// `Ok(None)` means the source is exhausted and will never yield again.
    /// Any error is fatal to the accept loop.
    async fn accept(&mut self) -> std::io::Result<Option<Self::Stream>>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<Option<Self::Stream>> {
        let (stream, peer) = TcpListener::accept(self).await?;
        debug!(%peer, "accepted connection");
        Ok(Some(stream))
    }
}

/// Yields the one stream handed over by the device session, then nothing.
///
/// If the device session ends before handing a stream over, the listener is
/// exhausted straight away.
pub struct HandoffListener<S> {
    handoff: Option<oneshot::Receiver<S>>,
}

impl<S> HandoffListener<S> {
    pub fn new(handoff: oneshot::Receiver<S>) -> Self {
        Self {
            handoff: Some(handoff),
        }
    }
}

#[async_trait]
impl<S> Listener for HandoffListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    const SENDS_GREETING: bool = false;

    async fn accept(&mut self) -> std::io::Result<Option<Self::Stream>> {
        let Some(handoff) = self.handoff.take() else {
            return Ok(None);
        };
        match handoff.await {
            Ok(stream) => {
                info!("server has been provided a domain socket");
                Ok(Some(stream))
            }
            Err(_) => {
                debug!("device session ended before handing off a socket");
                Ok(None)
            }
        }
    }
}

/// Listener fed from a channel of in-memory streams.
///
/// Dropping every sender exhausts the listener.
#[cfg(test)]
pub(crate) struct StreamListener<S> {
    rx: tokio::sync::mpsc::Receiver<S>,
}

#[cfg(test)]
impl<S> StreamListener<S> {
    pub(crate) fn new(buffer: usize) -> (tokio::sync::mpsc::Sender<S>, Self) {
        let (tx, rx) = tokio::sync::mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[cfg(test)]
#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> std::io::Result<Option<Self::Stream>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    #[tokio::test]
    async fn handoff_yields_once() {
        let (tx, rx) = oneshot::channel();
        let mut listener = HandoffListener::new(rx);
        let (_, server) = duplex(1024);
        tx.send(server).unwrap();

        assert!(listener.accept().await.unwrap().is_some());
        assert!(listener.accept().await.unwrap().is_none());
        assert!(!HandoffListener::<DuplexStream>::SENDS_GREETING);
    }

    #[tokio::test]
    async fn handoff_exhausted_when_sender_dropped() {
        let (tx, rx) = oneshot::channel::<DuplexStream>();
        let mut listener = HandoffListener::new(rx);
        drop(tx);

        assert!(listener.accept().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tcp_listener_accepts() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        assert!(Listener::accept(&mut listener).await.unwrap().is_some());
        assert!(<TcpListener as Listener>::SENDS_GREETING);
        connect.await.unwrap();
    }
}
