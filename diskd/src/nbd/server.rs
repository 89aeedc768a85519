//! NBD server implementation.
//!
//! The `NbdServer` handles a single NBD connection: an optional oldstyle
//! greeting followed by the request/reply transmission loop. It is
//! transport-agnostic and works with any async stream (TCP, Unix, or
//! in-memory).
//!
//! For accepting multiple connections, see `Daemon::listen()` which uses
//! the `Listener` trait.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// Protocol types from the nbd crate
use nbd::*;

use crate::error::Result;
use crate::store::Storage;

/// Error code sent for any failed backend operation.
const BACKEND_ERROR: u32 = NBD_EPERM;

/// NBD server for handling a single connection.
///
/// Cheap to clone; every clone shares the same storage.
pub struct NbdServer<S: ?Sized> {
    storage: Arc<S>,
}

impl<S: ?Sized> Clone for NbdServer<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl<S> NbdServer<S>
where
    S: Storage + ?Sized,
{
    /// Create a new NBD server over the given storage.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Transmission flags advertised to clients.
    pub fn transmission_flags(&self) -> u32 {
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
        if self.storage.supports_trim() {
            flags |= NBD_FLAG_SEND_TRIM;
        }
        flags
    }

    /// Serve a connection accepted from a listener.
    ///
    /// Queries the storage size, sends the greeting and enters transmission
    /// mode. Returns when the client disconnects, the connection is cancelled
    /// or an error occurs.
    pub async fn serve<T>(&self, mut stream: T, shutdown: CancellationToken) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let size_bytes = self.storage.size().await?;
        stream
            .write_all(&encode_greeting(size_bytes, self.transmission_flags()))
            .await?;
        stream.flush().await?;
        debug!(size_bytes, "sent greeting");

        self.transmission(stream, shutdown).await?;
        Ok(())
    }

    /// Run the transmission loop on a stream that skips the greeting.
    ///
    /// Used for the server end of a socket pair whose other end was handed to
    /// the kernel.
    pub async fn transmission<T>(
        &self,
        mut stream: T,
        shutdown: CancellationToken,
    ) -> std::result::Result<(), NbdError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = &mut stream;
        let mut header = [0u8; NbdRequest::SIZE_BYTES];

        loop {
            let filled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("connection cancelled");
                    return Ok(());
                }
                filled = read_full(stream, &mut header) => filled?,
            };
            if filled == 0 {
                debug!("client closed connection");
                return Ok(());
            }
            if filled < header.len() {
                return Err(NbdError::ShortRead {
                    expected: header.len(),
                    actual: filled,
                });
            }

            let req = decode_request(&header)?;
            trace!(
                command = ?req.command,
                handle = req.handle,
                offset = req.offset,
                length = req.length,
                "request"
            );

            match req.command {
                NbdCommand::Read => {
                    if req.length > NBD_MAX_PAYLOAD_SIZE {
                        warn!(length = req.length, "read exceeds maximum payload");
                        send_reply(stream, req.handle, NBD_EOVERFLOW, None).await?;
                        continue;
                    }
                    match self.storage.read_at(req.offset, req.length as usize).await {
                        Ok(data) => send_reply(stream, req.handle, NBD_OK, Some(&data[..])).await?,
                        Err(e) => {
                            warn!(offset = req.offset, length = req.length, error = %e, "read error");
                            send_reply(stream, req.handle, BACKEND_ERROR, None).await?;
                        }
                    }
                }
                NbdCommand::Write => {
                    if req.length > NBD_MAX_PAYLOAD_SIZE {
                        warn!(length = req.length, "write exceeds maximum payload");
                        discard(stream, req.length as u64).await?;
                        send_reply(stream, req.handle, NBD_EOVERFLOW, None).await?;
                        continue;
                    }
                    let data = read_payload(stream, req.length as usize).await?;
                    let err = match self.storage.write_at(req.offset, data).await {
                        Ok(()) => NBD_OK,
                        Err(e) => {
                            warn!(offset = req.offset, length = req.length, error = %e, "write error");
                            BACKEND_ERROR
                        }
                    };
                    send_reply(stream, req.handle, err, None).await?;
                }
                NbdCommand::Flush => {
                    let err = match self.storage.flush().await {
                        Ok(()) => NBD_OK,
                        Err(e) => {
                            warn!(error = %e, "flush error");
                            BACKEND_ERROR
                        }
                    };
                    send_reply(stream, req.handle, err, None).await?;
                }
                NbdCommand::Trim => {
                    let err = if !self.storage.supports_trim() {
                        NBD_OK
                    } else {
                        match self.storage.trim_at(req.offset, req.length as u64).await {
                            Ok(()) => NBD_OK,
                            Err(e) => {
                                warn!(offset = req.offset, length = req.length, error = %e, "trim error");
                                BACKEND_ERROR
                            }
                        }
                    };
                    send_reply(stream, req.handle, err, None).await?;
                }
                NbdCommand::Disconnect => {
                    info!("client requested disconnect, releasing storage");
                    self.storage.release();
                    return Ok(());
                }
                NbdCommand::Unknown(command) => {
                    warn!(command, handle = req.handle, "ignoring unknown command");
                }
            }
        }
    }
}

/// Fill `buf` from the stream, stopping early only at end of stream.
///
/// Returns the number of bytes read.
async fn read_full<T>(stream: &mut T, buf: &mut [u8]) -> std::io::Result<usize>
where
    T: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_payload<T>(stream: &mut T, length: usize) -> std::result::Result<Bytes, NbdError>
where
    T: AsyncRead + Unpin,
{
    let mut data = BytesMut::zeroed(length);
    let filled = read_full(stream, &mut data).await?;
    if filled < length {
        return Err(NbdError::ShortRead {
            expected: length,
            actual: filled,
        });
    }
    Ok(data.freeze())
}

/// Consume and drop `length` payload bytes so the next header stays aligned.
async fn discard<T>(stream: &mut T, length: u64) -> std::result::Result<(), NbdError>
where
    T: AsyncRead + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *stream).take(length), &mut tokio::io::sink()).await?;
    if copied < length {
        return Err(NbdError::ShortRead {
            expected: length as usize,
            actual: copied as usize,
        });
    }
    Ok(())
}

async fn send_reply<T>(
    stream: &mut T,
    handle: u64,
    error: u32,
    payload: Option<&[u8]>,
) -> std::result::Result<(), NbdError>
where
    T: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(handle, error)).await?;
    if let Some(payload) = payload {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}
