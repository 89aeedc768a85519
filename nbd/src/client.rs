//! NBD client implementation.
//!
//! Speaks the oldstyle handshake followed by simple request/reply
//! transmission. Used to drive servers in tests and to learn the export size
//! before handing a TCP socket to the kernel.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// Read and validate the server greeting.
pub async fn read_greeting<S>(stream: &mut S) -> Result<Greeting, NbdError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; Greeting::SIZE_BYTES];
    stream.read_exact(&mut buf).await?;
    Greeting::from_bytes(&buf)
}

/// NBD client for connecting to NBD servers.
pub struct NbdClient<S> {
    stream: S,
    handle_counter: AtomicU64,
    /// Size of the export in bytes.
    pub size_bytes: u64,
    /// Transmission flags advertised by the server.
    pub transmission_flags: u32,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Connect to an NBD server by reading its greeting.
    pub async fn connect(mut stream: S) -> Result<Self, NbdError> {
        let greeting = read_greeting(&mut stream).await?;
        Ok(Self::from_parts(stream, greeting))
    }

    /// Wrap a stream that is already in the transmission phase.
    ///
    /// Used when the server was handed a socket-pair end and never sends a
    /// greeting.
    pub fn from_parts(stream: S, greeting: Greeting) -> Self {
        Self {
            stream,
            handle_counter: AtomicU64::new(0),
            size_bytes: greeting.size_bytes,
            transmission_flags: greeting.flags,
        }
    }

    fn next_handle(&self) -> u64 {
        self.handle_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a raw request header. The caller owns the framing that follows.
    pub async fn send_request(
        &mut self,
        command: NbdCommand,
        offset: u64,
        length: u32,
    ) -> Result<u64, NbdError> {
        let handle = self.next_handle();
        let req = NbdRequest {
            flags: 0,
            command,
            handle,
            offset,
            length,
        };
        self.stream.write_all(&req.to_bytes()).await?;
        Ok(handle)
    }

    /// Read a reply header without checking it against a request.
    pub async fn read_reply(&mut self) -> Result<NbdReply, NbdError> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        NbdReply::from_bytes(&buf)
    }

    async fn expect_reply(&mut self, handle: u64) -> Result<(), NbdError> {
        let reply = self.read_reply().await?;
        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }
        if reply.error != NBD_OK {
            return Err(NbdError::ServerError { code: reply.error });
        }
        Ok(())
    }

    /// Read data from the device.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let handle = self.send_request(NbdCommand::Read, offset, length).await?;
        self.expect_reply(handle).await?;

        let mut data = BytesMut::zeroed(length as usize);
        self.stream.read_exact(&mut data).await.map_err(|e| {
            NbdError::Io(io::Error::other(format!(
                "failed to read {length} bytes of response data at offset {offset}: {e}"
            )))
        })?;
        Ok(data.freeze())
    }

    /// Write data to the device.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let handle = self
            .send_request(NbdCommand::Write, offset, data.len() as u32)
            .await?;
        self.stream.write_all(data).await?;
        self.expect_reply(handle).await
    }

    /// Flush pending writes.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        let handle = self.send_request(NbdCommand::Flush, 0, 0).await?;
        self.expect_reply(handle).await
    }

    /// Trim a range (hint that data is no longer needed).
    pub async fn trim(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        let handle = self.send_request(NbdCommand::Trim, offset, length).await?;
        self.expect_reply(handle).await
    }

    /// Disconnect from the server. No reply is expected.
    pub async fn disconnect(mut self) -> Result<S, NbdError> {
        self.send_request(NbdCommand::Disconnect, 0, 0).await?;
        self.stream.flush().await?;
        Ok(self.stream)
    }

    /// Check if the server supports flush.
    pub fn supports_flush(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_SEND_FLUSH) != 0
    }

    /// Check if the server supports trim.
    pub fn supports_trim(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_SEND_TRIM) != 0
    }
}
