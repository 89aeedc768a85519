//! Byte-addressed storage backends behind the NBD server.
//!
//! Every backend implements [`Storage`]. The daemon selects one at startup
//! through [`Backend::from_config`] and shares it between all connections.

mod file;
mod memory;
mod remote;

use async_trait::async_trait;
use bytes::Bytes;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub(crate) use remote::MAX_MESSAGE_SIZE;

use crate::config::{BackendKind, StorageConfig};
use crate::error::StoreError;

/// Result of a storage operation.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Byte-addressed storage shared by every NBD connection.
///
/// Implementations must tolerate concurrent calls. Reads and writes are
/// all-or-nothing: a read returns exactly `length` bytes or fails.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read `length` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, length: usize) -> StoreResult<Bytes>;

    /// Write all of `data` starting at `offset`.
    async fn write_at(&self, offset: u64, data: Bytes) -> StoreResult<()>;

    /// Discard a byte range. Backends without trim support treat this as a
    /// successful no-op.
    async fn trim_at(&self, _offset: u64, _length: u64) -> StoreResult<()> {
        Ok(())
    }

    /// Whether trim is advertised to clients.
    fn supports_trim(&self) -> bool {
        false
    }

    /// Make completed writes durable.
    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Current size in bytes.
    async fn size(&self) -> StoreResult<u64>;

    /// Release underlying resources. Idempotent.
    fn release(&self);
}

/// The storage backend selected at startup.
pub enum Backend {
    Memory(MemoryStore),
    File(FileStore),
    Remote(RemoteStore),
}

impl Backend {
    /// Build the backend named by the configuration.
    ///
    /// Must be called from within a tokio runtime; the remote backend
    /// creates its channel eagerly but connects lazily.
    pub fn from_config(config: &StorageConfig) -> StoreResult<Self> {
        let backend = match config.kind() {
            BackendKind::Memory => Backend::Memory(MemoryStore::new(config.size_bytes)),
            BackendKind::File => Backend::File(FileStore::open(&config.path, config.size_bytes)?),
            BackendKind::Remote => {
                let address = config
                    .remote
                    .as_deref()
                    .ok_or_else(|| StoreError::unavailable("no remote address configured"))?;
                Backend::Remote(RemoteStore::connect(address)?)
            }
        };
        tracing::info!(backend = backend.name(), "storage backend ready");
        Ok(backend)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Memory(_) => "memory",
            Backend::File(_) => "file",
            Backend::Remote(_) => "remote",
        }
    }
}

#[async_trait]
impl Storage for Backend {
    async fn read_at(&self, offset: u64, length: usize) -> StoreResult<Bytes> {
        match self {
            Backend::Memory(s) => s.read_at(offset, length).await,
            Backend::File(s) => s.read_at(offset, length).await,
            Backend::Remote(s) => s.read_at(offset, length).await,
        }
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> StoreResult<()> {
        match self {
            Backend::Memory(s) => s.write_at(offset, data).await,
            Backend::File(s) => s.write_at(offset, data).await,
            Backend::Remote(s) => s.write_at(offset, data).await,
        }
    }

    async fn trim_at(&self, offset: u64, length: u64) -> StoreResult<()> {
        match self {
            Backend::Memory(s) => s.trim_at(offset, length).await,
            Backend::File(s) => s.trim_at(offset, length).await,
            Backend::Remote(s) => s.trim_at(offset, length).await,
        }
    }

    fn supports_trim(&self) -> bool {
        match self {
            Backend::Memory(s) => s.supports_trim(),
            Backend::File(s) => s.supports_trim(),
            Backend::Remote(s) => s.supports_trim(),
        }
    }

    async fn flush(&self) -> StoreResult<()> {
        match self {
            Backend::Memory(s) => s.flush().await,
            Backend::File(s) => s.flush().await,
            Backend::Remote(s) => s.flush().await,
        }
    }

    async fn size(&self) -> StoreResult<u64> {
        match self {
            Backend::Memory(s) => s.size().await,
            Backend::File(s) => s.size().await,
            Backend::Remote(s) => s.size().await,
        }
    }

    fn release(&self) {
        match self {
            Backend::Memory(s) => s.release(),
            Backend::File(s) => s.release(),
            Backend::Remote(s) => s.release(),
        }
    }
}

/// Reject ranges that end past `size`.
pub(crate) fn check_range(offset: u64, length: u64, size: u64) -> StoreResult<()> {
    match offset.checked_add(length) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StoreError::OutOfRange {
            offset,
            length,
            size,
        }),
    }
}
