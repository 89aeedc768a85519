//! Storage backed by a regular file.
//!
//! The file is opened with `O_SYNC` so every completed write is on stable
//! storage. I/O is positional and runs on the blocking pool, which keeps
//! concurrent connections from sharing a file cursor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nix::libc;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::{Storage, StoreResult, check_range};
use crate::error::StoreError;

/// Chunk size used when zeroing a range by hand.
const ZERO_CHUNK: usize = 64 * 1024;

pub struct FileStore {
    path: PathBuf,
    size_bytes: u64,
    file: RwLock<Option<Arc<File>>>,
}

impl FileStore {
    /// Open or create the backing file, growing it to `size_bytes` if it is
    /// smaller. An existing larger file is never truncated, but only the
    /// first `size_bytes` of it are exposed.
    pub fn open(path: impl AsRef<Path>, size_bytes: u64) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .custom_flags(libc::O_SYNC)
            .open(&path)?;

        let current = file.metadata()?.len();
        if current < size_bytes {
            file.set_len(size_bytes)?;
        }

        info!(
            path = %path.display(),
            size_bytes,
            file_len = current.max(size_bytes),
            "opened backing file"
        );
        Ok(Self {
            path,
            size_bytes,
            file: RwLock::new(Some(Arc::new(file))),
        })
    }

    fn handle(&self) -> StoreResult<Arc<File>> {
        self.file.read().clone().ok_or(StoreError::Released)
    }

    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> io::Result<T> + Send + 'static,
    {
        let file = self.handle()?;
        let result = tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(StoreError::backend)?;
        Ok(result?)
    }
}

fn punch_hole(file: &File, offset: u64, length: u64) -> io::Result<()> {
    let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
    // SAFETY: the descriptor is owned by `file`, which outlives the call.
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            mode,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn zero_range(file: &File, offset: u64, length: u64) -> io::Result<()> {
    let zeros = vec![0u8; ZERO_CHUNK.min(length as usize)];
    let mut pos = offset;
    let end = offset + length;
    while pos < end {
        let n = ((end - pos) as usize).min(zeros.len());
        file.write_all_at(&zeros[..n], pos)?;
        pos += n as u64;
    }
    Ok(())
}

#[async_trait]
impl Storage for FileStore {
    async fn read_at(&self, offset: u64, length: usize) -> StoreResult<Bytes> {
        check_range(offset, length as u64, self.size_bytes)?;
        self.blocking(move |file| {
            let mut buf = vec![0u8; length];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> StoreResult<()> {
        check_range(offset, data.len() as u64, self.size_bytes)?;
        self.blocking(move |file| file.write_all_at(&data, offset))
            .await
    }

    async fn trim_at(&self, offset: u64, length: u64) -> StoreResult<()> {
        check_range(offset, length, self.size_bytes)?;
        if length == 0 {
            return Ok(());
        }
        self.blocking(move |file| match punch_hole(file, offset, length) {
            Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) => {
                zero_range(file, offset, length)
            }
            other => other,
        })
        .await
    }

    fn supports_trim(&self) -> bool {
        true
    }

    async fn flush(&self) -> StoreResult<()> {
        self.blocking(|file| file.sync_all()).await
    }

    async fn size(&self) -> StoreResult<u64> {
        Ok(self.size_bytes)
    }

    fn release(&self) {
        let Some(file) = self.file.write().take() else {
            return;
        };
        if let Err(e) = file.sync_all() {
            warn!(path = %self.path.display(), error = %e, "failed to sync backing file on release");
        }
        info!(path = %self.path.display(), "released backing file");
    }
}
