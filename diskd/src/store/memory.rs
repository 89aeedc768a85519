//! Volatile in-memory storage.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{Storage, StoreResult, check_range};

/// A zero-initialized byte buffer of fixed size.
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size_bytes as usize]),
        }
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn read_at(&self, offset: u64, length: usize) -> StoreResult<Bytes> {
        let data = self.data.read();
        check_range(offset, length as u64, data.len() as u64)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&data[start..start + length]))
    }

    async fn write_at(&self, offset: u64, buf: Bytes) -> StoreResult<()> {
        let mut data = self.data.write();
        check_range(offset, buf.len() as u64, data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(&buf);
        Ok(())
    }

    async fn trim_at(&self, offset: u64, length: u64) -> StoreResult<()> {
        let mut data = self.data.write();
        check_range(offset, length, data.len() as u64)?;
        let start = offset as usize;
        data[start..start + length as usize].fill(0);
        Ok(())
    }

    fn supports_trim(&self) -> bool {
        true
    }

    async fn size(&self) -> StoreResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn release(&self) {
        tracing::debug!("releasing memory storage");
    }
}
