//! Storage served by a diskd replica over gRPC.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tonic::transport::{Channel, Endpoint};

use super::{Storage, StoreResult};
use crate::error::StoreError;
use crate::proto::data_disk_client::DataDiskClient;
use crate::proto::{ReadRequest, SizeRequest, WriteRequest};

/// Largest gRPC message accepted in either direction.
pub(crate) const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

pub struct RemoteStore {
    address: String,
    client: Mutex<Option<DataDiskClient<Channel>>>,
}

impl RemoteStore {
    /// Create a lazily connected client for the replica at `address`.
    ///
    /// `address` is either `host:port` or a full `http://` URI. No traffic is
    /// sent until the first request.
    pub fn connect(address: &str) -> StoreResult<Self> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(StoreError::unavailable)?
            .connect_lazy();
        let client = DataDiskClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE);

        tracing::info!(address, "using remote storage");
        Ok(Self {
            address: address.to_string(),
            client: Mutex::new(Some(client)),
        })
    }

    fn client(&self) -> StoreResult<DataDiskClient<Channel>> {
        self.client.lock().clone().ok_or(StoreError::Released)
    }
}

#[async_trait]
impl Storage for RemoteStore {
    async fn read_at(&self, offset: u64, length: usize) -> StoreResult<Bytes> {
        let length_u32 = u32::try_from(length).map_err(StoreError::backend)?;
        let response = self
            .client()?
            .read(ReadRequest {
                offset,
                length: length_u32,
            })
            .await
            .map_err(StoreError::unavailable)?
            .into_inner();
        if response.data.len() != length {
            return Err(StoreError::backend(format!(
                "replica returned {} bytes, expected {length}",
                response.data.len()
            )));
        }
        Ok(response.data)
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> StoreResult<()> {
        self.client()?
            .write(WriteRequest { offset, data })
            .await
            .map_err(StoreError::unavailable)?;
        Ok(())
    }

    async fn size(&self) -> StoreResult<u64> {
        let response = self
            .client()?
            .size(SizeRequest {})
            .await
            .map_err(StoreError::unavailable)?
            .into_inner();
        Ok(response.size_bytes)
    }

    fn release(&self) {
        if self.client.lock().take().is_some() {
            tracing::info!(address = %self.address, "released remote storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_replica_is_unavailable() {
        // Port 1 on loopback is reserved and refuses connections.
        let store = RemoteStore::connect("127.0.0.1:1").unwrap();
        assert!(matches!(
            store.size().await,
            Err(StoreError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn released_store_rejects_io() {
        let store = RemoteStore::connect("http://127.0.0.1:1").unwrap();
        store.release();
        store.release();
        assert!(matches!(
            store.read_at(0, 8).await,
            Err(StoreError::Released)
        ));
    }

    #[tokio::test]
    async fn invalid_address() {
        assert!(RemoteStore::connect("http://bad host").is_err());
    }
}
