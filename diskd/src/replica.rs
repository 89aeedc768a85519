//! gRPC replica serving a local storage backend to remote diskd instances.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::proto::data_disk_server::{DataDisk, DataDiskServer};
use crate::proto::{
    FILE_DESCRIPTOR_SET, ReadRequest, ReadResponse, SizeRequest, SizeResponse, WriteRequest,
    WriteResponse,
};
use crate::store::{MAX_MESSAGE_SIZE, Storage};

/// `DataDisk` service backed by any [`Storage`].
pub struct ReplicaService<S: ?Sized> {
    storage: Arc<S>,
}

impl<S: ?Sized> ReplicaService<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

fn to_status(err: StoreError) -> Status {
    Status::internal(err.to_string())
}

#[tonic::async_trait]
impl<S> DataDisk for ReplicaService<S>
where
    S: Storage + ?Sized + 'static,
{
    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> std::result::Result<Response<ReadResponse>, Status> {
        let ReadRequest { offset, length } = request.into_inner();
        debug!(offset, length, "replica read");
        let data = self
            .storage
            .read_at(offset, length as usize)
            .await
            .map_err(to_status)?;
        Ok(Response::new(ReadResponse { data }))
    }

    async fn write(
        &self,
        request: Request<WriteRequest>,
    ) -> std::result::Result<Response<WriteResponse>, Status> {
        let WriteRequest { offset, data } = request.into_inner();
        debug!(offset, length = data.len(), "replica write");
        self.storage
            .write_at(offset, data)
            .await
            .map_err(to_status)?;
        Ok(Response::new(WriteResponse {}))
    }

    async fn size(
        &self,
        _request: Request<SizeRequest>,
    ) -> std::result::Result<Response<SizeResponse>, Status> {
        let size_bytes = self.storage.size().await.map_err(to_status)?;
        Ok(Response::new(SizeResponse { size_bytes }))
    }
}

/// Serve `storage` on `listener` until `shutdown` is cancelled.
pub async fn serve_replica<S>(
    listener: TcpListener,
    storage: Arc<S>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: Storage + ?Sized + 'static,
{
    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let service = DataDiskServer::new(ReplicaService::new(storage))
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE);

    info!(address = ?listener.local_addr().ok(), "replica accepting connections");
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
    Server::builder()
        .add_service(reflection)
        .add_service(service)
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    info!("replica stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RemoteStore};
    use bytes::Bytes;

    #[tokio::test]
    async fn remote_store_round_trips_through_replica() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_replica(
            listener,
            Arc::new(MemoryStore::new(4096)),
            shutdown.clone(),
        ));

        let remote = RemoteStore::connect(&addr.to_string()).unwrap();
        assert_eq!(remote.size().await.unwrap(), 4096);

        remote
            .write_at(100, Bytes::from(vec![0xAB; 16]))
            .await
            .unwrap();
        let data = remote.read_at(96, 24).await.unwrap();
        assert_eq!(&data[4..20], &[0xAB; 16]);

        drop(remote);
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn backend_errors_become_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_replica(
            listener,
            Arc::new(MemoryStore::new(1024)),
            shutdown.clone(),
        ));

        let remote = RemoteStore::connect(&addr.to_string()).unwrap();
        assert!(matches!(
            remote.read_at(1020, 8).await,
            Err(StoreError::Unavailable { .. })
        ));

        drop(remote);
        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
