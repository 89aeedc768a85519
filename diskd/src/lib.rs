//! diskd: expose memory, file or remote storage as a Linux NBD block device.
//!
//! A single daemon serves one export over the oldstyle NBD protocol and can
//! attach it to a kernel device node (`/dev/nbdX`) through either an
//! in-process unix socket pair or a loopback TCP connection. The remote
//! backend talks to a `diskd-replica` over gRPC.
//!
//! # Library Usage
//!
//! ```ignore
//! use diskd::{Config, Daemon, Supervisor};
//!
//! let daemon = Daemon::from_config(Config::default())?;
//! daemon.run(Supervisor::new(CancellationToken::new())).await?;
//! ```

pub mod attach;
pub mod config;
pub mod daemon;
pub mod error;
pub mod nbd;
pub mod replica;
pub mod shutdown;
pub mod store;

/// Generated gRPC types for the replica protocol.
pub mod proto {
    tonic::include_proto!("datadisk.v1");

    /// Encoded file descriptor set for gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("datadisk_descriptor");
}

pub use config::{Config, DeviceConfig, NbdConfig, ReplicaConfig, StorageConfig};
pub use daemon::Daemon;
pub use error::{ConfigError, DeviceError, Error, NbdError, Result, StoreError};
pub use crate::nbd::{HandoffListener, Listener, NbdServer};
pub use shutdown::{Supervisor, watch_signals};
pub use store::{Backend, Storage};
