//! Error types for diskd.

use std::io;
use thiserror::Error;

// Re-export the protocol and device errors from the nbd crate
pub use nbd::{DeviceError, NbdError};

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("nbd device error: {0}")]
    Device(#[from] DeviceError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("range out of bounds: offset {offset} + length {length} exceeds size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("remote storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("storage has been released")]
    Released,

    #[error("storage backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: err.to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::OutOfRange {
            offset: 1020,
            length: 8,
            size: 1024,
        };
        assert!(err.to_string().contains("1020"));
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn store_error_converts_to_top_level() {
        let err: Error = StoreError::Released.into();
        assert!(matches!(err, Error::Store(StoreError::Released)));
    }
}
