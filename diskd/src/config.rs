//! Configuration for diskd.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default export size: 100 MiB.
pub const DEFAULT_DISK_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub nbd: NbdConfig,
    #[serde(default)]
    pub replica: ReplicaConfig,
}

/// How the server is connected to the kernel device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    /// An in-process unix socket pair; the server skips the greeting.
    #[default]
    SocketPair,
    /// A loopback TCP connection to the local listener.
    Tcp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Kernel device node to attach, e.g. `/dev/nbd0`. Server-only when unset.
    pub path: Option<PathBuf>,
    pub mode: DeviceMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub size_bytes: u64,
    /// Backing file for the file backend.
    pub path: PathBuf,
    /// Replica address for the remote backend. Selects the remote backend
    /// whenever it is set.
    pub remote: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            size_bytes: DEFAULT_DISK_SIZE,
            path: PathBuf::from("diskd.data"),
            remote: None,
        }
    }
}

impl StorageConfig {
    /// Backend that will actually be built for this configuration.
    pub fn kind(&self) -> BackendKind {
        if self.remote.is_some() {
            BackendKind::Remote
        } else {
            self.backend
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.size_bytes",
                reason: "must be > 0",
            });
        }
        if self.kind() == BackendKind::Remote && self.remote.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidValue {
                field: "storage.remote",
                reason: "remote backend requires an address",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    /// TCP port of the NBD listener. Binds on all interfaces.
    pub port: u16,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self { port: 10809 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub address: String,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:10808".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.storage.size_bytes, 100 * 1024 * 1024);
        assert_eq!(config.storage.path, PathBuf::from("diskd.data"));
        assert_eq!(config.storage.kind(), BackendKind::Memory);
        assert_eq!(config.nbd.port, 10809);
        assert_eq!(config.replica.address, "0.0.0.0:10808");
        assert_eq!(config.device.mode, DeviceMode::SocketPair);
        assert!(config.device.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_size() {
        let config = StorageConfig {
            size_bytes: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "storage.size_bytes",
                ..
            })
        ));
    }

    #[test]
    fn remote_requires_address() {
        let config = StorageConfig {
            backend: BackendKind::Remote,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn remote_address_selects_remote_backend() {
        let config = StorageConfig {
            backend: BackendKind::File,
            remote: Some("replica:10808".to_string()),
            ..Default::default()
        };
        assert_eq!(config.kind(), BackendKind::Remote);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_toml() {
        let config: Config = toml::from_str(
            r#"
            [device]
            path = "/dev/nbd0"
            mode = "tcp"

            [storage]
            backend = "file"
            size_bytes = 4096
            path = "/var/lib/diskd/disk.img"

            [nbd]
            port = 10900
            "#,
        )
        .unwrap();
        assert_eq!(config.device.path, Some(PathBuf::from("/dev/nbd0")));
        assert_eq!(config.device.mode, DeviceMode::Tcp);
        assert_eq!(config.storage.kind(), BackendKind::File);
        assert_eq!(config.storage.size_bytes, 4096);
        assert_eq!(config.nbd.port, 10900);
        assert_eq!(config.replica.address, "0.0.0.0:10808");
    }

    #[test]
    fn load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diskd.toml");
        std::fs::write(&path, "[storage]\nsize_bytes = 0\n").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/diskd.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }
}
