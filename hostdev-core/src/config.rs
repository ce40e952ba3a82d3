//! Configuration management.

use crate::error::{HostdevError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Directory kubelet watches for device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Name of kubelet's registration socket inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Runtime configuration shared by the manager and every plugin it spawns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub device_plugin_dir: PathBuf,
    pub kubelet_socket_name: String,
    pub start_retries: u32,
    #[serde(with = "duration_secs")]
    pub start_retry_wait: Duration,
    pub serve_poll_attempts: u32,
    #[serde(with = "duration_millis")]
    pub serve_poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            device_plugin_dir: PathBuf::from(DEVICE_PLUGIN_PATH),
            kubelet_socket_name: KUBELET_SOCKET.to_string(),
            start_retries: 3,
            start_retry_wait: Duration::from_secs(3),
            serve_poll_attempts: 10,
            serve_poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from defaults overridden by `HOSTDEV_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("HOSTDEV_PLUGIN_DIR") {
            config.device_plugin_dir = PathBuf::from(dir);
        }
        if let Ok(raw) = std::env::var("HOSTDEV_START_RETRIES") {
            config.start_retries = parse_number("HOSTDEV_START_RETRIES", &raw)?;
        }
        if let Ok(raw) = std::env::var("HOSTDEV_START_RETRY_WAIT_SECS") {
            config.start_retry_wait =
                Duration::from_secs(parse_number("HOSTDEV_START_RETRY_WAIT_SECS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.start_retries == 0 {
            return Err(HostdevError::InvalidConfig {
                reason: "start_retries must be at least 1".to_string(),
            });
        }
        if self.kubelet_socket_name.is_empty() {
            return Err(HostdevError::InvalidConfig {
                reason: "kubelet socket name must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Full path of kubelet's registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.kubelet_socket_name)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| HostdevError::InvalidConfig {
        reason: format!("{} must be a non-negative integer, got {:?}", name, raw),
    })
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
