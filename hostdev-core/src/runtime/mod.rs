//! Container runtime lookups.
//!
//! The bridge backend only knows the device path it handed to kubelet. The
//! runtime maps that path back to the container that mounted it and to the
//! container's init process.

use crate::error::{HostdevError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

/// Resolves containers by the devices mapped into them.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// PID of the running container whose device list contains
    /// `container_path`. [`HostdevError::ContainerNotFound`] while no such
    /// container exists yet.
    async fn pid_by_device_path(&self, container_path: &str) -> Result<u32>;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self { binary: "docker".to_string() }
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary).args(args).output().await.map_err(|e| {
            HostdevError::RuntimeError { reason: format!("Failed to execute docker: {}", e) }
        })?;

        if !output.status.success() {
            return Err(HostdevError::RuntimeError {
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pid_by_device_path(&self, container_path: &str) -> Result<u32> {
        let ids = self.exec(&["ps", "-q", "--no-trunc"]).await?;
        let ids: Vec<&str> = ids.split_whitespace().collect();
        if ids.is_empty() {
            return Err(HostdevError::ContainerNotFound { path: container_path.to_string() });
        }

        let mut args = vec!["inspect"];
        args.extend(ids);
        let inspected = self.exec(&args).await?;

        find_pid(&inspected, container_path)?
            .ok_or_else(|| HostdevError::ContainerNotFound { path: container_path.to_string() })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    state: ContainerState,
    host_config: HostConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    pid: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    devices: Option<Vec<DeviceMapping>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceMapping {
    path_in_container: String,
}

/// Pick the PID of the running container mapping `container_path` from
/// `docker inspect` output.
fn find_pid(inspect_output: &str, container_path: &str) -> Result<Option<u32>> {
    let containers: Vec<InspectedContainer> = serde_json::from_str(inspect_output)
        .map_err(|e| HostdevError::RuntimeError { reason: format!("bad inspect output: {}", e) })?;

    Ok(containers
        .into_iter()
        .filter(|c| c.state.pid != 0)
        .find(|c| {
            c.host_config
                .devices
                .iter()
                .flatten()
                .any(|d| d.path_in_container == container_path)
        })
        .map(|c| {
            debug!(container = %c.id, pid = c.state.pid, "Found container for device path");
            c.state.pid
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT: &str = r#"[
        {
            "Id": "aaa",
            "State": {"Pid": 100},
            "HostConfig": {"Devices": null}
        },
        {
            "Id": "bbb",
            "State": {"Pid": 200},
            "HostConfig": {"Devices": [{
                "PathOnHost": "/var/run/device-plugin-network-bridge-fakedev",
                "PathInContainer": "/tmp/device-plugin-network-bridge/br0/br0-03",
                "CgroupPermissions": "r"
            }]}
        }
    ]"#;

    #[test]
    fn test_find_pid_by_device_path() {
        assert_eq!(
            find_pid(INSPECT, "/tmp/device-plugin-network-bridge/br0/br0-03").unwrap(),
            Some(200)
        );
        assert_eq!(find_pid(INSPECT, "/tmp/device-plugin-network-bridge/br0/br0-04").unwrap(), None);
    }

    #[test]
    fn test_find_pid_rejects_garbage() {
        assert!(matches!(find_pid("not json", "/x"), Err(HostdevError::RuntimeError { .. })));
    }
}
