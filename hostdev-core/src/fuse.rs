//! `/dev/fuse` for containers mounting FUSE filesystems.
//!
//! Unlike the growing pools, FUSE advertises a fixed number of units; each
//! one stands for another container sharing the same device node.

use crate::dpm::{healthy_device, DeviceBackend, Lister, PluginNameList};
use crate::error::{HostdevError, Result};
use async_trait::async_trait;
use hostdev_api::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DeviceSpec,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub const FUSE_RESOURCE_NAMESPACE: &str = "devices.kubevirt.io";
pub const FUSE_NAME: &str = "fuse";

/// Units advertised by the FUSE plugin.
pub const FUSE_POOL_SIZE: usize = 128;

/// Reports `fuse` when the host has `/dev/fuse`.
#[derive(Debug, Clone)]
pub struct FuseLister {
    dev_root: PathBuf,
    modprobe: String,
}

impl FuseLister {
    pub fn new(dev_root: impl Into<PathBuf>) -> Self {
        Self { dev_root: dev_root.into(), modprobe: "modprobe".to_string() }
    }

    /// Program used by the start hook to load the kernel module.
    pub fn with_modprobe(mut self, program: impl Into<String>) -> Self {
        self.modprobe = program.into();
        self
    }

    fn device_path(&self) -> PathBuf {
        self.dev_root.join(FUSE_NAME)
    }
}

impl Default for FuseLister {
    fn default() -> Self {
        Self::new("/dev")
    }
}

#[async_trait]
impl Lister for FuseLister {
    fn resource_namespace(&self) -> &str {
        FUSE_RESOURCE_NAMESPACE
    }

    async fn discover(&self, tx: mpsc::Sender<PluginNameList>) {
        let mut plugins = PluginNameList::new();
        if tokio::fs::metadata(self.device_path()).await.is_ok() {
            info!(path = %self.device_path().display(), "Discovered FUSE");
            plugins.push(FUSE_NAME.to_string());
        }
        let _ = tx.send(plugins).await;
    }

    fn new_plugin(&self, _name: &str) -> Arc<dyn DeviceBackend> {
        Arc::new(FuseBackend {
            host_path: self.device_path(),
            modprobe: self.modprobe.clone(),
            devices: watch::channel(fuse_pool()).0,
        })
    }
}

fn fuse_pool() -> Vec<Device> {
    (0..FUSE_POOL_SIZE).map(|i| healthy_device(format!("{}-{:02}", FUSE_NAME, i))).collect()
}

struct FuseBackend {
    host_path: PathBuf,
    modprobe: String,
    devices: watch::Sender<Vec<Device>>,
}

#[async_trait]
impl DeviceBackend for FuseBackend {
    fn devices(&self) -> watch::Receiver<Vec<Device>> {
        self.devices.subscribe()
    }

    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse> {
        for id in request.container_requests.iter().flat_map(|r| &r.devices_ids) {
            if !self.devices.borrow().iter().any(|d| &d.id == id) {
                return Err(HostdevError::UnknownDevice {
                    resource: FUSE_NAME.to_string(),
                    device_id: id.clone(),
                });
            }
        }

        let container_responses = request
            .container_requests
            .iter()
            .map(|container| {
                debug!(units = ?container.devices_ids, "Allocated FUSE device");
                ContainerAllocateResponse {
                    devices: vec![DeviceSpec {
                        container_path: format!("/dev/{}", FUSE_NAME),
                        host_path: self.host_path.to_string_lossy().to_string(),
                        permissions: "rw".to_string(),
                    }],
                    ..Default::default()
                }
            })
            .collect();

        Ok(AllocateResponse { container_responses })
    }

    /// Load the fuse kernel module.
    async fn start(&self) -> Result<()> {
        info!("Ensuring fuse kernel module is loaded");
        let failed = |reason: String| HostdevError::HookFailed {
            resource: FUSE_NAME.to_string(),
            reason,
        };

        let status = Command::new(&self.modprobe)
            .arg(FUSE_NAME)
            .status()
            .await
            .map_err(|e| failed(format!("failed to execute {}: {}", self.modprobe, e)))?;
        if !status.success() {
            return Err(failed(format!("{} {} exited with {}", self.modprobe, FUSE_NAME, status)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdev_api::v1beta1::ContainerAllocateRequest;

    fn request(ids: &[&str]) -> AllocateRequest {
        AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: ids.iter().map(|s| s.to_string()).collect(),
            }],
        }
    }

    #[tokio::test]
    async fn test_discovery_follows_device_node() {
        let dev = tempfile::tempdir().unwrap();
        let lister = FuseLister::new(dev.path());

        let (tx, mut rx) = mpsc::channel(1);
        lister.discover(tx).await;
        assert!(rx.recv().await.unwrap().is_empty());

        std::fs::write(dev.path().join("fuse"), b"").unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        lister.discover(tx).await;
        assert_eq!(rx.recv().await.unwrap(), vec!["fuse"]);
    }

    #[tokio::test]
    async fn test_fixed_pool_and_shared_node() {
        let backend = FuseLister::new("/dev").new_plugin("fuse");
        let pool = backend.devices().borrow().clone();
        assert_eq!(pool.len(), FUSE_POOL_SIZE);
        assert_eq!(pool[0].id, "fuse-00");
        assert_eq!(pool[127].id, "fuse-127");

        let response = backend.allocate(request(&["fuse-07"])).await.unwrap();
        let spec = &response.container_responses[0].devices[0];
        assert_eq!(spec.host_path, "/dev/fuse");
        assert_eq!(spec.container_path, "/dev/fuse");
        assert_eq!(spec.permissions, "rw");

        assert_eq!(backend.devices().borrow().len(), FUSE_POOL_SIZE);
        assert!(matches!(
            backend.allocate(request(&["fuse-128"])).await,
            Err(HostdevError::UnknownDevice { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_hook_reports_modprobe_failure() {
        let ok = FuseLister::new("/dev").with_modprobe("true").new_plugin("fuse");
        assert!(ok.start().await.is_ok());

        let failing = FuseLister::new("/dev").with_modprobe("false").new_plugin("fuse");
        assert!(matches!(failing.start().await, Err(HostdevError::HookFailed { .. })));

        let missing =
            FuseLister::new("/dev").with_modprobe("/nonexistent/modprobe").new_plugin("fuse");
        assert!(matches!(missing.start().await, Err(HostdevError::HookFailed { .. })));
    }
}
