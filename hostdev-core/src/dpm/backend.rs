//! Resource specific half of a device plugin.

use crate::error::Result;
use async_trait::async_trait;
use hostdev_api::v1beta1::{
    AllocateRequest, AllocateResponse, Device, DevicePluginOptions, PreStartContainerRequest,
    PreStartContainerResponse,
};
use tokio::sync::watch;

/// Build a device advertised as healthy.
pub fn healthy_device(id: impl Into<String>) -> Device {
    Device { id: id.into(), health: hostdev_api::HEALTHY.to_string() }
}

/// Implemented by every resource backend (VFIO, bridge, KVM, ...).
///
/// The start and stop hooks default to no-ops; backends that prepare or tear
/// down host state override them.
#[async_trait]
pub trait DeviceBackend: Send + Sync + 'static {
    /// Current device pool. Every value published on the channel is sent to
    /// kubelet as a full ListAndWatch snapshot; intermediate values may be
    /// skipped.
    fn devices(&self) -> watch::Receiver<Vec<Device>>;

    /// Prepare the host for the requested devices. Either every requested
    /// device is satisfied or the whole request fails.
    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse>;

    /// Options advertised at registration and through GetDevicePluginOptions.
    fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions::default()
    }

    async fn pre_start_container(
        &self,
        _request: PreStartContainerRequest,
    ) -> Result<PreStartContainerResponse> {
        Ok(PreStartContainerResponse {})
    }

    /// Runs once after the plugin is created, before its first registration.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Runs once after the plugin was unregistered for good.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devices_are_advertised_healthy() {
        let device = healthy_device("kvm0");
        assert_eq!(device.id, "kvm0");
        assert_eq!(device.health, "Healthy");
    }
}
