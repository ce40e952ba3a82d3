//! Pools for shareable character devices.
//!
//! Devices like `/dev/kvm` can be handed to any number of containers, but
//! kubelet only schedules against advertised units. The pool starts with one
//! unit and grows by one every time a unit is handed out, so there is always
//! a free one.

use crate::dpm::{healthy_device, DeviceBackend};
use crate::error::{HostdevError, Result};
use async_trait::async_trait;
use hostdev_api::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DeviceSpec,
};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::debug;

/// Unit ids `<prefix>0`, `<prefix>1`, ... published on a watch channel.
pub struct GrowingPool {
    prefix: String,
    devices: watch::Sender<Vec<Device>>,
}

impl GrowingPool {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let (devices, _) = watch::channel(vec![healthy_device(format!("{}0", prefix))]);
        Self { prefix, devices }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Device>> {
        self.devices.subscribe()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.borrow().iter().any(|d| d.id == id)
    }

    /// Append one unit and notify watchers. Returns the new unit's id.
    pub fn grow(&self) -> String {
        let mut id = String::new();
        self.devices.send_modify(|devices| {
            id = format!("{}{}", self.prefix, devices.len());
            devices.push(healthy_device(id.clone()));
        });
        debug!(unit = %id, "Device pool grew");
        id
    }
}

/// Backend exposing one host device node to every container.
pub struct SharedDeviceBackend {
    name: String,
    host_path: PathBuf,
    container_path: String,
    permissions: &'static str,
    pool: GrowingPool,
}

impl SharedDeviceBackend {
    pub fn new(
        name: &str,
        host_path: impl Into<PathBuf>,
        container_path: impl Into<String>,
        permissions: &'static str,
    ) -> Self {
        Self {
            name: name.to_string(),
            host_path: host_path.into(),
            container_path: container_path.into(),
            permissions,
            pool: GrowingPool::new(name),
        }
    }

    /// Name units `<prefix>0`, `<prefix>1`, ... instead of after the device.
    pub fn with_unit_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.pool = GrowingPool::new(prefix);
        self
    }
}

#[async_trait]
impl DeviceBackend for SharedDeviceBackend {
    fn devices(&self) -> watch::Receiver<Vec<Device>> {
        self.pool.subscribe()
    }

    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse> {
        for id in request.container_requests.iter().flat_map(|r| &r.devices_ids) {
            if !self.pool.contains(id) {
                return Err(HostdevError::UnknownDevice {
                    resource: self.name.clone(),
                    device_id: id.clone(),
                });
            }
        }

        let container_responses = request
            .container_requests
            .iter()
            .map(|_| {
                self.pool.grow();
                ContainerAllocateResponse {
                    devices: vec![DeviceSpec {
                        container_path: self.container_path.clone(),
                        host_path: self.host_path.to_string_lossy().to_string(),
                        permissions: self.permissions.to_string(),
                    }],
                    ..Default::default()
                }
            })
            .collect();

        Ok(AllocateResponse { container_responses })
    }
}
