//! VFIO passthrough plugins, one per PCI vendor:device pair.

use crate::dpm::{healthy_device, DeviceBackend, Lister, PluginNameList};
use crate::error::{HostdevError, Result};
use crate::pci::bus::PciBus;
use crate::pci::iommu::{rebind_group, vfio_group_path, IommuLock, VFIO_CONTROL_DEVICE, VFIO_PCI_DRIVER};
use async_trait::async_trait;
use hostdev_api::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DeviceSpec,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Resource namespace of PCI devices.
pub const PCI_RESOURCE_NAMESPACE: &str = "devices.kubevirt.io";

/// Discovers PCI families once at startup.
pub struct PciLister {
    bus: Arc<dyn PciBus>,
    lock: IommuLock,
    families: Mutex<BTreeMap<String, Vec<String>>>,
}

impl PciLister {
    /// Lister over `bus`. Every plugin it creates shares `lock`.
    pub fn new(bus: Arc<dyn PciBus>, lock: IommuLock) -> Self {
        Self { bus, lock, families: Mutex::new(BTreeMap::new()) }
    }
}

#[async_trait]
impl Lister for PciLister {
    fn resource_namespace(&self) -> &str {
        PCI_RESOURCE_NAMESPACE
    }

    async fn discover(&self, tx: mpsc::Sender<PluginNameList>) {
        let bus = Arc::clone(&self.bus);
        let families = match tokio::task::spawn_blocking(move || bus.families()).await {
            Ok(families) => families,
            Err(e) => {
                warn!("PCI discovery failed: {}", e);
                return;
            }
        };

        let names: PluginNameList = families.keys().cloned().collect();
        info!(families = ?names, "Discovered PCI device families");
        *self.families.lock().unwrap_or_else(|p| p.into_inner()) = families;

        let _ = tx.send(names).await;
    }

    fn new_plugin(&self, name: &str) -> Arc<dyn DeviceBackend> {
        let addresses = self
            .families
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default();
        Arc::new(VfioBackend::new(name, addresses, Arc::clone(&self.bus), self.lock.clone()))
    }
}

/// Hands out PCI functions of one family through VFIO.
pub struct VfioBackend {
    family: String,
    addresses: HashSet<String>,
    bus: Arc<dyn PciBus>,
    lock: IommuLock,
    devices: watch::Sender<Vec<Device>>,
}

impl VfioBackend {
    pub fn new(
        family: &str,
        addresses: Vec<String>,
        bus: Arc<dyn PciBus>,
        lock: IommuLock,
    ) -> Self {
        let (devices, _) =
            watch::channel(addresses.iter().map(|a| healthy_device(a.as_str())).collect());
        Self {
            family: family.to_string(),
            addresses: addresses.into_iter().collect(),
            bus,
            lock,
            devices,
        }
    }
}

#[async_trait]
impl DeviceBackend for VfioBackend {
    fn devices(&self) -> watch::Receiver<Vec<Device>> {
        self.devices.subscribe()
    }

    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse> {
        let requests: Vec<Vec<String>> =
            request.container_requests.into_iter().map(|r| r.devices_ids).collect();

        for id in requests.iter().flatten() {
            if !self.addresses.contains(id) {
                return Err(HostdevError::UnknownDevice {
                    resource: self.family.clone(),
                    device_id: id.clone(),
                });
            }
        }

        let bus = Arc::clone(&self.bus);
        let lock = self.lock.clone();
        let container_responses = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            requests
                .iter()
                .map(|ids| allocate_container(bus.as_ref(), ids))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(HostdevError::internal)??;

        Ok(AllocateResponse { container_responses })
    }

    async fn start(&self) -> Result<()> {
        let bus = Arc::clone(&self.bus);
        let present = tokio::task::spawn_blocking(move || bus.has_driver(VFIO_PCI_DRIVER))
            .await
            .map_err(HostdevError::internal)?;
        if !present {
            warn!(
                family = %self.family,
                "vfio-pci driver is not loaded, allocations will fail until it is (modprobe vfio-pci)"
            );
        }
        Ok(())
    }
}

/// Rebind the groups of `ids` and describe the devices one container gets.
fn allocate_container(bus: &dyn PciBus, ids: &[String]) -> Result<ContainerAllocateResponse> {
    let mut groups: Vec<u32> = Vec::new();

    for id in ids {
        let group = bus.iommu_group(id)?;
        if groups.contains(&group) {
            debug!(address = %id, group, "IOMMU group already rebound for this container");
            continue;
        }
        rebind_group(bus, group, VFIO_PCI_DRIVER)?;
        groups.push(group);
    }

    let mut devices: Vec<DeviceSpec> = groups
        .into_iter()
        .map(|group| {
            let path = vfio_group_path(group).to_string_lossy().to_string();
            DeviceSpec { container_path: path.clone(), host_path: path, permissions: "rw".to_string() }
        })
        .collect();
    devices.push(DeviceSpec {
        container_path: VFIO_CONTROL_DEVICE.to_string(),
        host_path: VFIO_CONTROL_DEVICE.to_string(),
        permissions: "rw".to_string(),
    });

    Ok(ContainerAllocateResponse { devices, ..Default::default() })
}
