//! PCI passthrough through VFIO.
//!
//! Discovery walks `/sys/bus/pci/devices` and groups functions by
//! vendor:device pair; each pair becomes one resource family whose device
//! units are PCI addresses. Allocation moves the IOMMU group of every
//! requested function to `vfio-pci` and exposes `/dev/vfio/<group>` plus
//! `/dev/vfio/vfio` to the container.

mod bus;
mod device;
mod iommu;
mod plugin;

pub use bus::{PciBus, SysfsPciBus};
pub use device::{group_by_family, is_valid_pci_address, PciDevice};
pub use iommu::{
    rebind_group, vfio_group_path, IommuLock, VFIO_CONTROL_DEVICE, VFIO_PCI_DRIVER,
};
pub use plugin::{PciLister, VfioBackend, PCI_RESOURCE_NAMESPACE};
