//! IOMMU group rebinding for VFIO passthrough.
//!
//! IOMMU groups are the smallest unit of device isolation. All devices in an
//! IOMMU group share the same memory isolation domain, so a group is always
//! moved to the passthrough driver as a whole.
//!
//! Functions of one group can belong to different resource families, and so
//! to different plugins. Every rebind therefore runs under one process-wide
//! [`IommuLock`], held for the complete override/unbind/probe sequence. The
//! lock is not per group: requests touching unrelated groups wait for each
//! other too.

use crate::error::{HostdevError, Result};
use crate::pci::bus::PciBus;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Passthrough driver name.
pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

/// VFIO container device every passthrough consumer needs.
pub const VFIO_CONTROL_DEVICE: &str = "/dev/vfio/vfio";

const VFIO_DEV_PATH: &str = "/dev/vfio";

/// Serializes IOMMU group rebinding across all plugins of a process.
#[derive(Debug, Clone, Default)]
pub struct IommuLock(Arc<Mutex<()>>);

impl IommuLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is held. A poisoned lock is still usable since
    /// it guards no data.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Character device of an IOMMU group.
pub fn vfio_group_path(group: u32) -> PathBuf {
    PathBuf::from(VFIO_DEV_PATH).join(group.to_string())
}

/// Move every function of `group` to `driver`.
///
/// The caller must hold the [`IommuLock`]. Any failing step aborts the
/// sequence with [`HostdevError::IommuRebindFailed`].
pub fn rebind_group(bus: &dyn PciBus, group: u32, driver: &str) -> Result<()> {
    let failed = |step: &str, e: HostdevError| HostdevError::IommuRebindFailed {
        group,
        reason: format!("{}: {}", step, e),
    };

    let devices = bus.group_devices(group).map_err(|e| failed("listing devices", e))?;
    info!(group, devices = ?devices, driver = %driver, "Rebinding IOMMU group");

    for address in &devices {
        bus.set_driver_override(address, driver)
            .map_err(|e| failed(&format!("overriding driver of {}", address), e))?;
    }

    for address in &devices {
        bus.unbind(address).map_err(|e| failed(&format!("unbinding {}", address), e))?;
    }

    for address in &devices {
        bus.probe(address).map_err(|e| failed(&format!("probing {}", address), e))?;
    }

    debug!(group, "IOMMU group rebound");
    Ok(())
}
