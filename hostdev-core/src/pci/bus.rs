//! Access to the kernel's PCI bus through sysfs.

use crate::error::{HostdevError, Result};
use crate::pci::device::{group_by_family, is_valid_pci_address};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Kernel operations used to discover functions and move IOMMU groups
/// between drivers.
///
/// Methods block on sysfs I/O and are called from blocking tasks.
pub trait PciBus: Send + Sync + 'static {
    /// Every function on the bus grouped by family.
    fn families(&self) -> BTreeMap<String, Vec<String>>;

    /// IOMMU group number of a function.
    fn iommu_group(&self, address: &str) -> Result<u32>;

    /// All functions in an IOMMU group.
    fn group_devices(&self, group: u32) -> Result<Vec<String>>;

    /// Force the next probe of `address` to pick `driver`.
    fn set_driver_override(&self, address: &str, driver: &str) -> Result<()>;

    /// Unbind `address` from its driver. An unbound function is not an error.
    fn unbind(&self, address: &str) -> Result<()>;

    /// Ask the kernel to bind a driver to `address`.
    fn probe(&self, address: &str) -> Result<()>;

    /// Whether `driver` is registered with the PCI bus.
    fn has_driver(&self, driver: &str) -> bool;
}

/// [`PciBus`] backed by a sysfs tree.
#[derive(Debug, Clone)]
pub struct SysfsPciBus {
    root: PathBuf,
}

impl SysfsPciBus {
    /// Bus rooted at `root`, normally `/sys`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    fn device_dir(&self, address: &str) -> Result<PathBuf> {
        if !is_valid_pci_address(address) {
            return Err(HostdevError::InvalidPciAddress { address: address.to_string() });
        }
        Ok(self.devices_dir().join(address))
    }
}

impl Default for SysfsPciBus {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl PciBus for SysfsPciBus {
    fn families(&self) -> BTreeMap<String, Vec<String>> {
        group_by_family(&self.devices_dir())
    }

    fn iommu_group(&self, address: &str) -> Result<u32> {
        let link = self.device_dir(address)?.join("iommu_group");
        let target = fs::read_link(&link).map_err(|e| HostdevError::NoIommuGroup {
            address: address.to_string(),
            hint: format!(
                "Could not read {} ({}). Enable VT-d/AMD-Vi and boot with \
                 intel_iommu=on or amd_iommu=on.",
                link.display(),
                e
            ),
        })?;

        target
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| HostdevError::NoIommuGroup {
                address: address.to_string(),
                hint: format!("Unexpected IOMMU group link {}", target.display()),
            })
    }

    fn group_devices(&self, group: u32) -> Result<Vec<String>> {
        let dir = self.root.join("kernel/iommu_groups").join(group.to_string()).join("devices");
        let mut devices: Vec<String> = fs::read_dir(&dir)
            .map_err(|e| HostdevError::io(&dir, e))?
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        devices.sort();
        Ok(devices)
    }

    fn set_driver_override(&self, address: &str, driver: &str) -> Result<()> {
        debug!(address = %address, driver = %driver, "Overriding device driver");
        sysfs_write(&self.device_dir(address)?.join("driver_override"), driver)
    }

    fn unbind(&self, address: &str) -> Result<()> {
        let driver_link = self.device_dir(address)?.join("driver");
        let driver = match fs::read_link(&driver_link) {
            Ok(target) => target.file_name().map(|n| n.to_string_lossy().to_string()),
            Err(e) => {
                debug!(address = %address, "Device not bound to any driver: {}", e);
                return Ok(());
            }
        };

        debug!(address = %address, previous_driver = ?driver, "Unbinding device");
        // The driver may let go of the device between the check and the
        // write, so a failed unbind is only logged.
        if let Err(e) = sysfs_write(&driver_link.join("unbind"), address) {
            debug!(address = %address, "Unbind did not complete: {}", e);
        }
        Ok(())
    }

    fn probe(&self, address: &str) -> Result<()> {
        if !is_valid_pci_address(address) {
            return Err(HostdevError::InvalidPciAddress { address: address.to_string() });
        }
        debug!(address = %address, "Probing device");
        sysfs_write(&self.root.join("bus/pci/drivers_probe"), address)
    }

    fn has_driver(&self, driver: &str) -> bool {
        self.root.join("bus/pci/drivers").join(driver).exists()
    }
}

/// Write to an existing sysfs attribute without creating or truncating it.
fn sysfs_write(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)
        .map_err(|e| HostdevError::io(path, e))?;
    file.write_all(value.as_bytes()).map_err(|e| HostdevError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    /// Minimal sysfs: one function in group 7, bound to e1000e.
    fn fake_sysfs() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let r = root.path();
        let dev = r.join("bus/pci/devices/0000:00:01.0");
        let group = r.join("kernel/iommu_groups/7");
        let driver = r.join("bus/pci/drivers/e1000e");

        fs::create_dir_all(&dev).unwrap();
        fs::create_dir_all(group.join("devices/0000:00:01.0")).unwrap();
        fs::create_dir_all(&driver).unwrap();
        fs::write(dev.join("vendor"), "0x8086\n").unwrap();
        fs::write(dev.join("device"), "0x10d3\n").unwrap();
        fs::write(dev.join("driver_override"), "").unwrap();
        fs::write(driver.join("unbind"), "").unwrap();
        fs::write(r.join("bus/pci/drivers_probe"), "").unwrap();
        symlink(&group, dev.join("iommu_group")).unwrap();
        symlink(&driver, dev.join("driver")).unwrap();
        root
    }

    #[test]
    fn test_sysfs_reads() {
        let root = fake_sysfs();
        let bus = SysfsPciBus::new(root.path());

        assert_eq!(bus.families()["8086_10d3"], vec!["0000:00:01.0"]);
        assert_eq!(bus.iommu_group("0000:00:01.0").unwrap(), 7);
        assert_eq!(bus.group_devices(7).unwrap(), vec!["0000:00:01.0"]);
        assert!(bus.has_driver("e1000e"));
        assert!(!bus.has_driver("vfio-pci"));
    }

    #[test]
    fn test_sysfs_writes_land_in_attributes() {
        let root = fake_sysfs();
        let r = root.path();
        let bus = SysfsPciBus::new(r);

        bus.set_driver_override("0000:00:01.0", "vfio-pci").unwrap();
        bus.unbind("0000:00:01.0").unwrap();
        bus.probe("0000:00:01.0").unwrap();

        let read = |p: &str| fs::read_to_string(r.join(p)).unwrap();
        assert_eq!(read("bus/pci/devices/0000:00:01.0/driver_override"), "vfio-pci");
        assert_eq!(read("bus/pci/drivers/e1000e/unbind"), "0000:00:01.0");
        assert_eq!(read("bus/pci/drivers_probe"), "0000:00:01.0");
    }

    #[test]
    fn test_unbind_unbound_device_is_ok() {
        let root = fake_sysfs();
        fs::remove_file(root.path().join("bus/pci/devices/0000:00:01.0/driver")).unwrap();
        let bus = SysfsPciBus::new(root.path());
        assert!(bus.unbind("0000:00:01.0").is_ok());
    }

    #[test]
    fn test_missing_iommu_group() {
        let root = fake_sysfs();
        fs::remove_file(root.path().join("bus/pci/devices/0000:00:01.0/iommu_group")).unwrap();
        let bus = SysfsPciBus::new(root.path());
        assert!(matches!(bus.iommu_group("0000:00:01.0"), Err(HostdevError::NoIommuGroup { .. })));
    }

    #[test]
    fn test_rejects_path_like_addresses() {
        let bus = SysfsPciBus::default();
        assert!(matches!(
            bus.set_driver_override("../../x", "vfio-pci"),
            Err(HostdevError::InvalidPciAddress { .. })
        ));
    }
}
