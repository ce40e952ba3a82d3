//! PCI function identity as read from sysfs.

use crate::error::{HostdevError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Regular expression to validate PCI address format: 0000:01:00.0
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$")
        .expect("Invalid PCI address regex")
});

/// One PCI function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    /// PCI address (e.g., "0000:01:00.0")
    pub address: String,
    /// Vendor ID without the `0x` prefix (e.g., "8086")
    pub vendor_id: String,
    /// Device ID without the `0x` prefix (e.g., "10d3")
    pub device_id: String,
}

impl PciDevice {
    /// Read vendor and device ids from a sysfs device directory.
    pub fn from_sysfs(device_path: &Path) -> Result<Self> {
        let address = device_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !is_valid_pci_address(&address) {
            return Err(HostdevError::InvalidPciAddress { address });
        }

        let vendor_id = read_id(&device_path.join("vendor"))?;
        let device_id = read_id(&device_path.join("device"))?;

        Ok(Self { address, vendor_id, device_id })
    }

    /// Resource family of this function.
    ///
    /// Resource names may not contain `:`, so `vendor:device` becomes
    /// `vendor_device`.
    pub fn family(&self) -> String {
        format!("{}_{}", self.vendor_id, self.device_id)
    }
}

/// Validate PCI address format.
pub fn is_valid_pci_address(address: &str) -> bool {
    PCI_ADDRESS_REGEX.is_match(address)
}

/// Group every readable function under `devices_dir` by family.
///
/// Entries whose ids cannot be read are skipped. A missing directory is an
/// empty result.
pub fn group_by_family(devices_dir: &Path) -> BTreeMap<String, Vec<String>> {
    let mut families: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let entries = match fs::read_dir(devices_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %devices_dir.display(), "No PCI devices: {}", e);
            return families;
        }
    };

    for entry in entries.flatten() {
        match PciDevice::from_sysfs(&entry.path()) {
            Ok(device) => families.entry(device.family()).or_default().push(device.address),
            Err(e) => debug!(entry = ?entry.file_name(), "Could not process device: {}", e),
        }
    }

    for addresses in families.values_mut() {
        addresses.sort();
    }

    debug!(families = ?families, "Discovered PCI devices");
    families
}

/// Read a `0x`-prefixed hex id file.
fn read_id(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).map_err(|e| HostdevError::io(path, e))?;
    Ok(raw.trim().trim_start_matches("0x").to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_device(root: &Path, address: &str, vendor: &str, device: &str) {
        let dir = root.join(address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("0x{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("0x{}\n", device)).unwrap();
    }

    #[test]
    fn test_pci_address_validation() {
        assert!(is_valid_pci_address("0000:01:00.0"));
        assert!(is_valid_pci_address("0000:ff:1f.7"));
        assert!(is_valid_pci_address("ABCD:12:34.5"));

        assert!(!is_valid_pci_address("01:00.0")); // Missing domain
        assert!(!is_valid_pci_address("0000:01:00")); // Missing function
        assert!(!is_valid_pci_address("0000:01:00.8")); // Invalid function (max 7)
        assert!(!is_valid_pci_address("invalid"));
    }

    #[test]
    fn test_family_uses_underscore() {
        let dir = tempfile::tempdir().unwrap();
        add_device(dir.path(), "0000:00:19.0", "8086", "15B7");

        let device = PciDevice::from_sysfs(&dir.path().join("0000:00:19.0")).unwrap();
        assert_eq!(device.vendor_id, "8086");
        assert_eq!(device.device_id, "15b7");
        assert_eq!(device.family(), "8086_15b7");
    }

    #[test]
    fn test_group_by_family() {
        let dir = tempfile::tempdir().unwrap();
        add_device(dir.path(), "0000:00:01.1", "8086", "10d3");
        add_device(dir.path(), "0000:00:01.0", "8086", "10d3");
        add_device(dir.path(), "0000:02:00.0", "10de", "1eb8");
        fs::create_dir_all(dir.path().join("0000:03:00.0")).unwrap(); // no ids

        let families = group_by_family(dir.path());
        assert_eq!(families.len(), 2);
        assert_eq!(families["8086_10d3"], vec!["0000:00:01.0", "0000:00:01.1"]);
        assert_eq!(families["10de_1eb8"], vec!["0000:02:00.0"]);
    }

    #[test]
    fn test_missing_tree_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(group_by_family(&dir.path().join("absent")).is_empty());
    }
}
