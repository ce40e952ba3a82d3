//! `/dev/kvm` for containers running virtual machines.

use crate::dpm::{DeviceBackend, Lister, PluginNameList};
use crate::pool::SharedDeviceBackend;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub const KVM_RESOURCE_NAMESPACE: &str = "devices.kubevirt.io";
pub const KVM_NAME: &str = "kvm";

/// Reports `kvm` when the host has `/dev/kvm`.
#[derive(Debug, Clone)]
pub struct KvmLister {
    dev_root: PathBuf,
}

impl KvmLister {
    pub fn new(dev_root: impl Into<PathBuf>) -> Self {
        Self { dev_root: dev_root.into() }
    }

    fn device_path(&self) -> PathBuf {
        self.dev_root.join(KVM_NAME)
    }
}

impl Default for KvmLister {
    fn default() -> Self {
        Self::new("/dev")
    }
}

#[async_trait]
impl Lister for KvmLister {
    fn resource_namespace(&self) -> &str {
        KVM_RESOURCE_NAMESPACE
    }

    async fn discover(&self, tx: mpsc::Sender<PluginNameList>) {
        let mut plugins = PluginNameList::new();
        if tokio::fs::metadata(self.device_path()).await.is_ok() {
            info!(path = %self.device_path().display(), "Discovered KVM");
            plugins.push(KVM_NAME.to_string());
        }
        let _ = tx.send(plugins).await;
    }

    fn new_plugin(&self, name: &str) -> Arc<dyn DeviceBackend> {
        Arc::new(SharedDeviceBackend::new(name, self.device_path(), "/dev/kvm", "rw"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovery_follows_device_node() {
        let dev = tempfile::tempdir().unwrap();
        let lister = KvmLister::new(dev.path());

        let (tx, mut rx) = mpsc::channel(1);
        lister.discover(tx).await;
        assert!(rx.recv().await.unwrap().is_empty());

        std::fs::write(dev.path().join("kvm"), b"").unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        lister.discover(tx).await;
        assert_eq!(rx.recv().await.unwrap(), vec!["kvm"]);
    }
}
