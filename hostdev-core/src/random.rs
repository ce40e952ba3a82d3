//! `/dev/hwrng` for containers that want the hardware random source.

use crate::dpm::{DeviceBackend, Lister, PluginNameList};
use crate::pool::SharedDeviceBackend;
use async_trait::async_trait;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const RANDOM_RESOURCE_NAMESPACE: &str = "devices.kubevirt.io";
pub const HWRNG_NAME: &str = "hwrng";

/// Reports `hwrng` when `/dev/hwrng` yields data.
#[derive(Debug, Clone)]
pub struct RandomLister {
    dev_root: PathBuf,
}

impl RandomLister {
    pub fn new(dev_root: impl Into<PathBuf>) -> Self {
        Self { dev_root: dev_root.into() }
    }
}

impl Default for RandomLister {
    fn default() -> Self {
        Self::new("/dev")
    }
}

/// A present but idle RNG driver fails the read.
fn readable(path: &Path) -> bool {
    let mut byte = [0u8; 1];
    match std::fs::File::open(path).and_then(|mut f| f.read_exact(&mut byte)) {
        Ok(()) => true,
        Err(e) => {
            debug!(path = %path.display(), "Hardware RNG not usable: {}", e);
            false
        }
    }
}

#[async_trait]
impl Lister for RandomLister {
    fn resource_namespace(&self) -> &str {
        RANDOM_RESOURCE_NAMESPACE
    }

    async fn discover(&self, tx: mpsc::Sender<PluginNameList>) {
        let path = self.dev_root.join(HWRNG_NAME);
        let probe = path.clone();
        let present = tokio::task::spawn_blocking(move || readable(&probe)).await.unwrap_or(false);

        let mut plugins = PluginNameList::new();
        if present {
            info!(path = %path.display(), "Discovered hardware RNG");
            plugins.push(HWRNG_NAME.to_string());
        }
        let _ = tx.send(plugins).await;
    }

    fn new_plugin(&self, name: &str) -> Arc<dyn DeviceBackend> {
        Arc::new(SharedDeviceBackend::new(name, self.dev_root.join(name), format!("/dev/{}", name), "r"))
    }
}
