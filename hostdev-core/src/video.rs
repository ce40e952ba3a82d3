//! Video capture devices, one plugin per `/dev/video<N>`.

use crate::dpm::{DeviceBackend, Lister, PluginNameList};
use crate::pool::SharedDeviceBackend;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const VIDEO_RESOURCE_NAMESPACE: &str = "devices.kubevirt.io";

static VIDEO_DEVICE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^video[0-9]$").expect("Invalid video device regex"));

/// Reports every `video0` to `video9` node under the device root.
#[derive(Debug, Clone)]
pub struct VideoLister {
    dev_root: PathBuf,
}

impl VideoLister {
    pub fn new(dev_root: impl Into<PathBuf>) -> Self {
        Self { dev_root: dev_root.into() }
    }

    async fn scan(&self) -> std::io::Result<PluginNameList> {
        let mut names = PluginNameList::new();
        let mut entries = tokio::fs::read_dir(&self.dev_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if VIDEO_DEVICE_REGEX.is_match(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Default for VideoLister {
    fn default() -> Self {
        Self::new("/dev")
    }
}

#[async_trait]
impl Lister for VideoLister {
    fn resource_namespace(&self) -> &str {
        VIDEO_RESOURCE_NAMESPACE
    }

    async fn discover(&self, tx: mpsc::Sender<PluginNameList>) {
        let plugins = match self.scan().await {
            Ok(plugins) => plugins,
            Err(e) => {
                warn!(root = %self.dev_root.display(), "Failed to scan for video devices: {}", e);
                PluginNameList::new()
            }
        };
        info!(devices = ?plugins, "Discovered video devices");
        let _ = tx.send(plugins).await;
    }

    fn new_plugin(&self, name: &str) -> Arc<dyn DeviceBackend> {
        Arc::new(
            SharedDeviceBackend::new(name, self.dev_root.join(name), format!("/dev/{}", name), "r")
                .with_unit_prefix(format!("{}-", name)),
        )
    }
}
