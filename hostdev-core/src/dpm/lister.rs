//! Discovery of resource families.

use crate::dpm::DeviceBackend;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Complete set of resource family names present on the node.
pub type PluginNameList = Vec<String>;

/// Source of resource families for a [`Manager`](crate::dpm::Manager).
#[async_trait]
pub trait Lister: Send + Sync + 'static {
    /// Namespace prefixed to every family, e.g. `devices.kubevirt.io`.
    fn resource_namespace(&self) -> &str;

    /// Push the full list of families, once or whenever it changes.
    ///
    /// Each value replaces the previous one. Returning ends discovery; the
    /// last pushed list stays in effect. The task is aborted at shutdown.
    async fn discover(&self, tx: mpsc::Sender<PluginNameList>);

    /// Create the backend serving one family.
    fn new_plugin(&self, name: &str) -> Arc<dyn DeviceBackend>;
}
