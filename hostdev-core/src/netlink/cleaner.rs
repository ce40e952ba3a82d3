//! Removes host-side veth links whose container process exited.

use crate::netlink::ProcessMonitor;
use crate::network::LinkManager;
use crate::observability::metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Map from container pid to the host interfaces attached for it.
#[derive(Clone)]
pub struct ExitCleaner {
    links: Arc<Mutex<HashMap<u32, Vec<String>>>>,
    link_manager: Arc<dyn LinkManager>,
}

impl ExitCleaner {
    pub fn new(link_manager: Arc<dyn LinkManager>) -> Self {
        Self { links: Arc::new(Mutex::new(HashMap::new())), link_manager }
    }

    /// Remove `interface` once `pid` exits, together with any interface
    /// registered for `pid` before.
    pub fn register(&self, pid: u32, interface: String) {
        debug!(pid, interface = %interface, "Monitoring container process");
        self.lock().entry(pid).or_default().push(interface);
    }

    pub fn is_monitored(&self, pid: u32) -> bool {
        self.lock().contains_key(&pid)
    }

    /// Forget `pid` and delete its interfaces. Returns whether `pid` was
    /// monitored.
    pub async fn handle_exit(&self, pid: u32) -> bool {
        let Some(interfaces) = self.lock().remove(&pid) else {
            return false;
        };

        info!(pid, interfaces = ?interfaces, "Monitored process exited, removing host interfaces");
        for interface in interfaces {
            match self.link_manager.delete_link(&interface).await {
                Ok(()) => metrics::record_link_cleaned(),
                Err(e) => warn!(interface = %interface, "Failed to remove host interface: {}", e),
            }
        }
        true
    }

    /// Consume exit events until the monitor fails.
    pub async fn run(self, monitor: ProcessMonitor) {
        info!("Unused interface cleaner started");
        loop {
            match monitor.next_exits().await {
                Ok(pids) => {
                    for pid in pids {
                        self.handle_exit(pid).await;
                    }
                }
                Err(e) => warn!("Monitor failed to read new messages: {}", e),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Vec<String>>> {
        self.links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
