//! Bridge port plugins, one per host bridge named in `BRIDGES`.
//!
//! Every bridge advertises a fixed pool of NICs (`<bridge>-00` to
//! `<bridge>-99`) while the bridge exists. Allocate mounts a placeholder
//! device at a per-NIC path and returns immediately; the attachment worker
//! later finds the container by that path and plugs a veth into the bridge.

mod attach;

pub use attach::{Assignment, AttachWorker};

use crate::dpm::{healthy_device, DeviceBackend, Lister, PluginNameList};
use crate::error::{HostdevError, Result};
use crate::netlink::ExitCleaner;
use crate::network::link::bridge_exists;
use crate::network::LinkManager;
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use hostdev_api::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DeviceSpec,
};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Resource namespace of bridge ports.
pub const BRIDGE_RESOURCE_NAMESPACE: &str = "bridge.network.kubevirt.io";

/// Environment variable listing the bridges, comma separated.
pub const BRIDGES_ENV: &str = "BRIDGES";

/// Interface name limit (15) minus the NIC index suffix (3).
pub const MAX_BRIDGE_NAME_LEN: usize = 12;

/// NICs advertised per bridge.
pub const NICS_POOL_SIZE: usize = 100;

/// Host path of the placeholder block device mounted for every NIC.
pub const PLACEHOLDER_DEVICE: &str = "/var/run/device-plugin-network-bridge-fakedev";

const ASSIGNMENT_ROOT: &str = "/tmp/device-plugin-network-bridge";
const ENV_VAR_PREFIX: &str = "NETWORK_INTERFACE_RESOURCES_";
const ENV_VAR_SUFFIX_LEN: usize = 8;
const PROTOCOL_ETHERNET: &str = "Ethernet";

/// Tunables of the bridge backend.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Root of the sysfs tree used for bridge presence checks.
    pub sysfs_root: PathBuf,
    pub placeholder_device: PathBuf,
    pub attach_attempts: u32,
    /// Attempt `n` failing waits `n * attach_backoff`.
    pub attach_backoff: Duration,
    pub presence_interval: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            placeholder_device: PathBuf::from(PLACEHOLDER_DEVICE),
            attach_attempts: 60,
            attach_backoff: Duration::from_secs(1),
            presence_interval: Duration::from_secs(10),
        }
    }
}

/// Split a `BRIDGES` value into bridge names.
///
/// Blank entries are skipped. A name too long to leave room for the NIC
/// suffix is a configuration error.
pub fn parse_bridges(raw: &str) -> Result<Vec<String>> {
    let mut bridges = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if name.len() > MAX_BRIDGE_NAME_LEN {
            return Err(HostdevError::InvalidConfig {
                reason: format!(
                    "Bridge name ({}) cannot be longer than {} characters",
                    name, MAX_BRIDGE_NAME_LEN
                ),
            });
        }
        if !bridges.iter().any(|b| b == name) {
            bridges.push(name.to_string());
        }
    }
    Ok(bridges)
}

/// Reports the configured bridges once.
pub struct BridgeLister {
    bridges: Vec<String>,
    settings: BridgeSettings,
    runtime: Arc<dyn ContainerRuntime>,
    links: Arc<dyn LinkManager>,
    cleaner: Option<ExitCleaner>,
}

impl BridgeLister {
    pub fn new(
        bridges: Vec<String>,
        runtime: Arc<dyn ContainerRuntime>,
        links: Arc<dyn LinkManager>,
    ) -> Self {
        Self { bridges, settings: BridgeSettings::default(), runtime, links, cleaner: None }
    }

    pub fn with_settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cleaner(mut self, cleaner: ExitCleaner) -> Self {
        self.cleaner = Some(cleaner);
        self
    }
}

#[async_trait]
impl Lister for BridgeLister {
    fn resource_namespace(&self) -> &str {
        BRIDGE_RESOURCE_NAMESPACE
    }

    async fn discover(&self, tx: mpsc::Sender<PluginNameList>) {
        info!(bridges = ?self.bridges, "Discovered bridges");
        let _ = tx.send(self.bridges.clone()).await;
    }

    fn new_plugin(&self, bridge: &str) -> Arc<dyn DeviceBackend> {
        debug!(bridge = %bridge, "Creating bridge device plugin");
        let mut worker = AttachWorker::new(
            bridge,
            Arc::clone(&self.runtime),
            Arc::clone(&self.links),
            self.settings.attach_attempts,
            self.settings.attach_backoff,
        );
        if let Some(cleaner) = &self.cleaner {
            worker = worker.with_cleaner(cleaner.clone());
        }
        Arc::new(BridgeBackend::new(bridge, self.settings.clone(), worker))
    }
}

/// NIC pool and allocation for one bridge.
pub struct BridgeBackend {
    bridge: String,
    settings: BridgeSettings,
    devices: Arc<watch::Sender<Vec<Device>>>,
    assignments: mpsc::UnboundedSender<Assignment>,
    worker: Mutex<Option<(AttachWorker, mpsc::UnboundedReceiver<Assignment>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeBackend {
    pub fn new(bridge: &str, settings: BridgeSettings, worker: AttachWorker) -> Self {
        let present = bridge_exists(&settings.sysfs_root, bridge);
        let (devices, _) = watch::channel(advertised(bridge, present));
        let (assignments, rx) = mpsc::unbounded_channel();
        Self {
            bridge: bridge.to_string(),
            settings,
            devices: Arc::new(devices),
            assignments,
            worker: Mutex::new(Some((worker, rx))),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn is_pool_member(&self, nic: &str) -> bool {
        nic.strip_prefix(&self.bridge)
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|index| index.len() == 2)
            .and_then(|index| index.parse::<usize>().ok())
            .is_some_and(|index| index < NICS_POOL_SIZE)
    }

    fn spawn_presence_watch(&self) -> JoinHandle<()> {
        let bridge = self.bridge.clone();
        let sysfs_root = self.settings.sysfs_root.clone();
        let interval = self.settings.presence_interval;
        let devices = Arc::clone(&self.devices);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let present = bridge_exists(&sysfs_root, &bridge);
                let pool = advertised(&bridge, present);
                devices.send_if_modified(|current| {
                    if *current == pool {
                        return false;
                    }
                    info!(bridge = %bridge, present, "Bridge presence changed");
                    *current = pool;
                    true
                });
            }
        })
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Serialize)]
struct Vnic<'a> {
    name: &'a str,
    protocol: &'a str,
}

#[derive(Serialize)]
struct NetworkInterfaceResources<'a> {
    name: String,
    interfaces: Vec<Vnic<'a>>,
}

#[async_trait]
impl DeviceBackend for BridgeBackend {
    fn devices(&self) -> watch::Receiver<Vec<Device>> {
        self.devices.subscribe()
    }

    async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse> {
        for id in request.container_requests.iter().flat_map(|r| &r.devices_ids) {
            if !self.is_pool_member(id) {
                return Err(HostdevError::UnknownDevice {
                    resource: self.bridge.clone(),
                    device_id: id.clone(),
                });
            }
        }

        if self.worker.lock().unwrap_or_else(|p| p.into_inner()).is_some() {
            return Err(HostdevError::AllocationFailed {
                device_id: self.bridge.clone(),
                reason: "attachment worker has not been started".to_string(),
            });
        }

        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        let mut assignments = Vec::new();

        for container in &request.container_requests {
            let mut devices = Vec::new();
            let mut vnics = Vec::new();

            for nic in &container.devices_ids {
                let path = assignment_path(&self.bridge, nic);
                devices.push(DeviceSpec {
                    container_path: path.clone(),
                    host_path: self.settings.placeholder_device.to_string_lossy().to_string(),
                    permissions: "r".to_string(),
                });
                vnics.push(Vnic { name: nic, protocol: PROTOCOL_ETHERNET });
                assignments.push(Assignment::new(nic.as_str(), path));
            }

            let description = NetworkInterfaceResources {
                name: format!("{}/{}", BRIDGE_RESOURCE_NAMESPACE, self.bridge),
                interfaces: vnics,
            };
            let value = serde_json::to_string(&description).map_err(|e| {
                HostdevError::AllocationFailed { device_id: self.bridge.clone(), reason: e.to_string() }
            })?;

            let mut envs = HashMap::new();
            envs.insert(env_var_name(), value);
            container_responses.push(ContainerAllocateResponse {
                devices,
                envs,
                ..Default::default()
            });
        }

        for assignment in assignments {
            let device_id = assignment.device_id.clone();
            self.assignments.send(assignment).map_err(|_| HostdevError::AllocationFailed {
                device_id,
                reason: "attachment worker is not running".to_string(),
            })?;
        }

        Ok(AllocateResponse { container_responses })
    }

    async fn start(&self) -> Result<()> {
        {
            let mut tasks = self.lock_tasks();
            let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
            if let Some((worker, rx)) = worker {
                tasks.push(tokio::spawn(worker.run(rx)));
                tasks.push(self.spawn_presence_watch());
            }
        }

        ensure_placeholder_device(&self.settings.placeholder_device).map_err(|e| {
            HostdevError::HookFailed {
                resource: self.bridge.clone(),
                reason: format!("failed to create placeholder device: {}", e),
            }
        })
    }

    async fn stop(&self) -> Result<()> {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

/// The NIC pool when the bridge exists, nothing otherwise.
fn advertised(bridge: &str, present: bool) -> Vec<Device> {
    if !present {
        debug!(bridge = %bridge, "Bridge does not exist, advertising no ports");
        return Vec::new();
    }
    (0..NICS_POOL_SIZE).map(|i| healthy_device(format!("{}-{:02}", bridge, i))).collect()
}

fn assignment_path(bridge: &str, nic: &str) -> String {
    format!("{}/{}/{}", ASSIGNMENT_ROOT, bridge, nic)
}

/// `NETWORK_INTERFACE_RESOURCES_` plus eight random uppercase characters.
fn env_var_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", ENV_VAR_PREFIX, suffix[..ENV_VAR_SUFFIX_LEN].to_uppercase())
}

fn ensure_placeholder_device(path: &Path) -> Result<()> {
    if path.exists() {
        debug!("Placeholder block device already exists");
        return Ok(());
    }

    info!(path = %path.display(), "Creating placeholder block device");
    mknod(path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o644), makedev(1, 1))
        .map_err(|e| HostdevError::io(path, std::io::Error::from(e)))
}

impl Drop for BridgeBackend {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            warn!(bridge = %self.bridge, "Bridge backend dropped without stop, aborting tasks");
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}
