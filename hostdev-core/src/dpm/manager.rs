//! Reconciles discovered resource families against running plugins.

use crate::config::ManagerConfig;
use crate::dpm::{DevicePlugin, Lister, PluginNameList};
use crate::error::{HostdevError, Result};
use crate::observability::metrics;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Kubelet lifecycle, inferred from its registration socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// `kubelet.sock` appeared: kubelet (re)started and forgot every plugin.
    SocketCreated,
    /// `kubelet.sock` was removed.
    SocketRemoved,
}

/// Keeps one running, registered [`DevicePlugin`] per discovered family.
pub struct Manager<L: Lister> {
    lister: Arc<L>,
    config: ManagerConfig,
    plugins: HashMap<String, Arc<DevicePlugin>>,
}

impl<L: Lister> Manager<L> {
    pub fn new(lister: L, config: ManagerConfig) -> Self {
        Self { lister: Arc::new(lister), config, plugins: HashMap::new() }
    }

    /// Names of the plugins currently tracked, sorted.
    pub fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tracked plugin for `name`, if any.
    pub fn plugin(&self, name: &str) -> Option<Arc<DevicePlugin>> {
        self.plugins.get(name).cloned()
    }

    /// Run until SIGTERM, SIGQUIT or SIGINT.
    ///
    /// Watches the device plugin directory for kubelet socket events.
    pub async fn run(&mut self) -> Result<()> {
        info!(dir = %self.config.device_plugin_dir.display(), "Starting device plugin manager");

        let shutdown = termination_signal()?;

        let (agent_tx, agent_rx) = mpsc::channel(16);
        let _watcher = watch_kubelet_socket(&self.config, agent_tx)?;

        self.run_until(agent_rx, shutdown).await
    }

    /// Reconcile loop driven by discovery, `agent_rx` and `shutdown`.
    ///
    /// Every tracked plugin is shut down before this returns.
    pub async fn run_until<F>(
        &mut self,
        mut agent_rx: mpsc::Receiver<AgentEvent>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (plugins_tx, mut plugins_rx) = mpsc::channel::<PluginNameList>(1);
        let lister = Arc::clone(&self.lister);
        let discovery = tokio::spawn(async move { lister.discover(plugins_tx).await });

        let mut discovering = true;
        let mut watching = true;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                names = plugins_rx.recv(), if discovering => match names {
                    Some(names) => {
                        info!(plugins = ?names, "Received new list of plugins");
                        self.handle_new_plugins(names).await;
                    }
                    None => {
                        debug!("Discovery finished, keeping the last list of plugins");
                        discovering = false;
                    }
                },
                event = agent_rx.recv(), if watching => match event {
                    Some(event) => self.handle_agent_event(event).await,
                    None => watching = false,
                },
                _ = &mut shutdown => {
                    info!("Shutting down device plugin manager");
                    break;
                }
            }
        }

        self.shut_down_plugins().await;
        discovery.abort();
        Ok(())
    }

    /// Bring the tracked set in line with `names`.
    ///
    /// New families are started concurrently, then vanished ones are shut
    /// down concurrently. Both phases complete before this returns.
    #[instrument(skip(self, names))]
    pub async fn handle_new_plugins(&mut self, names: PluginNameList) {
        let wanted: HashSet<String> = names.into_iter().collect();

        let mut additions = JoinSet::new();
        for name in &wanted {
            if self.plugins.contains_key(name) {
                continue;
            }
            info!(plugin = %name, "Adding a new plugin");
            let backend = self.lister.new_plugin(name);
            let plugin = Arc::new(DevicePlugin::new(
                self.lister.resource_namespace(),
                name,
                backend,
                &self.config,
            ));
            self.plugins.insert(name.clone(), Arc::clone(&plugin));
            additions.spawn(start_up_plugin(
                plugin,
                self.config.start_retries,
                self.config.start_retry_wait,
            ));
        }
        join_all(additions).await;

        let vanished: Vec<String> =
            self.plugins.keys().filter(|name| !wanted.contains(*name)).cloned().collect();
        let mut removals = JoinSet::new();
        for name in vanished {
            if let Some(plugin) = self.plugins.remove(&name) {
                info!(plugin = %name, "Removing plugin");
                removals.spawn(shut_down_plugin(plugin));
            }
        }
        join_all(removals).await;

        metrics::set_tracked_plugins(self.plugins.len());
    }

    /// React to kubelet coming and going.
    pub async fn handle_agent_event(&mut self, event: AgentEvent) {
        info!(?event, "Received kubelet socket event");

        let mut tasks = JoinSet::new();
        for plugin in self.plugins.values() {
            let plugin = Arc::clone(plugin);
            match event {
                AgentEvent::SocketCreated => {
                    let retries = self.config.start_retries;
                    let wait = self.config.start_retry_wait;
                    tasks.spawn(async move {
                        // kubelet lost every registration, so a running
                        // server has to register again.
                        stop_plugin_server(&plugin).await;
                        start_plugin_server(&plugin, retries, wait).await;
                    });
                }
                AgentEvent::SocketRemoved => {
                    tasks.spawn(async move { stop_plugin_server(&plugin).await });
                }
            }
        }
        join_all(tasks).await;
    }

    async fn shut_down_plugins(&mut self) {
        let mut tasks = JoinSet::new();
        for (_, plugin) in self.plugins.drain() {
            tasks.spawn(shut_down_plugin(plugin));
        }
        join_all(tasks).await;
        metrics::set_tracked_plugins(0);
    }
}

async fn join_all(mut tasks: JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("Plugin lifecycle task failed: {}", e);
        }
    }
}

async fn start_up_plugin(plugin: Arc<DevicePlugin>, retries: u32, wait: Duration) {
    if let Err(e) = plugin.backend().start().await {
        error!(plugin = %plugin.name(), "Failed to start plugin: {}", e);
    }
    start_plugin_server(&plugin, retries, wait).await;
}

async fn shut_down_plugin(plugin: Arc<DevicePlugin>) {
    stop_plugin_server(&plugin).await;
    if let Err(e) = plugin.backend().stop().await {
        error!(plugin = %plugin.name(), "Failed to stop plugin: {}", e);
    }
}

/// Start with a fixed wait between attempts. Returns whether the plugin runs.
async fn start_plugin_server(plugin: &DevicePlugin, retries: u32, wait: Duration) -> bool {
    let retries = retries.max(1);
    for attempt in 1..=retries {
        match plugin.start_server().await {
            Ok(()) => {
                metrics::record_plugin_started(plugin.resource_name());
                return true;
            }
            Err(e) if attempt == retries => {
                error!(
                    plugin = %plugin.name(),
                    "Failed to start plugin server within {} tries: {}", retries, e
                );
            }
            Err(e) => {
                warn!(
                    plugin = %plugin.name(),
                    attempt,
                    "Failed to start plugin server, waiting {:?} before next try: {}", wait, e
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
    metrics::record_plugin_start_failure(plugin.resource_name());
    false
}

async fn stop_plugin_server(plugin: &DevicePlugin) {
    if let Err(e) = plugin.stop_server().await {
        error!(plugin = %plugin.name(), "Failed to stop plugin server: {}", e);
    }
}

/// Map a directory event to a kubelet lifecycle event.
pub(crate) fn classify_event(event: &Event, kubelet_socket: &Path) -> Option<AgentEvent> {
    let agent_event = match event.kind {
        EventKind::Create(_) => AgentEvent::SocketCreated,
        EventKind::Remove(_) => AgentEvent::SocketRemoved,
        _ => return None,
    };

    let name = kubelet_socket.file_name()?;
    event.paths.iter().any(|p| p.file_name() == Some(name)).then_some(agent_event)
}

fn watch_kubelet_socket(
    config: &ManagerConfig,
    tx: mpsc::Sender<AgentEvent>,
) -> Result<RecommendedWatcher> {
    let kubelet_socket = config.kubelet_socket();

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) => {
                if let Some(agent_event) = classify_event(&event, &kubelet_socket) {
                    if tx.blocking_send(agent_event).is_err() {
                        debug!("Manager stopped, dropping kubelet socket event");
                    }
                }
            }
            Err(e) => error!("Device plugin directory watch error: {}", e),
        },
        Config::default(),
    )
    .map_err(|e| HostdevError::InvalidConfig {
        reason: format!("failed to initialize directory watch: {}", e),
    })?;

    watcher.watch(&config.device_plugin_dir, RecursiveMode::NonRecursive).map_err(|e| {
        HostdevError::InvalidConfig {
            reason: format!(
                "failed to watch {}: {}",
                config.device_plugin_dir.display(),
                e
            ),
        }
    })?;

    Ok(watcher)
}

/// Resolves on the first SIGTERM, SIGQUIT or SIGINT.
///
/// Handlers are installed before this returns so no signal is missed.
fn termination_signal() -> Result<impl Future<Output = ()>> {
    let install = |kind: SignalKind| {
        signal(kind).map_err(|e| HostdevError::Internal(format!("signal handler: {}", e)))
    };
    let mut term = install(SignalKind::terminate())?;
    let mut quit = install(SignalKind::quit())?;
    let mut int = install(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = term.recv() => info!("Received SIGTERM"),
            _ = quit.recv() => info!("Received SIGQUIT"),
            _ = int.recv() => info!("Received SIGINT"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpm::{healthy_device, DeviceBackend};
    use async_trait::async_trait;
    use hostdev_api::v1beta1::{AllocateRequest, AllocateResponse, Device};
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    #[derive(Default)]
    struct Hooks {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    struct CountingBackend {
        hooks: Arc<Hooks>,
        devices: watch::Receiver<Vec<Device>>,
    }

    #[async_trait]
    impl DeviceBackend for CountingBackend {
        fn devices(&self) -> watch::Receiver<Vec<Device>> {
            self.devices.clone()
        }

        async fn allocate(&self, _request: AllocateRequest) -> Result<AllocateResponse> {
            Ok(AllocateResponse::default())
        }

        async fn start(&self) -> Result<()> {
            self.hooks.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.hooks.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FixedLister {
        hooks: Arc<Hooks>,
        lists: Vec<PluginNameList>,
    }

    #[async_trait]
    impl Lister for FixedLister {
        fn resource_namespace(&self) -> &str {
            "example.com"
        }

        async fn discover(&self, tx: mpsc::Sender<PluginNameList>) {
            for list in &self.lists {
                if tx.send(list.clone()).await.is_err() {
                    return;
                }
            }
        }

        fn new_plugin(&self, _name: &str) -> Arc<dyn DeviceBackend> {
            let (_tx, rx) = watch::channel(vec![healthy_device("unit0")]);
            Arc::new(CountingBackend { hooks: Arc::clone(&self.hooks), devices: rx })
        }
    }

    fn manager(dir: &Path, lists: Vec<PluginNameList>) -> (Manager<FixedLister>, Arc<Hooks>) {
        let hooks = Arc::new(Hooks::default());
        let config = ManagerConfig {
            device_plugin_dir: dir.to_path_buf(),
            start_retries: 1,
            start_retry_wait: Duration::from_millis(1),
            serve_poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        (Manager::new(FixedLister { hooks: Arc::clone(&hooks), lists }, config), hooks)
    }

    fn names(list: &[&str]) -> PluginNameList {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_kubelet_socket_events() {
        let socket = PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock");

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(socket.clone());
        assert_eq!(classify_event(&created, &socket), Some(AgentEvent::SocketCreated));

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(socket.clone());
        assert_eq!(classify_event(&removed, &socket), Some(AgentEvent::SocketRemoved));

        let modified = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(socket.clone());
        assert_eq!(classify_event(&modified, &socket), None);

        let other = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/var/lib/kubelet/device-plugins/devices.kubevirt.io_kvm"));
        assert_eq!(classify_event(&other, &socket), None);
    }

    #[tokio::test]
    async fn test_reconcile_adds_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, hooks) = manager(dir.path(), vec![]);

        manager.handle_new_plugins(names(&["a", "b"])).await;
        assert_eq!(manager.tracked(), names(&["a", "b"]));
        assert_eq!(hooks.started.load(Ordering::SeqCst), 2);

        manager.handle_new_plugins(names(&["b", "c", "c"])).await;
        assert_eq!(manager.tracked(), names(&["b", "c"]));
        assert_eq!(hooks.started.load(Ordering::SeqCst), 3);
        assert_eq!(hooks.stopped.load(Ordering::SeqCst), 1);

        manager.handle_new_plugins(vec![]).await;
        assert!(manager.tracked().is_empty());
        assert_eq!(hooks.stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_socket_removed_keeps_plugins_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, hooks) = manager(dir.path(), vec![]);

        manager.handle_new_plugins(names(&["a"])).await;
        manager.handle_agent_event(AgentEvent::SocketRemoved).await;

        assert_eq!(manager.tracked(), names(&["a"]));
        assert_eq!(hooks.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_until_shuts_everything_down() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, hooks) = manager(dir.path(), vec![names(&["a"]), names(&["a", "b"])]);

        let (_agent_tx, agent_rx) = mpsc::channel(1);
        let shutdown = tokio::time::sleep(Duration::from_millis(500));
        manager.run_until(agent_rx, shutdown).await.unwrap();

        assert!(manager.tracked().is_empty());
        assert_eq!(hooks.started.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.stopped.load(Ordering::SeqCst), 2);
    }
}
