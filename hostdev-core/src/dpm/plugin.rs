//! A single device plugin: gRPC server plus kubelet registration.

use crate::config::ManagerConfig;
use crate::dpm::DeviceBackend;
use crate::error::{HostdevError, Result};
use crate::observability::metrics;
use hostdev_api::v1beta1::device_plugin_server::{self, DevicePluginServer};
use hostdev_api::v1beta1::registration_client::RegistrationClient;
use hostdev_api::v1beta1::{
    AllocateRequest, AllocateResponse, DevicePluginOptions, Empty, ListAndWatchResponse,
    PreStartContainerRequest, PreStartContainerResponse, RegisterRequest,
};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_stream::Stream;
use tonic::transport::{Endpoint, Server, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;
use tracing::{debug, error, info, instrument, warn};

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Server half of a plugin that is currently serving.
struct RunningServer {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<std::result::Result<(), tonic::transport::Error>>,
}

/// One device plugin instance, owned by the manager.
///
/// The `server` mutex is the start mutex: it serializes start and stop, and
/// `Some` means the socket is bound and the plugin registered.
pub struct DevicePlugin {
    name: String,
    resource_name: String,
    socket_path: PathBuf,
    kubelet_socket: PathBuf,
    backend: Arc<dyn DeviceBackend>,
    serve_poll_attempts: u32,
    serve_poll_interval: Duration,
    stop_timeout: Duration,
    server: Mutex<Option<RunningServer>>,
}

impl DevicePlugin {
    /// Create a stopped plugin for `name` within `namespace`.
    pub fn new(
        namespace: &str,
        name: &str,
        backend: Arc<dyn DeviceBackend>,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            resource_name: format!("{}/{}", namespace, name),
            socket_path: config.device_plugin_dir.join(format!("{}_{}", namespace, name)),
            kubelet_socket: config.kubelet_socket(),
            backend,
            serve_poll_attempts: config.serve_poll_attempts.max(1),
            serve_poll_interval: config.serve_poll_interval,
            stop_timeout: config.stop_timeout,
            server: Mutex::new(None),
        }
    }

    /// Family name as reported by discovery.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Qualified resource name, `<namespace>/<family>`.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub async fn is_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    /// Start the gRPC server and register with kubelet.
    ///
    /// Calling this on a running plugin is a no-op. A failed registration
    /// stops the server again before returning the error.
    #[instrument(skip(self), fields(resource = %self.resource_name))]
    pub async fn start_server(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            debug!("Plugin server already running");
            return Ok(());
        }

        let running = self.serve().await?;

        if let Err(e) = self.register().await {
            if let Err(stop_err) = self.shutdown_server(running).await {
                warn!("Failed to roll back plugin server: {}", stop_err);
            }
            return Err(e);
        }

        *server = Some(running);
        Ok(())
    }

    /// Stop serving and remove the socket. Stopping a stopped plugin only logs.
    #[instrument(skip(self), fields(resource = %self.resource_name))]
    pub async fn stop_server(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        match server.take() {
            Some(running) => self.shutdown_server(running).await,
            None => {
                info!("Tried to stop a plugin server that is not running");
                Ok(())
            }
        }
    }

    async fn serve(&self) -> Result<RunningServer> {
        debug!(socket = %self.socket_path.display(), "Starting plugin gRPC server");

        self.cleanup()?;

        let uds = UnixListener::bind(&self.socket_path).map_err(|e| HostdevError::ServeFailed {
            resource: self.resource_name.clone(),
            reason: format!("failed to bind {}: {}", self.socket_path.display(), e),
        })?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let service = PluginService {
            resource_name: self.resource_name.clone(),
            backend: Arc::clone(&self.backend),
            stopped: shutdown_rx.clone(),
        };

        let task = tokio::spawn(
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(uds), async move {
                    let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
                }),
        );
        let running = RunningServer { shutdown: shutdown_tx, task };

        for attempt in 1..=self.serve_poll_attempts {
            if running.task.is_finished() {
                break;
            }
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                debug!(attempt, "Plugin server is accepting connections");
                return Ok(running);
            }
            tokio::time::sleep(self.serve_poll_interval).await;
        }

        let _ = self.shutdown_server(running).await;
        Err(HostdevError::ServeFailed {
            resource: self.resource_name.clone(),
            reason: "server did not become reachable".to_string(),
        })
    }

    async fn register(&self) -> Result<()> {
        let endpoint = self
            .socket_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        info!(endpoint = %endpoint, "Registering with kubelet");

        let kubelet_socket = self.kubelet_socket.clone();
        let registration_error = |reason: String| HostdevError::RegistrationFailed {
            resource: self.resource_name.clone(),
            reason,
        };

        // Create a dummy URI (required by tonic but not used for Unix sockets)
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| registration_error(e.to_string()))?
            .connect_timeout(REGISTRATION_TIMEOUT)
            .timeout(REGISTRATION_TIMEOUT)
            .connect_with_connector(service_fn(move |_: Uri| {
                UnixStream::connect(kubelet_socket.clone())
            }))
            .await
            .map_err(|e| {
                registration_error(format!(
                    "could not dial {}: {}",
                    self.kubelet_socket.display(),
                    e
                ))
            })?;

        let request = RegisterRequest {
            version: hostdev_api::VERSION.to_string(),
            endpoint,
            resource_name: self.resource_name.clone(),
            options: Some(self.backend.options()),
        };

        RegistrationClient::new(channel).register(request).await.map_err(|status| {
            error!("Registration failed, make sure the DevicePlugins feature gate is enabled");
            registration_error(status.message().to_string())
        })?;

        metrics::record_registration(&self.resource_name);
        Ok(())
    }

    async fn shutdown_server(&self, running: RunningServer) -> Result<()> {
        debug!("Stopping plugin gRPC server");

        let _ = running.shutdown.send(true);
        let abort = running.task.abort_handle();
        match tokio::time::timeout(self.stop_timeout, running.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("Plugin server exited with error: {}", e),
            Ok(Err(e)) => warn!("Plugin server task failed: {}", e),
            Err(_) => {
                warn!("Plugin server did not drain in {:?}, aborting", self.stop_timeout);
                abort.abort();
            }
        }

        self.cleanup()
    }

    /// Remove the plugin socket, ignoring a missing file.
    fn cleanup(&self) -> Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!(socket = %self.socket_path.display(), "Could not clean up socket: {}", e);
                Err(HostdevError::io(&self.socket_path, e))
            }
        }
    }
}

impl std::fmt::Debug for DevicePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePlugin")
            .field("resource_name", &self.resource_name)
            .field("socket_path", &self.socket_path)
            .finish()
    }
}

/// gRPC face of a plugin, alive for one server run.
struct PluginService {
    resource_name: String,
    backend: Arc<dyn DeviceBackend>,
    stopped: watch::Receiver<bool>,
}

#[tonic::async_trait]
impl device_plugin_server::DevicePlugin for PluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(self.backend.options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = std::result::Result<ListAndWatchResponse, Status>> + Send>>;

    #[instrument(skip(self, _request), fields(resource = %self.resource_name))]
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        info!("gRPC: ListAndWatch");

        let (tx, rx) = mpsc::channel(4);
        let mut devices = self.backend.devices();
        let mut stopped = self.stopped.clone();

        tokio::spawn(async move {
            let snapshot = devices.borrow_and_update().clone();
            if tx.send(Ok(ListAndWatchResponse { devices: snapshot })).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    changed = devices.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = devices.borrow_and_update().clone();
                        debug!(devices = snapshot.len(), "Sending updated device list");
                        if tx.send(Ok(ListAndWatchResponse { devices: snapshot })).await.is_err() {
                            break;
                        }
                    }
                    _ = async {
                        let _ = stopped.wait_for(|stopped| *stopped).await;
                    } => break,
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::ListAndWatchStream))
    }

    #[instrument(skip(self, request), fields(resource = %self.resource_name))]
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        info!(containers = request.container_requests.len(), "gRPC: Allocate");

        match self.backend.allocate(request).await {
            Ok(response) => {
                metrics::record_allocation(&self.resource_name, true);
                Ok(Response::new(response))
            }
            Err(e) => {
                error!("Allocation failed: {}", e);
                metrics::record_allocation(&self.resource_name, false);
                Err(e.into())
            }
        }
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> std::result::Result<Response<PreStartContainerResponse>, Status> {
        let response = self.backend.pre_start_container(request.into_inner()).await?;
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpm::healthy_device;
    use async_trait::async_trait;
    use hostdev_api::v1beta1::Device;

    struct StaticBackend {
        devices: watch::Receiver<Vec<Device>>,
    }

    #[async_trait]
    impl DeviceBackend for StaticBackend {
        fn devices(&self) -> watch::Receiver<Vec<Device>> {
            self.devices.clone()
        }

        async fn allocate(&self, _request: AllocateRequest) -> Result<AllocateResponse> {
            Ok(AllocateResponse::default())
        }
    }

    fn plugin_in(dir: &Path) -> DevicePlugin {
        let (_tx, rx) = watch::channel(vec![healthy_device("a0")]);
        let config = ManagerConfig {
            device_plugin_dir: dir.to_path_buf(),
            serve_poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        DevicePlugin::new("example.com", "a", Arc::new(StaticBackend { devices: rx }), &config)
    }

    #[test]
    fn test_names_are_derived_from_family() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_in(dir.path());
        assert_eq!(plugin.name(), "a");
        assert_eq!(plugin.resource_name(), "example.com/a");
        assert_eq!(plugin.socket_path(), dir.path().join("example.com_a"));
    }

    #[tokio::test]
    async fn test_stop_never_started_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_in(dir.path());
        assert!(plugin.stop_server().await.is_ok());
        assert!(plugin.stop_server().await.is_ok());
        assert!(!plugin.is_running().await);
    }

    #[tokio::test]
    async fn test_failed_registration_rolls_back_server() {
        // No kubelet socket exists in the directory.
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_in(dir.path());

        let result = plugin.start_server().await;
        assert!(matches!(result, Err(HostdevError::RegistrationFailed { .. })));
        assert!(!plugin.is_running().await);
        assert!(!plugin.socket_path().exists());
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = plugin_in(dir.path());
        std::fs::write(plugin.socket_path(), b"stale").unwrap();

        let running = plugin.serve().await.unwrap();
        assert!(UnixStream::connect(plugin.socket_path()).await.is_ok());

        plugin.shutdown_server(running).await.unwrap();
        assert!(!plugin.socket_path().exists());
    }
}
