//! Shared fixtures: a fake kubelet and a device plugin client.

#![allow(dead_code)]

use hostdev_api::v1beta1::device_plugin_client::DevicePluginClient;
use hostdev_api::v1beta1::registration_server::{Registration, RegistrationServer};
use hostdev_api::v1beta1::{Empty, RegisterRequest};
use hostdev_core::ManagerConfig;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;

#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for Recorder {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.requests.lock().unwrap().push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Registration server on `<dir>/kubelet.sock` recording every request.
pub struct FakeKubelet {
    socket: PathBuf,
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl FakeKubelet {
    pub async fn start(dir: &Path) -> Self {
        let socket = dir.join("kubelet.sock");
        let _ = std::fs::remove_file(&socket);
        let uds = UnixListener::bind(&socket).unwrap();

        let recorder = Recorder::default();
        let requests = Arc::clone(&recorder.requests);
        let (shutdown, stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            Server::builder()
                .add_service(RegistrationServer::new(recorder))
                .serve_with_incoming_shutdown(UnixListenerStream::new(uds), async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self { socket, requests, shutdown, task }
    }

    /// Resource names registered so far, in order.
    pub fn registered(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.resource_name.clone()).collect()
    }

    pub fn requests(&self) -> Vec<RegisterRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Poll until `count` registrations arrived.
    pub async fn wait_for_registrations(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.requests.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("registrations did not arrive in time");
    }

    /// Stop serving and remove the socket, like a kubelet going away.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
        let _ = std::fs::remove_file(&self.socket);
    }
}

/// Manager settings for a temporary plugin directory, with short waits.
pub fn test_config(dir: &Path) -> ManagerConfig {
    ManagerConfig {
        device_plugin_dir: dir.to_path_buf(),
        start_retries: 2,
        start_retry_wait: Duration::from_millis(20),
        serve_poll_interval: Duration::from_millis(10),
        stop_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Client speaking to a plugin socket.
pub async fn plugin_client(socket: &Path) -> DevicePluginClient<Channel> {
    let socket = socket.to_path_buf();
    let channel = Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(socket.clone())))
        .await
        .unwrap();
    DevicePluginClient::new(channel)
}
