//! Integration tests for the plugin manager against a fake kubelet.
//!
//! Plugins serve real gRPC over Unix sockets in a temporary directory, so
//! these tests need no privileges.

mod common;

use common::{plugin_client, test_config, FakeKubelet};
use hostdev_api::v1beta1::{AllocateRequest, ContainerAllocateRequest, Empty};
use hostdev_core::dpm::{AgentEvent, DevicePlugin};
use hostdev_core::kvm::KvmLister;
use hostdev_core::{Lister, Manager};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

/// Plugin directory plus a fake `/dev` holding a `kvm` node.
fn kvm_host() -> (TempDir, TempDir) {
    let plugins = tempfile::tempdir().unwrap();
    let dev = tempfile::tempdir().unwrap();
    std::fs::write(dev.path().join("kvm"), b"").unwrap();
    (plugins, dev)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_plugins_follow_discovered_families() {
    let (plugins, dev) = kvm_host();
    let kubelet = FakeKubelet::start(plugins.path()).await;
    let mut manager = Manager::new(KvmLister::new(dev.path()), test_config(plugins.path()));

    manager.handle_new_plugins(names(&["kvm"])).await;

    let plugin = manager.plugin("kvm").unwrap();
    assert!(plugin.is_running().await);
    assert!(plugin.socket_path().exists());

    let requests = kubelet.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].resource_name, "devices.kubevirt.io/kvm");
    assert_eq!(requests[0].endpoint, "devices.kubevirt.io_kvm");
    assert_eq!(requests[0].version, "v1beta1");

    manager.handle_new_plugins(vec![]).await;
    assert!(manager.tracked().is_empty());
    assert!(!plugins.path().join("devices.kubevirt.io_kvm").exists());

    kubelet.stop().await;
}

#[tokio::test]
async fn test_start_twice_registers_once() {
    let (plugins, dev) = kvm_host();
    let kubelet = FakeKubelet::start(plugins.path()).await;
    let lister = KvmLister::new(dev.path());
    let plugin =
        DevicePlugin::new(lister.resource_namespace(), "kvm", lister.new_plugin("kvm"), &test_config(plugins.path()));

    plugin.start_server().await.unwrap();
    plugin.start_server().await.unwrap();
    assert_eq!(kubelet.registered(), names(&["devices.kubevirt.io/kvm"]));

    plugin.stop_server().await.unwrap();
    plugin.stop_server().await.unwrap();
    assert!(!plugin.socket_path().exists());

    kubelet.stop().await;
}

#[tokio::test]
async fn test_allocate_streams_grown_pool() {
    let (plugins, dev) = kvm_host();
    let kubelet = FakeKubelet::start(plugins.path()).await;
    let mut manager = Manager::new(KvmLister::new(dev.path()), test_config(plugins.path()));
    manager.handle_new_plugins(names(&["kvm"])).await;

    let socket = manager.plugin("kvm").unwrap().socket_path().to_path_buf();
    let mut client = plugin_client(&socket).await;

    let mut stream = client.list_and_watch(Empty {}).await.unwrap().into_inner();
    let first = stream.message().await.unwrap().unwrap();
    let ids: Vec<_> = first.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["kvm0"]);
    assert!(first.devices.iter().all(|d| d.health == "Healthy"));

    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest { devices_ids: names(&["kvm0"]) }],
        })
        .await
        .unwrap()
        .into_inner();
    let spec = &response.container_responses[0].devices[0];
    assert_eq!(spec.container_path, "/dev/kvm");
    assert_eq!(spec.host_path, dev.path().join("kvm").to_string_lossy());
    assert_eq!(spec.permissions, "rw");

    let second = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let ids: Vec<_> = second.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["kvm0", "kvm1"]);

    // Stopping the server ends the stream.
    manager.handle_new_plugins(vec![]).await;
    let end = tokio::time::timeout(Duration::from_secs(5), stream.message()).await.unwrap();
    assert!(!matches!(end, Ok(Some(_))));

    kubelet.stop().await;
}

#[tokio::test]
async fn test_unknown_unit_is_rejected_over_grpc() {
    let (plugins, dev) = kvm_host();
    let kubelet = FakeKubelet::start(plugins.path()).await;
    let mut manager = Manager::new(KvmLister::new(dev.path()), test_config(plugins.path()));
    manager.handle_new_plugins(names(&["kvm"])).await;

    let mut client = plugin_client(manager.plugin("kvm").unwrap().socket_path()).await;
    let status = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest { devices_ids: names(&["kvm9"]) }],
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    manager.handle_new_plugins(vec![]).await;
    kubelet.stop().await;
}

#[tokio::test]
async fn test_kubelet_restart_reregisters() {
    let (plugins, dev) = kvm_host();
    let kubelet = FakeKubelet::start(plugins.path()).await;
    let mut manager = Manager::new(KvmLister::new(dev.path()), test_config(plugins.path()));
    manager.handle_new_plugins(names(&["kvm"])).await;
    assert_eq!(kubelet.registered().len(), 1);

    kubelet.stop().await;
    manager.handle_agent_event(AgentEvent::SocketRemoved).await;
    let plugin = manager.plugin("kvm").unwrap();
    assert!(!plugin.is_running().await);
    assert_eq!(manager.tracked(), names(&["kvm"]));

    let kubelet = FakeKubelet::start(plugins.path()).await;
    manager.handle_agent_event(AgentEvent::SocketCreated).await;
    assert!(plugin.is_running().await);
    assert_eq!(kubelet.registered(), names(&["devices.kubevirt.io/kvm"]));

    manager.handle_new_plugins(vec![]).await;
    kubelet.stop().await;
}

#[tokio::test]
async fn test_run_until_discovers_and_cleans_up() {
    let (plugins, dev) = kvm_host();
    let kubelet = FakeKubelet::start(plugins.path()).await;
    let config = test_config(plugins.path());
    let lister = KvmLister::new(dev.path());

    let (_agent_tx, agent_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let mut manager = Manager::new(lister, config);
        manager
            .run_until(agent_rx, async {
                let _ = stop_rx.await;
            })
            .await
    });

    kubelet.wait_for_registrations(1).await;
    assert!(plugins.path().join("devices.kubevirt.io_kvm").exists());

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle).await.unwrap().unwrap().unwrap();
    assert!(!plugins.path().join("devices.kubevirt.io_kvm").exists());

    kubelet.stop().await;
}

#[tokio::test]
async fn test_missing_kubelet_leaves_plugin_tracked_but_stopped() {
    let (plugins, dev) = kvm_host();
    let mut manager = Manager::new(KvmLister::new(dev.path()), test_config(plugins.path()));

    manager.handle_new_plugins(names(&["kvm"])).await;

    assert_eq!(manager.tracked(), names(&["kvm"]));
    assert!(!manager.plugin("kvm").unwrap().is_running().await);
    assert!(!plugins.path().join("devices.kubevirt.io_kvm").exists());
}
