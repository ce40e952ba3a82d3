//! veth plumbing between containers and host bridges, using `ip`.

use crate::error::{HostdevError, Result};
use crate::network::netns::with_netns;
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

/// Host link operations needed by bridge attachment and exit cleanup.
#[async_trait]
pub trait LinkManager: Send + Sync + 'static {
    /// Create interface `nic` inside the network namespace of `pid` and
    /// enslave its host-side peer to `bridge`. Returns the host-side name.
    async fn attach(&self, bridge: &str, nic: &str, pid: u32) -> Result<String>;

    /// Delete a host link. A link that no longer exists is not an error.
    async fn delete_link(&self, name: &str) -> Result<()>;
}

/// [`LinkManager`] that shells out to iproute2.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpLinkManager;

impl IpLinkManager {
    /// Execute an ip command and check for errors.
    async fn exec_ip(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("ip").args(args).output().await.map_err(|e| {
            HostdevError::NetworkSetupFailed {
                reason: format!("Failed to execute ip command: {}", e),
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(args = ?args, "ip command failed: {}", stderr.trim());
            return Err(HostdevError::NetworkSetupFailed { reason: stderr.trim().to_string() });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl LinkManager for IpLinkManager {
    #[instrument(skip(self))]
    async fn attach(&self, bridge: &str, nic: &str, pid: u32) -> Result<String> {
        let host = host_veth_name();
        info!(host = %host, "Creating veth pair in container namespace");

        let nic_owned = nic.to_string();
        let host_owned = host.clone();
        tokio::task::spawn_blocking(move || {
            with_netns(pid, || create_veth_in_namespace(&nic_owned, &host_owned, ip_blocking))
        })
        .await
        .map_err(HostdevError::internal)??;

        let attached = async {
            self.exec_ip(&["link", "set", &host, "master", bridge]).await?;
            self.exec_ip(&["link", "set", &host, "up"]).await
        };
        if let Err(e) = attached.await {
            error!(host = %host, "Failed to attach to bridge {}: {}", bridge, e);
            if let Err(cleanup) = self.delete_link(&host).await {
                warn!(host = %host, "Failed to remove half-attached veth: {}", cleanup);
            }
            return Err(HostdevError::NetworkSetupFailed {
                reason: format!("failed to connect {} to bridge {}: {}", host, bridge, e),
            });
        }

        info!(host = %host, "Container interface attached to bridge");
        Ok(host)
    }

    #[instrument(skip(self))]
    async fn delete_link(&self, name: &str) -> Result<()> {
        match self.exec_ip(&["link", "delete", name]).await {
            Ok(_) => {
                info!("Removed host interface {}", name);
                Ok(())
            }
            Err(HostdevError::NetworkSetupFailed { reason }) if is_missing_link(&reason) => {
                debug!("Interface {} was already removed", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Runs inside the container namespace: create the pair, send the host end
/// back to our own namespace and bring the container end up.
///
/// A pair left behind by a failed later step is deleted again so the next
/// attempt can reuse `nic`.
fn create_veth_in_namespace(
    nic: &str,
    host: &str,
    ip: impl Fn(&[&str]) -> Result<()>,
) -> Result<()> {
    let own_pid = std::process::id().to_string();
    ip(&["link", "add", nic, "type", "veth", "peer", "name", host])?;

    let configured = ip(&["link", "set", host, "netns", &own_pid])
        .and_then(|()| ip(&["link", "set", nic, "up"]));
    if let Err(e) = configured {
        if let Err(cleanup) = ip(&["link", "delete", nic]) {
            warn!(nic = %nic, "Failed to remove veth pair after failed setup: {}", cleanup);
        }
        return Err(e);
    }
    Ok(())
}

/// `ip` spawned from the current thread, so it inherits the thread's
/// namespace.
fn ip_blocking(args: &[&str]) -> Result<()> {
    let output = std::process::Command::new("ip").args(args).output().map_err(|e| {
        HostdevError::NetworkSetupFailed { reason: format!("Failed to execute ip command: {}", e) }
    })?;
    if !output.status.success() {
        return Err(HostdevError::NetworkSetupFailed {
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// "veth" plus eight hex characters, within the 15 character limit.
fn host_veth_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("veth{}", &id[..8])
}

/// Whether `name` is a bridge according to the sysfs tree at `sysfs_root`.
pub fn bridge_exists(sysfs_root: &Path, name: &str) -> bool {
    !name.is_empty() && sysfs_root.join("class/net").join(name).join("bridge").exists()
}

fn is_missing_link(stderr: &str) -> bool {
    stderr.contains("Cannot find device") || stderr.contains("does not exist")
}
