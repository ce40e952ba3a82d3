//! Background attachment of allocated NICs to running containers.
//!
//! Allocate returns before the container exists. Each NIC becomes an
//! [`Assignment`] that the worker retries until the runtime reports a
//! container mounting the assignment path, then the NIC is created in that
//! container and plugged into the bridge.

use crate::error::Result;
use crate::netlink::ExitCleaner;
use crate::network::LinkManager;
use crate::observability::metrics;
use crate::runtime::ContainerRuntime;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A NIC handed to kubelet but not yet attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// NIC name inside the container, e.g. `br0-07`.
    pub device_id: String,
    /// Placeholder path the container sees; used to find the container.
    pub container_path: String,
    pub created_at: Instant,
}

impl Assignment {
    pub fn new(device_id: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            container_path: container_path.into(),
            created_at: Instant::now(),
        }
    }
}

struct Pending {
    assignment: Assignment,
    attempts: u32,
    next_attempt: Instant,
}

/// Owns the pending queue of one bridge.
pub struct AttachWorker {
    bridge: String,
    runtime: Arc<dyn ContainerRuntime>,
    links: Arc<dyn LinkManager>,
    cleaner: Option<ExitCleaner>,
    max_attempts: u32,
    backoff: Duration,
}

impl AttachWorker {
    /// Failed attempt `n` is retried after `n * backoff`; an assignment is
    /// dropped after `max_attempts` failures.
    pub fn new(
        bridge: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        links: Arc<dyn LinkManager>,
        max_attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            bridge: bridge.into(),
            runtime,
            links,
            cleaner: None,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Register attached host links for removal when the container exits.
    pub fn with_cleaner(mut self, cleaner: ExitCleaner) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    /// Process assignments until `rx` closes and the queue drains.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Assignment>) {
        let mut pending: VecDeque<Pending> = VecDeque::new();
        let mut open = true;

        while open || !pending.is_empty() {
            let next_due = pending.iter().map(|p| p.next_attempt).min();

            tokio::select! {
                received = rx.recv(), if open => match received {
                    Some(assignment) => {
                        info!(
                            bridge = %self.bridge,
                            nic = %assignment.device_id,
                            "Received a new assignment"
                        );
                        pending.push_back(Pending {
                            assignment,
                            attempts: 0,
                            next_attempt: Instant::now(),
                        });
                    }
                    None => open = false,
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)),
                    if next_due.is_some() =>
                {
                    self.process_due(&mut pending).await;
                }
            }
        }

        debug!(bridge = %self.bridge, "Attachment worker stopped");
    }

    async fn process_due(&self, pending: &mut VecDeque<Pending>) {
        let now = Instant::now();
        let mut remaining = VecDeque::with_capacity(pending.len());

        for mut entry in pending.drain(..) {
            if entry.next_attempt > now {
                remaining.push_back(entry);
                continue;
            }

            match self.try_attach(&entry.assignment).await {
                Ok(()) => {
                    info!(
                        bridge = %self.bridge,
                        nic = %entry.assignment.device_id,
                        waited = ?entry.assignment.created_at.elapsed(),
                        "Successfully attached pod to bridge"
                    );
                    metrics::record_assignment_attached(&self.bridge);
                }
                Err(e) => {
                    entry.attempts += 1;
                    if entry.attempts >= self.max_attempts {
                        warn!(
                            bridge = %self.bridge,
                            nic = %entry.assignment.device_id,
                            attempts = entry.attempts,
                            "Giving up on assignment: {}", e
                        );
                        metrics::record_assignment_expired(&self.bridge);
                    } else {
                        debug!(
                            nic = %entry.assignment.device_id,
                            attempt = entry.attempts,
                            "Pod attachment failed: {}", e
                        );
                        entry.next_attempt = Instant::now() + self.backoff * entry.attempts;
                        remaining.push_back(entry);
                    }
                }
            }
        }

        *pending = remaining;
    }

    async fn try_attach(&self, assignment: &Assignment) -> Result<()> {
        let pid = self.runtime.pid_by_device_path(&assignment.container_path).await?;
        let host = self.links.attach(&self.bridge, &assignment.device_id, pid).await?;
        if let Some(cleaner) = &self.cleaner {
            cleaner.register(pid, host);
        }
        Ok(())
    }
}
