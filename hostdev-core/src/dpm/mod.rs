//! Device plugin manager.
//!
//! The manager keeps one [`DevicePlugin`] per resource family reported by a
//! [`Lister`], serves each over its own Unix socket and keeps it registered
//! with kubelet.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Manager                                                      │
//! │  ├── discovery task  ── Vec<family> ──┐                      │
//! │  ├── kubelet.sock watch ── AgentEvent ┼─► reconcile loop     │
//! │  └── SIGTERM/SIGQUIT/SIGINT ──────────┘                      │
//! │                                                              │
//! │ DevicePlugin (one per family)                                │
//! │  ├── gRPC server on <dir>/<namespace>_<family>               │
//! │  ├── Register(<namespace>/<family>) against kubelet.sock     │
//! │  └── DeviceBackend: devices() / allocate() / start / stop    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod backend;
mod lister;
mod manager;
mod plugin;

pub use backend::{healthy_device, DeviceBackend};
pub use lister::{Lister, PluginNameList};
pub use manager::{AgentEvent, Manager};
pub use plugin::DevicePlugin;
