//! Hostdev Core Library
//!
//! Kubelet device plugins for host resources: a generic plugin manager and
//! the backends it serves (VFIO passthrough of PCI devices, bridge ports,
//! `/dev/kvm`, `/dev/hwrng`, `/dev/fuse` and `/dev/video*`).

pub mod config;
pub mod dpm;
pub mod error;
pub mod fuse;
pub mod kvm;
pub mod netlink;
pub mod network;
pub mod observability;
pub mod pci;
mod pool;
pub mod random;
pub mod runtime;
pub mod video;

// Re-export commonly used items
pub use config::ManagerConfig;
pub use dpm::{DeviceBackend, Lister, Manager};
pub use error::{HostdevError, Result};
pub use observability::init as init_observability;
pub use pool::{GrowingPool, SharedDeviceBackend};
