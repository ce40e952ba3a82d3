//! Error types for hostdev.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for hostdev operations.
pub type Result<T> = std::result::Result<T, HostdevError>;

/// Main error type for hostdev.
#[derive(Error, Debug)]
pub enum HostdevError {
    // Plugin lifecycle errors
    #[error("Failed to start plugin server for {resource}: {reason}")]
    ServeFailed { resource: String, reason: String },

    #[error("Failed to register {resource} with kubelet: {reason}")]
    RegistrationFailed { resource: String, reason: String },

    #[error("Plugin hook failed for {resource}: {reason}")]
    HookFailed { resource: String, reason: String },

    // Allocation errors
    #[error("Unknown device {device_id} requested from {resource}")]
    UnknownDevice { resource: String, device_id: String },

    #[error("Allocation failed for {device_id}: {reason}")]
    AllocationFailed { device_id: String, reason: String },

    // PCI / VFIO errors
    #[error("Invalid PCI address: {address}")]
    InvalidPciAddress { address: String },

    #[error("Device {address} has no IOMMU group. {hint}")]
    NoIommuGroup { address: String, hint: String },

    #[error("Failed to rebind IOMMU group {group}: {reason}")]
    IommuRebindFailed { group: u32, reason: String },

    // Network errors
    #[error("Network setup failed: {reason}")]
    NetworkSetupFailed { reason: String },

    #[error("Failed to enter network namespace of pid {pid}: {reason}")]
    NamespaceEnterFailed { pid: u32, reason: String },

    #[error("Container not found for device path {path}")]
    ContainerNotFound { path: String },

    #[error("Container runtime error: {reason}")]
    RuntimeError { reason: String },

    // Netlink errors
    #[error("Netlink error: {reason}")]
    NetlinkError { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HostdevError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError { path: path.into(), source }
    }
}

impl From<HostdevError> for tonic::Status {
    fn from(err: HostdevError) -> Self {
        match err {
            HostdevError::UnknownDevice { .. } | HostdevError::InvalidPciAddress { .. } => {
                tonic::Status::invalid_argument(err.to_string())
            }
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
