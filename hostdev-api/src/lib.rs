//! Kubelet device plugin gRPC API
//!
//! This crate carries the `v1beta1` device plugin contract spoken between
//! kubelet and node-local device plugins. The protobuf definitions are in
//! `proto/deviceplugin.proto` and code-generated via `tonic-build`.

// Include the generated code
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}

/// API version sent in every registration request.
pub const VERSION: &str = "v1beta1";

/// Health value advertised for usable devices.
pub const HEALTHY: &str = "Healthy";
