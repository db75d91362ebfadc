//! KMM - Kubernetes operator for out-of-tree kernel modules
//!
//! KMM resolves which kernel versions run in the fleet, builds and signs a
//! loader image per kernel when needed, and deploys loader and device-plugin
//! DaemonSets onto the matching nodes. Nodes that finished loading a module
//! get a readiness label that gates the device plugin.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Module, ModuleImagesConfig)
//! - [`controller`] - Module, image-config and node-label reconcilers
//! - [`kernel_mapper`] - Kernel version to loader configuration resolution
//! - [`pipeline`] - In-cluster build and sign collaborators
//! - [`workload`] - Loader and device-plugin DaemonSets
//! - [`patch`] - JSON merge patch construction
//! - [`metrics`] - OpenTelemetry gauges
//! - [`telemetry`] - Tracing and OTLP export setup
//! - [`config`] - Command line configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod kernel_mapper;
pub mod metrics;
pub mod naming;
pub mod patch;
pub mod pipeline;
pub mod telemetry;
pub mod workload;

#[cfg(test)]
mod fixtures;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label on every workload, Job and loader pod naming the owning Module
pub const MODULE_NAME_LABEL: &str = "kmm.node.kubernetes.io/module.name";

/// Node label carrying the full kernel version, kept current by the node-kernel reconciler
pub const KERNEL_VERSION_LABEL: &str = "kmm.node.kubernetes.io/kernel-version.full";

/// Finalizer on loader pods, held until the node readiness label is removed
pub const NODE_LABELER_FINALIZER: &str = "kmm.node.kubernetes.io/node-labeler";

/// Field manager name used for writes
pub const FIELD_MANAGER: &str = "kmm-operator";

/// Readiness label a node carries once `module` in `namespace` is loaded
pub fn ready_label_key(namespace: &str, module: &str) -> String {
    format!("kmm.node.kubernetes.io/{namespace}.{module}.ready")
}

/// Label on device-plugin workloads carrying the module version
pub fn device_plugin_version_label(namespace: &str, module: &str) -> String {
    format!("kmm.node.kubernetes.io/version-device-plugin.{namespace}.{module}")
}
