//! Custom Resource Definitions for KMM
//!
//! This module contains all CRD definitions used by the KMM operator.

mod images_config;
mod module;
mod types;

pub use images_config::{ModuleImageSpec, ModuleImagesConfig, ModuleImagesConfigSpec};
pub use module::{Module, ModuleSpec, ModuleStatus};
pub use types::{
    Build, BuildArg, DaemonSetStatus, DevicePluginContainerSpec, DevicePluginSpec, KernelMapping,
    LocalObjectReference, ModprobeArgs, ModprobeSpec, ModuleLoaderContainerSpec,
    ModuleLoaderSpec, RegistryTls, Selector, Sign, Tolerations,
};
