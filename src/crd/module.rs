//! Module Custom Resource Definition
//!
//! A Module declares an out-of-tree kernel module: which nodes should load it,
//! how each node kernel maps to a loader image, and how to build and sign that
//! image in-cluster when it does not exist yet.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    DaemonSetStatus, DevicePluginSpec, LocalObjectReference, ModuleLoaderSpec, Selector,
    Tolerations,
};

/// Specification for a Module
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "Module",
    plural = "modules",
    shortname = "mod",
    status = "ModuleStatus",
    namespaced,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.moduleLoader.desiredNumber"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.moduleLoader.availableNumber"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    /// Nodes that should load the module
    #[serde(default)]
    pub selector: Selector,

    /// Loader configuration
    pub module_loader: ModuleLoaderSpec,

    /// Optional device plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_plugin: Option<DevicePluginSpec>,

    /// Pull secret for loader, build and sign images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo_secret: Option<LocalObjectReference>,

    /// Tolerations applied to loader and device plugin pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Tolerations,
}

impl ModuleSpec {
    /// Returns true if the container or any kernel mapping builds in-cluster
    pub fn uses_in_cluster_build(&self) -> bool {
        let container = &self.module_loader.container;
        container.build.is_some() || container.kernel_mappings.iter().any(|m| m.build.is_some())
    }

    /// Returns true if the container or any kernel mapping signs in-cluster
    pub fn uses_in_cluster_sign(&self) -> bool {
        let container = &self.module_loader.container;
        container.sign.is_some() || container.kernel_mappings.iter().any(|m| m.sign.is_some())
    }

    /// Module version, empty when unset
    pub fn version(&self) -> &str {
        self.module_loader
            .container
            .version
            .as_deref()
            .unwrap_or_default()
    }
}

impl Module {
    /// Controller owner reference for objects created on behalf of this Module
    ///
    /// Fails when the Module has not been persisted yet (no uid).
    pub fn controller_owner_reference(&self) -> Result<OwnerReference, crate::Error> {
        self.controller_owner_ref(&()).ok_or_else(|| {
            crate::Error::internal(format!(
                "module {}/{} has no uid for an owner reference",
                self.namespace().unwrap_or_default(),
                self.name_any()
            ))
        })
    }
}

/// Observed state of a Module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    /// Loader DaemonSet counts
    #[serde(default)]
    pub module_loader: DaemonSetStatus,

    /// Device plugin DaemonSet counts
    #[serde(default)]
    pub device_plugin: DaemonSetStatus,
}
