//! Shared types used by the KMM CRDs

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Toleration};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referenced object
    pub name: String,
}

impl LocalObjectReference {
    /// Create a reference by name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A single `--build-arg` passed to the image builder
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildArg {
    /// Argument name
    pub name: String,
    /// Argument value
    pub value: String,
}

/// TLS options for a registry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryTls {
    /// Allow plain HTTP
    #[serde(default)]
    pub insecure: bool,
    /// Skip certificate verification
    #[serde(default, rename = "insecureSkipTLSVerify")]
    pub insecure_skip_tls_verify: bool,
}

/// In-cluster build directive
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// Build arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_args: Vec<BuildArg>,

    /// ConfigMap holding the Dockerfile under the `dockerfile` key
    pub dockerfile_config_map: LocalObjectReference,

    /// Secrets exposed to the build
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<LocalObjectReference>,

    /// TLS options for the base image registry
    #[serde(default, rename = "baseImageRegistryTLS")]
    pub base_image_registry_tls: RegistryTls,
}

/// In-cluster signing directive
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Sign {
    /// Image to sign when no build runs first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned_image: Option<String>,

    /// Secret with the private signing key
    pub key_secret: LocalObjectReference,

    /// Secret with the public certificate
    pub cert_secret: LocalObjectReference,

    /// Paths of the `.ko` files inside the image to sign
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_to_sign: Vec<String>,

    /// TLS options for the unsigned image registry
    #[serde(default, rename = "unsignedImageRegistryTLS")]
    pub unsigned_image_registry_tls: RegistryTls,
}

/// Arguments for loading and unloading a module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeArgs {
    /// Arguments used when loading
    #[serde(default)]
    pub load: Vec<String>,
    /// Arguments used when unloading
    #[serde(default)]
    pub unload: Vec<String>,
}

/// How the loader invokes modprobe
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModprobeSpec {
    /// Kernel module name
    #[serde(default)]
    pub module_name: String,

    /// Extra modprobe arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ModprobeArgs>,

    /// Raw modprobe arguments, replacing the generated command line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_args: Option<ModprobeArgs>,

    /// Directory holding the modules inside the image
    #[serde(default = "default_dir_name")]
    pub dir_name: String,

    /// Firmware directory inside the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<String>,
}

fn default_dir_name() -> String {
    "/opt".to_string()
}

/// One ordered kernel mapping rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KernelMapping {
    /// Exact kernel version to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,

    /// Regular expression the whole kernel version must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,

    /// Image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    /// Build override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    /// Sign override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,
}

/// Loader container configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderContainerSpec {
    /// modprobe configuration
    #[serde(default)]
    pub modprobe: ModprobeSpec,

    /// Default loader image, may use `${KERNEL_FULL_VERSION}` and friends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    /// Default build directive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    /// Default sign directive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,

    /// Module version, used for ordered device-plugin upgrades
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Image pull policy for the loader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Ordered kernel mapping rules
    #[serde(default)]
    pub kernel_mappings: Vec<KernelMapping>,
}

/// Loader configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleLoaderSpec {
    /// Loader container
    pub container: ModuleLoaderContainerSpec,

    /// Service account for loader pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Device plugin container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginContainerSpec {
    /// Device plugin image
    pub image: String,

    /// Container arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Container environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// Optional device plugin exposing module-provided resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePluginSpec {
    /// Device plugin container
    pub container: DevicePluginContainerSpec,

    /// Service account for device plugin pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Node counts reported for one workload kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSetStatus {
    /// Nodes matching the module selector
    #[serde(default)]
    pub nodes_matching_selector_number: i32,
    /// Nodes that should run the workload
    #[serde(default)]
    pub desired_number: i32,
    /// Nodes where the workload is available
    #[serde(default)]
    pub available_number: i32,
}

/// Label selector as a plain map
pub type Selector = BTreeMap<String, String>;

/// Tolerations applied to every workload of a module
pub type Tolerations = Vec<Toleration>;
