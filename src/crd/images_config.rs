//! ModuleImagesConfig Custom Resource Definition
//!
//! Generation-tracked record of every image a Module needs, owned by the
//! Module so it is cascade-deleted with it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Build, LocalObjectReference, Sign};

/// One image the module needs, with the pipeline that produces it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleImageSpec {
    /// Final image reference
    pub image: String,

    /// Build directive, if the image is built in-cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    /// Sign directive, if the image is signed in-cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,

    /// Bumped whenever build or sign of this entry changes
    #[serde(default)]
    pub generation: i64,
}

impl ModuleImageSpec {
    /// Returns true if build and sign are identical, ignoring generation
    pub fn same_pipeline(&self, other: &ModuleImageSpec) -> bool {
        self.build == other.build && self.sign == other.sign
    }
}

/// Specification for a ModuleImagesConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kmm.sigs.x-k8s.io",
    version = "v1beta1",
    kind = "ModuleImagesConfig",
    plural = "moduleimagesconfigs",
    shortname = "mic",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleImagesConfigSpec {
    /// Images in the order they were desired
    #[serde(default)]
    pub images: Vec<ModuleImageSpec>,

    /// Pull secret for the images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo_secret: Option<LocalObjectReference>,
}
