//! ModuleImagesConfig reconciliation
//!
//! Each Module owns one ModuleImagesConfig with the same name listing every
//! image its kernels resolve to. Entries carry their own generation which
//! moves only when the entry's build or sign directive changes, so consumers
//! can tell a rebuild is needed without diffing the whole object.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use super::client::KubeClient;
use crate::crd::{
    LocalObjectReference, Module, ModuleImageSpec, ModuleImagesConfig, ModuleImagesConfigSpec,
};
use crate::Error;

/// Upserts the image record of a module
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImagesConfigManager: Send + Sync {
    /// Make the ModuleImagesConfig `name`/`namespace` list exactly `images`
    ///
    /// The object is owned by `owner`. Unchanged desired state performs no
    /// write; a missing owner reference aborts before any write.
    async fn reconcile(
        &self,
        name: &str,
        namespace: &str,
        images: Vec<ModuleImageSpec>,
        pull_secret: Option<LocalObjectReference>,
        owner: &Module,
    ) -> Result<(), Error>;
}

/// ModuleImagesConfig reconciler backed by [`KubeClient`]
pub struct ImagesConfigReconciler {
    kube: Arc<dyn KubeClient>,
}

impl ImagesConfigReconciler {
    /// Create a reconciler writing through `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl ImagesConfigManager for ImagesConfigReconciler {
    #[instrument(skip(self, images, pull_secret, owner), fields(images = images.len()))]
    async fn reconcile(
        &self,
        name: &str,
        namespace: &str,
        images: Vec<ModuleImageSpec>,
        pull_secret: Option<LocalObjectReference>,
        owner: &Module,
    ) -> Result<(), Error> {
        let owner_ref = owner.controller_owner_reference()?;

        match self.kube.get_images_config(name, namespace).await? {
            None => {
                let config = ModuleImagesConfig {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        owner_references: Some(vec![owner_ref]),
                        ..Default::default()
                    },
                    spec: ModuleImagesConfigSpec {
                        images: assign_generations(&[], images),
                        image_repo_secret: pull_secret,
                    },
                };
                self.kube.create_images_config(&config).await?;
                info!(count = config.spec.images.len(), "created images config");
            }
            Some(current) => {
                let spec = ModuleImagesConfigSpec {
                    images: assign_generations(&current.spec.images, images),
                    image_repo_secret: pull_secret,
                };
                let owners = with_controller(current.owner_references(), owner_ref);

                if current.spec == spec && current.owner_references() == owners.as_slice() {
                    debug!("images config up to date");
                    return Ok(());
                }

                let mut updated = current;
                updated.spec = spec;
                updated.metadata.owner_references = Some(owners);
                self.kube.replace_images_config(&updated).await?;
                info!(count = updated.spec.images.len(), "updated images config");
            }
        }
        Ok(())
    }
}

/// Compute the persisted entry list for `desired`
///
/// Duplicated images keep their first occurrence. A new image starts at
/// generation 1, a changed one moves to previous + 1 and an unchanged one
/// keeps its generation.
pub fn assign_generations(
    previous: &[ModuleImageSpec],
    desired: Vec<ModuleImageSpec>,
) -> Vec<ModuleImageSpec> {
    let previous: HashMap<&str, &ModuleImageSpec> =
        previous.iter().map(|e| (e.image.as_str(), e)).collect();

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(desired.len());
    for mut entry in desired {
        if !seen.insert(entry.image.clone()) {
            continue;
        }
        entry.generation = match previous.get(entry.image.as_str()) {
            Some(prev) if prev.same_pipeline(&entry) => prev.generation,
            Some(prev) => prev.generation + 1,
            None => 1,
        };
        out.push(entry);
    }
    out
}

/// Replace any controller reference in `current` with `owner`
fn with_controller(current: &[OwnerReference], owner: OwnerReference) -> Vec<OwnerReference> {
    let mut refs: Vec<OwnerReference> = current
        .iter()
        .filter(|r| r.controller != Some(true) && r.uid != owner.uid)
        .cloned()
        .collect();
    refs.push(owner);
    refs
}
