//! Kubernetes access used by the reconcilers
//!
//! Reconcilers only talk to the API server through [`KubeClient`] so every
//! convergence step can be exercised against a mock.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Module, ModuleImagesConfig};
use crate::error::is_not_found;
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting the Kubernetes reads and writes of the reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a Module, `None` when it does not exist
    async fn get_module(&self, name: &str, namespace: &str) -> Result<Option<Module>, Error>;

    /// List Modules in every namespace
    async fn list_modules(&self) -> Result<Vec<Module>, Error>;

    /// List nodes whose labels contain every entry of `selector`
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>, Error>;

    /// Delete a DaemonSet; already-deleted is success
    async fn delete_daemon_set(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Write `module.status`, conditional on `module`'s resourceVersion
    async fn replace_module_status(&self, module: &Module) -> Result<(), Error>;

    /// Fetch a Pod, `None` when it does not exist
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error>;

    /// Fetch a Node, `None` when it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Apply a JSON merge patch to a Node
    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), Error>;

    /// Apply a JSON merge patch to a Pod
    async fn patch_pod(&self, name: &str, namespace: &str, patch: &Value) -> Result<(), Error>;

    /// Fetch a ModuleImagesConfig, `None` when it does not exist
    async fn get_images_config(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ModuleImagesConfig>, Error>;

    /// Create a ModuleImagesConfig
    async fn create_images_config(&self, config: &ModuleImagesConfig) -> Result<(), Error>;

    /// Replace a ModuleImagesConfig, conditional on its resourceVersion
    async fn replace_images_config(&self, config: &ModuleImagesConfig) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Render a label map as an equality-based selector string
pub(crate) fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_module(&self, name: &str, namespace: &str) -> Result<Option<Module>, Error> {
        let api: Api<Module> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_modules(&self) -> Result<Vec<Module>, Error> {
        let api: Api<Module> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        Ok(api.list(&params).await?.items)
    }

    async fn delete_daemon_set(&self, name: &str, namespace: &str) -> Result<(), Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_module_status(&self, module: &Module) -> Result<(), Error> {
        let namespace = module.namespace().unwrap_or_default();
        let api: Api<Module> = Api::namespaced(self.client.clone(), &namespace);

        // resourceVersion in a merge patch makes the write conditional
        let body = serde_json::json!({
            "metadata": { "resourceVersion": module.resource_version() },
            "status": module.status,
        });
        api.patch_status(
            &module.name_any(),
            &Self::patch_params(),
            &Patch::Merge(&body),
        )
        .await?;
        Ok(())
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(name, &Self::patch_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_pod(&self, name: &str, namespace: &str, patch: &Value) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &Self::patch_params(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn get_images_config(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ModuleImagesConfig>, Error> {
        let api: Api<ModuleImagesConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_images_config(&self, config: &ModuleImagesConfig) -> Result<(), Error> {
        let namespace = config.namespace().unwrap_or_default();
        let api: Api<ModuleImagesConfig> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&Self::post_params(), config).await?;
        Ok(())
    }

    async fn replace_images_config(&self, config: &ModuleImagesConfig) -> Result<(), Error> {
        let namespace = config.namespace().unwrap_or_default();
        let api: Api<ModuleImagesConfig> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&config.name_any(), &Self::post_params(), config)
            .await?;
        Ok(())
    }
}
