//! Module workloads
//!
//! A module runs as one loader DaemonSet per kernel version and an optional
//! device-plugin DaemonSet. Rendering lives in [`daemonset`]; this module
//! applies it against the cluster.

mod daemonset;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::Module;
use crate::error::is_not_found;
use crate::kernel_mapper::ModuleLoaderData;
use crate::naming::deterministic_hash;
use crate::{ready_label_key, Error, FIELD_MANAGER, MODULE_NAME_LABEL};

pub use daemonset::{
    device_plugin_daemon_set, find_device_plugin_workload, load_command, loader_daemon_set,
    loader_kernel, stale_workloads, unload_command, workload_kind, WorkloadKind,
    WORKLOAD_TYPE_LABEL,
};

/// Annotation recording the hash of the applied DaemonSet spec
pub const SPEC_HASH_ANNOTATION: &str = "kmm.node.kubernetes.io/spec-hash";

/// Label selector matching loader pods of every module
pub fn loader_pod_selector() -> String {
    format!("{MODULE_NAME_LABEL},{WORKLOAD_TYPE_LABEL}=module-loader")
}

/// Computes and applies the desired workloads of a module
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadCreator: Send + Sync {
    /// List the DaemonSets labeled for module `name`
    async fn module_workloads(&self, name: &str, namespace: &str)
        -> Result<Vec<DaemonSet>, Error>;

    /// Create the device-plugin DaemonSet, or update `existing` in place
    async fn create_or_update_device_plugin(
        &self,
        module: &Module,
        existing: Option<DaemonSet>,
    ) -> Result<(), Error>;

    /// Create the loader DaemonSet for one kernel, or update `existing`
    async fn create_or_update_loader(
        &self,
        elc: &ModuleLoaderData,
        existing: Option<DaemonSet>,
    ) -> Result<(), Error>;

    /// Node label key that `pod`'s readiness controls for `module_name`
    fn node_label_from_pod(&self, pod: &Pod, module_name: &str) -> String;

    /// Delete workloads of `module` that are no longer desired
    ///
    /// Returns the names of deleted DaemonSets.
    async fn garbage_collect(
        &self,
        module: &Module,
        valid_kernels: &[String],
        existing: &[DaemonSet],
    ) -> Result<Vec<String>, Error>;
}

/// Real workload creator backed by the Kubernetes API
pub struct KubeWorkloadCreator {
    client: Client,
}

impl KubeWorkloadCreator {
    /// Create a new KubeWorkloadCreator wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply(
        &self,
        mut desired: DaemonSet,
        existing: Option<DaemonSet>,
    ) -> Result<(), Error> {
        let hash = deterministic_hash(&serde_json::to_string(&desired.spec)?);
        desired
            .annotations_mut()
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());

        let name = desired.name_any();
        let namespace = desired.namespace().unwrap_or_default();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        match existing {
            None => {
                api.create(&params, &desired).await?;
                info!(daemonset = %name, "created workload");
            }
            Some(mut current) => {
                let applied = current.annotations().get(SPEC_HASH_ANNOTATION);
                if applied == Some(&hash) && current.labels() == desired.labels() {
                    debug!(daemonset = %name, "workload up to date");
                    return Ok(());
                }
                current.metadata.labels = desired.metadata.labels;
                current.metadata.annotations = desired.metadata.annotations;
                current.metadata.owner_references = desired.metadata.owner_references;
                current.spec = desired.spec;
                let current_name = current.name_any();
                api.replace(&current_name, &params, &current).await?;
                info!(daemonset = %current_name, "updated workload");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadCreator for KubeWorkloadCreator {
    async fn module_workloads(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Vec<DaemonSet>, Error> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{MODULE_NAME_LABEL}={name}"));
        Ok(api.list(&params).await?.items)
    }

    async fn create_or_update_device_plugin(
        &self,
        module: &Module,
        existing: Option<DaemonSet>,
    ) -> Result<(), Error> {
        match device_plugin_daemon_set(module)? {
            Some(desired) => self.apply(desired, existing).await,
            None => Ok(()),
        }
    }

    async fn create_or_update_loader(
        &self,
        elc: &ModuleLoaderData,
        existing: Option<DaemonSet>,
    ) -> Result<(), Error> {
        self.apply(loader_daemon_set(elc)?, existing).await
    }

    fn node_label_from_pod(&self, pod: &Pod, module_name: &str) -> String {
        ready_label_key(&pod.namespace().unwrap_or_default(), module_name)
    }

    async fn garbage_collect(
        &self,
        module: &Module,
        valid_kernels: &[String],
        existing: &[DaemonSet],
    ) -> Result<Vec<String>, Error> {
        let namespace = module.namespace().unwrap_or_default();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);

        let stale = stale_workloads(module, valid_kernels, existing);
        for name in &stale {
            match api.delete(name, &DeleteParams::background()).await {
                Ok(_) => info!(daemonset = %name, "deleted stale workload"),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(stale)
    }
}
