//! Module status computation

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::client::KubeClient;
use crate::crd::{DaemonSetStatus, Module, ModuleStatus};
use crate::workload::{workload_kind, WorkloadKind};
use crate::{ready_label_key, Error};

/// Writes a Module's observed state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    /// Recompute and persist `module`'s status
    ///
    /// `mapped_nodes` are the selected nodes whose kernel resolved to a
    /// loader configuration; `selected_nodes` are all schedulable nodes
    /// matching the module selector.
    async fn update(
        &self,
        module: &Module,
        mapped_nodes: &[Node],
        selected_nodes: &[Node],
        workloads: &[DaemonSet],
    ) -> Result<(), Error>;
}

/// Status updater backed by [`KubeClient`]
pub struct KubeStatusUpdater {
    kube: Arc<dyn KubeClient>,
}

impl KubeStatusUpdater {
    /// Create a status updater writing through `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl StatusUpdater for KubeStatusUpdater {
    async fn update(
        &self,
        module: &Module,
        mapped_nodes: &[Node],
        selected_nodes: &[Node],
        workloads: &[DaemonSet],
    ) -> Result<(), Error> {
        let status = compute_status(module, mapped_nodes, selected_nodes, workloads);
        if module.status.as_ref() == Some(&status) {
            debug!("module status unchanged");
            return Ok(());
        }

        let mut updated = module.clone();
        updated.status = Some(status);
        self.kube.replace_module_status(&updated).await
    }
}

/// Derive a Module's status from the observed nodes and workloads
pub fn compute_status(
    module: &Module,
    mapped_nodes: &[Node],
    selected_nodes: &[Node],
    workloads: &[DaemonSet],
) -> ModuleStatus {
    let mut status = ModuleStatus {
        module_loader: DaemonSetStatus {
            nodes_matching_selector_number: count(selected_nodes.len()),
            desired_number: count(mapped_nodes.len()),
            available_number: 0,
        },
        device_plugin: DaemonSetStatus::default(),
    };

    for ds in workloads {
        let available = ds
            .status
            .as_ref()
            .and_then(|s| s.number_available)
            .unwrap_or_default();
        match workload_kind(ds) {
            Some(WorkloadKind::Loader) => status.module_loader.available_number += available,
            Some(WorkloadKind::DevicePlugin) => {
                let desired = ds
                    .status
                    .as_ref()
                    .map(|s| s.desired_number_scheduled)
                    .unwrap_or_default();
                status.device_plugin.desired_number += desired;
                status.device_plugin.available_number += available;
            }
            None => {}
        }
    }

    if module.spec.device_plugin.is_some() {
        let ready_label = ready_label_key(
            &module.namespace().unwrap_or_default(),
            &module.name_any(),
        );
        let ready = selected_nodes
            .iter()
            .filter(|node| node.labels().contains_key(&ready_label))
            .count();
        status.device_plugin.nodes_matching_selector_number = count(ready);
    }

    status
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
