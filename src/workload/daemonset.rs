//! Loader and device-plugin DaemonSet rendering
//!
//! Everything here is pure: the desired DaemonSets for a module, the lookup
//! of an existing device plugin by version, and the selection of stale
//! workloads for garbage collection.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ExecAction, HostPathVolumeSource, Lifecycle, LifecycleHandler,
    LocalObjectReference as PodSecretRef, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PodSpec, PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::{LocalObjectReference, ModprobeSpec, Module};
use crate::kernel_mapper::ModuleLoaderData;
use crate::naming::{deterministic_hash, name_prefix};
use crate::{
    device_plugin_version_label, ready_label_key, Error, KERNEL_VERSION_LABEL, MODULE_NAME_LABEL,
    NODE_LABELER_FINALIZER,
};

/// Label distinguishing loader from device-plugin workloads
pub const WORKLOAD_TYPE_LABEL: &str = "kmm.node.kubernetes.io/workload-type";

const LOADER: &str = "module-loader";
const DEVICE_PLUGIN: &str = "device-plugin";
const FIRMWARE_HOST_PATH: &str = "/var/lib/firmware";
const DEVICE_PLUGINS_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Kind of a module workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Per-kernel module loader
    Loader,
    /// Per-module device plugin
    DevicePlugin,
}

/// Classify a DaemonSet by its workload type label
pub fn workload_kind(ds: &DaemonSet) -> Option<WorkloadKind> {
    match ds.labels().get(WORKLOAD_TYPE_LABEL).map(String::as_str) {
        Some(LOADER) => Some(WorkloadKind::Loader),
        Some(DEVICE_PLUGIN) => Some(WorkloadKind::DevicePlugin),
        _ => None,
    }
}

/// Kernel version a loader DaemonSet targets
pub fn loader_kernel(ds: &DaemonSet) -> Option<&str> {
    ds.labels().get(KERNEL_VERSION_LABEL).map(String::as_str)
}

/// Locate the existing device-plugin DaemonSet for `version`
///
/// Prefers the workload whose version label equals `version`. An empty
/// `version` matches a workload without a version label. Anything else is
/// reported as not found, which makes the caller create a new workload.
pub fn find_device_plugin_workload<'a>(
    workloads: &'a [DaemonSet],
    namespace: &str,
    name: &str,
    version: &str,
) -> Option<&'a DaemonSet> {
    let version_label = device_plugin_version_label(namespace, name);
    workloads
        .iter()
        .filter(|ds| workload_kind(ds) == Some(WorkloadKind::DevicePlugin))
        .find(|ds| {
            let found = ds.labels().get(&version_label).map(String::as_str);
            found.unwrap_or_default() == version
        })
}

/// Names of workloads that are no longer desired
///
/// Loaders of kernels outside `valid_kernels` are stale. Device plugins of
/// another version are stale once the desired version exists, and all of
/// them are stale when the module no longer declares a device plugin.
pub fn stale_workloads(
    module: &Module,
    valid_kernels: &[String],
    existing: &[DaemonSet],
) -> Vec<String> {
    let name = module.name_any();
    let namespace = module.namespace().unwrap_or_default();
    let version = module.spec.version();
    let has_device_plugin = module.spec.device_plugin.is_some();
    let desired_plugin_exists =
        find_device_plugin_workload(existing, &namespace, &name, version).is_some();
    let version_label = device_plugin_version_label(&namespace, &name);

    existing
        .iter()
        .filter(|ds| match workload_kind(ds) {
            Some(WorkloadKind::Loader) => {
                !loader_kernel(ds).is_some_and(|k| valid_kernels.iter().any(|v| v == k))
            }
            Some(WorkloadKind::DevicePlugin) => {
                let ds_version = ds
                    .labels()
                    .get(&version_label)
                    .map(String::as_str)
                    .unwrap_or_default();
                !has_device_plugin || (desired_plugin_exists && ds_version != version)
            }
            None => false,
        })
        .map(|ds| ds.name_any())
        .collect()
}

/// Desired loader DaemonSet for one kernel
pub fn loader_daemon_set(elc: &ModuleLoaderData) -> Result<DaemonSet, Error> {
    let owner_ref = elc.owner.controller_owner_reference()?;
    let name = format!(
        "{}-loader-{}",
        name_prefix(&elc.name),
        deterministic_hash(&elc.kernel_version)
    );

    let labels = BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), elc.name.clone()),
        (WORKLOAD_TYPE_LABEL.to_string(), LOADER.to_string()),
        (KERNEL_VERSION_LABEL.to_string(), elc.kernel_version.clone()),
    ]);
    let pod_labels = BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), elc.name.clone()),
        (WORKLOAD_TYPE_LABEL.to_string(), LOADER.to_string()),
    ]);

    let mut node_selector = elc.selector.clone();
    node_selector.insert(KERNEL_VERSION_LABEL.to_string(), elc.kernel_version.clone());

    let modprobe = &elc.modprobe;
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    if modprobe.firmware_path.is_some() {
        volumes.push(host_path_volume("firmware", FIRMWARE_HOST_PATH));
        mounts.push(VolumeMount {
            name: "firmware".to_string(),
            mount_path: FIRMWARE_HOST_PATH.to_string(),
            ..Default::default()
        });
    }

    let container = Container {
        name: "module-loader".to_string(),
        image: Some(elc.container_image.clone()),
        image_pull_policy: elc.image_pull_policy.clone(),
        command: Some(shell(&load_command(modprobe))),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(shell(&unload_command(modprobe))),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        security_context: Some(privileged()),
        volume_mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        node_selector: Some(node_selector),
        service_account_name: elc.service_account_name.clone(),
        image_pull_secrets: pull_secrets(elc.image_repo_secret.as_ref()),
        tolerations: (!elc.tolerations.is_empty()).then(|| elc.tolerations.clone()),
        priority_class_name: Some("system-node-critical".to_string()),
        volumes: (!volumes.is_empty()).then_some(volumes),
        ..Default::default()
    };

    Ok(daemon_set(
        name,
        &elc.namespace,
        labels,
        pod_labels,
        Some(vec![NODE_LABELER_FINALIZER.to_string()]),
        pod_spec,
        owner_ref,
    ))
}

/// Desired device-plugin DaemonSet, `None` when the module declares none
pub fn device_plugin_daemon_set(module: &Module) -> Result<Option<DaemonSet>, Error> {
    let Some(plugin) = module.spec.device_plugin.as_ref() else {
        return Ok(None);
    };
    let owner_ref = module.controller_owner_reference()?;
    let name = module.name_any();
    let namespace = module.namespace().unwrap_or_default();
    let version = module.spec.version();

    let ds_name = if version.is_empty() {
        format!("{}-device-plugin", name_prefix(&name))
    } else {
        format!(
            "{}-device-plugin-{}",
            name_prefix(&name),
            &deterministic_hash(version)[..8]
        )
    };

    let mut labels = BTreeMap::from([
        (MODULE_NAME_LABEL.to_string(), name.clone()),
        (WORKLOAD_TYPE_LABEL.to_string(), DEVICE_PLUGIN.to_string()),
    ]);
    let pod_labels = labels.clone();
    if !version.is_empty() {
        labels.insert(
            device_plugin_version_label(&namespace, &name),
            version.to_string(),
        );
    }

    let ready_on_node = Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: ready_label_key(&namespace, &name),
                        operator: "Exists".to_string(),
                        values: None,
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let container = Container {
        name: "device-plugin".to_string(),
        image: Some(plugin.container.image.clone()),
        args: (!plugin.container.args.is_empty()).then(|| plugin.container.args.clone()),
        env: (!plugin.container.env.is_empty()).then(|| plugin.container.env.clone()),
        security_context: Some(privileged()),
        volume_mounts: Some(vec![VolumeMount {
            name: "kubelet-device-plugins".to_string(),
            mount_path: DEVICE_PLUGINS_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        affinity: Some(ready_on_node),
        node_selector: Some(module.spec.selector.clone()),
        service_account_name: plugin.service_account_name.clone(),
        image_pull_secrets: pull_secrets(module.spec.image_repo_secret.as_ref()),
        tolerations: (!module.spec.tolerations.is_empty()).then(|| module.spec.tolerations.clone()),
        priority_class_name: Some("system-node-critical".to_string()),
        volumes: Some(vec![host_path_volume(
            "kubelet-device-plugins",
            DEVICE_PLUGINS_PATH,
        )]),
        ..Default::default()
    };

    Ok(Some(daemon_set(
        ds_name, &namespace, labels, pod_labels, None, pod_spec, owner_ref,
    )))
}

fn daemon_set(
    name: String,
    namespace: &str,
    labels: BTreeMap<String, String>,
    pod_labels: BTreeMap<String, String>,
    pod_finalizers: Option<Vec<String>>,
    pod_spec: PodSpec,
    owner_ref: k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
) -> DaemonSet {
    let mut selector = pod_labels.clone();
    selector.insert("kmm.node.kubernetes.io/daemonset".to_string(), name.clone());
    let mut template_labels = pod_labels;
    template_labels.extend(selector.clone());

    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    finalizers: pod_finalizers,
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// modprobe invocation that loads the module and keeps the pod running
pub fn load_command(modprobe: &ModprobeSpec) -> String {
    let load = match modprobe.raw_args.as_ref() {
        Some(raw) if !raw.load.is_empty() => format!("modprobe {}", raw.load.join(" ")),
        _ => {
            let mut parts = vec!["modprobe -v".to_string(), format!("-d {}", modprobe.dir_name)];
            parts.push(modprobe.module_name.clone());
            if let Some(args) = modprobe.args.as_ref() {
                parts.extend(args.load.iter().cloned());
            }
            parts.join(" ")
        }
    };

    match modprobe.firmware_path.as_ref() {
        Some(firmware) => {
            format!("cp -r {firmware}/* {FIRMWARE_HOST_PATH}/ && {load} && sleep infinity")
        }
        None => format!("{load} && sleep infinity"),
    }
}

/// modprobe invocation that unloads the module
pub fn unload_command(modprobe: &ModprobeSpec) -> String {
    match modprobe.raw_args.as_ref() {
        Some(raw) if !raw.unload.is_empty() => format!("modprobe {}", raw.unload.join(" ")),
        _ => {
            let mut parts = vec![
                "modprobe -r -v".to_string(),
                format!("-d {}", modprobe.dir_name),
                modprobe.module_name.clone(),
            ];
            if let Some(args) = modprobe.args.as_ref() {
                parts.extend(args.unload.iter().cloned());
            }
            parts.join(" ")
        }
    }
}

fn shell(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    }
}

fn pull_secrets(secret: Option<&LocalObjectReference>) -> Option<Vec<PodSecretRef>> {
    secret.map(|s| {
        vec![PodSecretRef {
            name: s.name.clone(),
        }]
    })
}
