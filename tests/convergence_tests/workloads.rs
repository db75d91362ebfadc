//! Stories about locating and retiring module workloads

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rstest::rstest;

use kmm::crd::{DevicePluginSpec, Module, ModuleSpec};
use kmm::workload::{find_device_plugin_workload, stale_workloads, WORKLOAD_TYPE_LABEL};
use kmm::{device_plugin_version_label, KERNEL_VERSION_LABEL};

const NS: &str = "kmm-system";
const NAME: &str = "nvidia";

fn device_plugin(name: &str, version: Option<&str>) -> DaemonSet {
    let mut labels = BTreeMap::from([(WORKLOAD_TYPE_LABEL.to_string(), "device-plugin".to_string())]);
    if let Some(version) = version {
        labels.insert(device_plugin_version_label(NS, NAME), version.to_string());
    }
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn loader(name: &str, kernel: &str) -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            labels: Some(BTreeMap::from([
                (WORKLOAD_TYPE_LABEL.to_string(), "module-loader".to_string()),
                (KERNEL_VERSION_LABEL.to_string(), kernel.to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[rstest]
#[case::empty_list(vec![], "v2", None)]
#[case::version_matches(vec![device_plugin("dp-v2", Some("v2"))], "v2", Some("dp-v2"))]
#[case::version_mismatch(vec![device_plugin("dp-v1", Some("v1"))], "v2", None)]
#[case::unversioned_for_empty_version(vec![device_plugin("dp", None)], "", Some("dp"))]
#[case::unversioned_for_set_version(vec![device_plugin("dp", None)], "v2", None)]
fn device_plugin_lookup(
    #[case] workloads: Vec<DaemonSet>,
    #[case] version: &str,
    #[case] expected: Option<&str>,
) {
    let found = find_device_plugin_workload(&workloads, NS, NAME, version);
    assert_eq!(
        found.and_then(|ds| ds.metadata.name.as_deref()),
        expected
    );
}

#[test]
fn loaders_are_never_mistaken_for_device_plugins() {
    let workloads = vec![loader("nvidia-loader", "5.14.0")];
    assert!(find_device_plugin_workload(&workloads, NS, NAME, "").is_none());
}

/// Story: a kernel upgrade rolls through the fleet
///
/// Once no node runs 5.14 any more its loader is retired while the loader
/// for the new kernel and the device plugin stay.
#[test]
fn story_loader_of_departed_kernel_is_stale() {
    let module = Module {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(NS.to_string()),
            ..Default::default()
        },
        spec: ModuleSpec {
            device_plugin: Some(DevicePluginSpec::default()),
            ..Default::default()
        },
        status: None,
    };
    let existing = vec![
        loader("nvidia-loader-old", "5.14.0"),
        loader("nvidia-loader-new", "5.14.1"),
        device_plugin("nvidia-device-plugin", None),
    ];

    let stale = stale_workloads(&module, &["5.14.1".to_string()], &existing);
    assert_eq!(stale, vec!["nvidia-loader-old".to_string()]);
}
