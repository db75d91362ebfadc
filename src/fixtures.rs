//! Shared test fixtures

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{
    Build, LocalObjectReference, ModprobeSpec, Module, ModuleLoaderContainerSpec,
    ModuleLoaderSpec, ModuleSpec, Sign,
};
use crate::kernel_mapper::ModuleLoaderData;

pub(crate) const NAMESPACE: &str = "kmm-system";
pub(crate) const MODULE: &str = "nvidia";

/// A persisted Module selecting GPU nodes
pub(crate) fn sample_module() -> Module {
    Module {
        metadata: ObjectMeta {
            name: Some(MODULE.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some("module-uid".to_string()),
            resource_version: Some("7".to_string()),
            ..Default::default()
        },
        spec: ModuleSpec {
            selector: BTreeMap::from([("gpu".to_string(), "true".to_string())]),
            module_loader: ModuleLoaderSpec {
                container: ModuleLoaderContainerSpec {
                    modprobe: ModprobeSpec {
                        module_name: "nvidia".to_string(),
                        dir_name: "/opt".to_string(),
                        ..Default::default()
                    },
                    container_image: Some("quay.io/acme/nvidia:${KERNEL_FULL_VERSION}".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
        status: None,
    }
}

/// Effective loader configuration without build or sign
pub(crate) fn sample_elc(kernel: &str) -> ModuleLoaderData {
    let owner = sample_module();
    ModuleLoaderData {
        name: MODULE.to_string(),
        namespace: NAMESPACE.to_string(),
        kernel_version: kernel.to_string(),
        container_image: format!("quay.io/acme/nvidia:{kernel}"),
        build: None,
        sign: None,
        modprobe: owner.spec.module_loader.container.modprobe.clone(),
        version: String::new(),
        image_pull_policy: None,
        image_repo_secret: None,
        selector: owner.spec.selector.clone(),
        service_account_name: None,
        tolerations: Vec::new(),
        owner,
    }
}

pub(crate) fn sample_build() -> Build {
    Build {
        dockerfile_config_map: LocalObjectReference::new("nvidia-dockerfile"),
        ..Default::default()
    }
}

pub(crate) fn sample_sign() -> Sign {
    Sign {
        key_secret: LocalObjectReference::new("signing-key"),
        cert_secret: LocalObjectReference::new("signing-cert"),
        files_to_sign: vec!["/opt/lib/modules/nvidia.ko".to_string()],
        ..Default::default()
    }
}
