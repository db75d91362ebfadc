//! Stories about resolving node kernels
//!
//! Rules are evaluated in the order the Module declares them and the first
//! match wins. A kernel no rule matches is reported distinctly so the module
//! reconciler can skip the node instead of failing.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use kmm::crd::{
    Build, KernelMapping, LocalObjectReference, ModprobeSpec, Module, ModuleLoaderContainerSpec,
    ModuleLoaderSpec, ModuleSpec,
};
use kmm::kernel_mapper::{DefaultKernelMapper, KernelMapper, MappingError};

const RHEL: &str = "5.14.0-284.el9.x86_64";
const DEBIAN: &str = "6.1.0-13-amd64";

fn module(mappings: Vec<KernelMapping>) -> Module {
    Module {
        metadata: ObjectMeta {
            name: Some("nvidia".to_string()),
            namespace: Some("kmm-system".to_string()),
            uid: Some("uid-1".to_string()),
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
                    container_image: Some(
                        "registry.example.com/nvidia:${KERNEL_FULL_VERSION}".to_string(),
                    ),
                    kernel_mappings: mappings,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        },
        status: None,
    }
}

fn regexp(pattern: &str) -> KernelMapping {
    KernelMapping {
        regexp: Some(pattern.to_string()),
        ..Default::default()
    }
}

/// Story: a fleet with two distributions and a rule for only one
#[test]
fn story_only_the_matching_distribution_resolves() {
    let module = module(vec![regexp(r".+\.el9\..+")]);
    let mapper = DefaultKernelMapper::new();

    let elc = mapper.resolve(&module, RHEL).unwrap();
    assert_eq!(
        elc.container_image,
        format!("registry.example.com/nvidia:{RHEL}")
    );
    assert_eq!(elc.kernel_version, RHEL);

    let err = mapper.resolve(&module, DEBIAN).unwrap_err();
    assert!(err.is_not_matched());
}

/// Story: a specific rule ahead of a catch-all decides the build
#[test]
fn story_first_matching_rule_wins() {
    let build = Build {
        dockerfile_config_map: LocalObjectReference::new("rhel-dockerfile"),
        ..Default::default()
    };
    let module = module(vec![
        KernelMapping {
            literal: Some(RHEL.to_string()),
            container_image: Some("registry.example.com/nvidia-rhel:${KERNEL_XYZ}".to_string()),
            build: Some(build.clone()),
            ..Default::default()
        },
        regexp(".*"),
    ]);
    let mapper = DefaultKernelMapper::new();

    let rhel = mapper.resolve(&module, RHEL).unwrap();
    assert_eq!(rhel.container_image, "registry.example.com/nvidia-rhel:5.14.0");
    assert_eq!(rhel.build, Some(build));

    let debian = mapper.resolve(&module, DEBIAN).unwrap();
    assert!(debian.build.is_none());
}

#[test]
fn pattern_must_match_the_whole_kernel() {
    let module = module(vec![regexp("5.14")]);
    let err = DefaultKernelMapper::new()
        .resolve(&module, RHEL)
        .unwrap_err();
    assert!(err.is_not_matched());
}

#[test]
fn broken_pattern_is_an_invalid_rule() {
    let module = module(vec![regexp("(unclosed")]);
    let err = DefaultKernelMapper::new()
        .resolve(&module, RHEL)
        .unwrap_err();
    assert!(matches!(err, MappingError::InvalidRule { index: 0, .. }));
}
