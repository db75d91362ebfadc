//! Stories about the patches the node labeler sends
//!
//! The labeler owns exactly one key per module on each node. Clearing it must
//! send an explicit null so the API server removes the key.

use std::collections::BTreeMap;

use serde_json::json;

use kmm::patch::{label_patch, remove_finalizer_patch};
use kmm::{ready_label_key, NODE_LABELER_FINALIZER};

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Story: a loader pod turns Ready on a fresh node
#[test]
fn story_ready_pod_labels_unlabeled_node() {
    let key = ready_label_key("kmm-system", "nvidia");
    let patch = label_patch(&BTreeMap::new(), &key, Some("nvidia-loader-x1")).unwrap();

    assert_eq!(
        patch,
        json!({"metadata": {"labels": {"kmm.node.kubernetes.io/kmm-system.nvidia.ready": "nvidia-loader-x1"}}})
    );
}

/// Story: the only label on a node goes away when the pod is not ready
#[test]
fn story_not_ready_pod_clears_last_label_with_null() {
    let key = ready_label_key("kmm-system", "nvidia");
    let current = labels(&[(key.as_str(), "nvidia-loader-x1")]);

    let patch = label_patch(&current, &key, None).unwrap();
    assert_eq!(patch, json!({"metadata": {"labels": null}}));
}

/// Story: other labels on the node survive an unlabel
#[test]
fn story_unlabel_only_nulls_the_owned_key() {
    let key = ready_label_key("kmm-system", "nvidia");
    let current = labels(&[
        (key.as_str(), "nvidia-loader-x1"),
        ("kubernetes.io/hostname", "worker-0"),
    ]);

    let patch = label_patch(&current, &key, None).unwrap();
    assert_eq!(
        patch,
        json!({"metadata": {"labels": {"kmm.node.kubernetes.io/kmm-system.nvidia.ready": null}}})
    );
}

#[test]
fn unlabel_of_unlabeled_node_sends_nothing() {
    let key = ready_label_key("kmm-system", "nvidia");
    assert!(label_patch(&labels(&[("zone", "a")]), &key, None).is_none());
}

/// Story: a terminating pod releases its only finalizer
#[test]
fn story_terminating_pod_drops_finalizer_list() {
    let finalizers = vec![NODE_LABELER_FINALIZER.to_string()];
    let patch = remove_finalizer_patch(&finalizers, NODE_LABELER_FINALIZER).unwrap();

    assert_eq!(patch, json!({"metadata": {"finalizers": null}}));
}

#[test]
fn finalizer_patch_keeps_foreign_finalizers() {
    let finalizers = vec![
        "example.com/keep".to_string(),
        NODE_LABELER_FINALIZER.to_string(),
    ];
    let patch = remove_finalizer_patch(&finalizers, NODE_LABELER_FINALIZER).unwrap();

    assert_eq!(
        patch,
        json!({"metadata": {"finalizers": ["example.com/keep"]}})
    );
}
