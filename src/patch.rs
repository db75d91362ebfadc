//! JSON merge patch construction
//!
//! Patches are computed as an RFC 7386 diff between an object's metadata
//! before and after a change. Empty label maps and finalizer lists are
//! omitted from both sides, so clearing the last entry serializes as an
//! explicit `null` for the whole field.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Compute the merge patch that turns `original` into `modified`
///
/// Keys missing from `modified` become `null`, nested objects are diffed
/// recursively and every other value (arrays included) is replaced whole.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();

            for key in orig.keys() {
                if !modi.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }

            for (key, new_value) in modi {
                match orig.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) if old_value.is_object() && new_value.is_object() => {
                        let nested = create_merge_patch(old_value, new_value);
                        if !is_empty_patch(&nested) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }

            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

/// Returns true if applying `patch` would change nothing
pub fn is_empty_patch(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}

fn labels_metadata(labels: &BTreeMap<String, String>) -> Value {
    let mut metadata = Map::new();
    if !labels.is_empty() {
        let labels = labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        metadata.insert("labels".to_string(), Value::Object(labels));
    }
    serde_json::json!({ "metadata": metadata })
}

fn finalizers_metadata(finalizers: &[String]) -> Value {
    let mut metadata = Map::new();
    if !finalizers.is_empty() {
        metadata.insert(
            "finalizers".to_string(),
            Value::Array(finalizers.iter().cloned().map(Value::String).collect()),
        );
    }
    serde_json::json!({ "metadata": metadata })
}

/// Merge patch setting (`Some`) or clearing (`None`) one label
///
/// Returns `None` when the labels already have the desired state.
pub fn label_patch(
    current: &BTreeMap<String, String>,
    key: &str,
    value: Option<&str>,
) -> Option<Value> {
    let mut desired = current.clone();
    match value {
        Some(v) => {
            desired.insert(key.to_string(), v.to_string());
        }
        None => {
            desired.remove(key);
        }
    }

    let patch = create_merge_patch(&labels_metadata(current), &labels_metadata(&desired));
    (!is_empty_patch(&patch)).then_some(patch)
}

/// Merge patch removing one finalizer
///
/// Returns `None` when the finalizer is not present.
pub fn remove_finalizer_patch(current: &[String], finalizer: &str) -> Option<Value> {
    let desired: Vec<String> = current
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();

    let patch = create_merge_patch(
        &finalizers_metadata(current),
        &finalizers_metadata(&desired),
    );
    (!is_empty_patch(&patch)).then_some(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    mod diff {
        use super::*;

        #[test]
        fn removed_keys_become_null() {
            let patch = create_merge_patch(&json!({"a": 1, "b": 2}), &json!({"a": 1}));
            assert_eq!(patch, json!({"b": null}));
        }

        #[test]
        fn nested_objects_are_diffed() {
            let patch = create_merge_patch(
                &json!({"spec": {"x": 1, "y": 2}}),
                &json!({"spec": {"x": 1, "y": 3}}),
            );
            assert_eq!(patch, json!({"spec": {"y": 3}}));
        }

        #[test]
        fn arrays_are_replaced_whole() {
            let patch = create_merge_patch(&json!({"l": [1, 2]}), &json!({"l": [2]}));
            assert_eq!(patch, json!({"l": [2]}));
        }

        #[test]
        fn identical_documents_give_an_empty_patch() {
            let doc = json!({"metadata": {"labels": {"a": "b"}}});
            assert!(is_empty_patch(&create_merge_patch(&doc, &doc)));
        }
    }

    mod labels {
        use super::*;

        /// Story: removing the only label clears the whole map with an explicit null
        #[test]
        fn story_removing_last_label_nulls_the_map() {
            let current = labels(&[("kmm.node.kubernetes.io/ns.mod.ready", "pod-a")]);
            let patch = label_patch(&current, "kmm.node.kubernetes.io/ns.mod.ready", None);
            assert_eq!(patch, Some(json!({"metadata": {"labels": null}})));
        }

        #[test]
        fn removing_one_of_many_nulls_only_that_key() {
            let current = labels(&[("a", "1"), ("b", "2")]);
            let patch = label_patch(&current, "a", None);
            assert_eq!(patch, Some(json!({"metadata": {"labels": {"a": null}}})));
        }

        #[test]
        fn setting_a_label_sends_only_that_key() {
            let current = labels(&[("kubernetes.io/hostname", "n1")]);
            let patch = label_patch(&current, "k", Some("pod"));
            assert_eq!(patch, Some(json!({"metadata": {"labels": {"k": "pod"}}})));
        }

        #[test]
        fn unchanged_labels_need_no_patch() {
            let current = labels(&[("k", "pod")]);
            assert_eq!(label_patch(&current, "k", Some("pod")), None);
            assert_eq!(label_patch(&BTreeMap::new(), "k", None), None);
        }
    }

    mod finalizers {
        use super::*;

        #[test]
        fn removing_last_finalizer_nulls_the_list() {
            let patch = remove_finalizer_patch(&["f".to_string()], "f");
            assert_eq!(patch, Some(json!({"metadata": {"finalizers": null}})));
        }

        #[test]
        fn removing_one_of_many_sends_the_rest() {
            let patch = remove_finalizer_patch(&["f".to_string(), "g".to_string()], "f");
            assert_eq!(patch, Some(json!({"metadata": {"finalizers": ["g"]}})));
        }

        #[test]
        fn absent_finalizer_needs_no_patch() {
            assert_eq!(remove_finalizer_patch(&["g".to_string()], "f"), None);
        }
    }
}
