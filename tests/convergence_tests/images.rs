//! Stories about image naming and the image record

use kmm::controller::assign_generations;
use kmm::crd::{Build, LocalObjectReference, ModuleImageSpec};
use kmm::pipeline::unsigned_image_name;

fn image(reference: &str, generation: i64) -> ModuleImageSpec {
    ModuleImageSpec {
        image: reference.to_string(),
        generation,
        ..Default::default()
    }
}

/// Story: build and sign meet at a tag derived from the final image
#[test]
fn story_unsigned_tag_replaces_final_tag() {
    assert_eq!(
        unsigned_image_name("quay.io/acme/nvidia:5.14.0", "kmm-system", "nvidia"),
        "quay.io/acme/nvidia:kmm-system_nvidia_kmm_unsigned"
    );
}

#[test]
fn unsigned_tag_keeps_registry_port() {
    assert_eq!(
        unsigned_image_name("registry:5000/nvidia@sha256:abc", "ns", "m"),
        "registry:5000/nvidia:ns_m_kmm_unsigned"
    );
}

/// Story: only the entry whose pipeline changed gets a new generation
#[test]
fn story_generation_moves_with_the_pipeline() {
    let previous = vec![image("a:1", 2), image("b:1", 7)];
    let desired = vec![
        image("a:1", 0),
        ModuleImageSpec {
            build: Some(Build {
                dockerfile_config_map: LocalObjectReference::new("dockerfile"),
                ..Default::default()
            }),
            ..image("b:1", 0)
        },
        image("c:1", 0),
    ];

    let out = assign_generations(&previous, desired);
    let generations: Vec<_> = out.iter().map(|e| (e.image.as_str(), e.generation)).collect();
    assert_eq!(generations, vec![("a:1", 2), ("b:1", 8), ("c:1", 1)]);
}

#[test]
fn identical_desired_list_keeps_every_generation() {
    let previous = vec![image("a:1", 3), image("b:1", 1)];
    let desired = vec![image("a:1", 0), image("b:1", 0)];
    assert_eq!(assign_generations(&previous, desired), previous);
}
