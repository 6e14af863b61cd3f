//! Loading from disk, on the background loader and with cancellation.

use std::path::PathBuf;

use glam::Vec3;
use vse_asset::{AssetError, AssetLoader, CancelToken, LoaderConfig};
use vse_scene::LightKind;
use vse_test::{GltfBuilder, Harness, LightSpec, MaterialSpec, NodeSpec, PrimitiveSpec, TestError};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("vse-test-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn two_quads() -> GltfBuilder {
    let mut b = GltfBuilder::new();
    let texture = b.solid_texture(2, 2, [10, 20, 30, 255]).unwrap();
    let material = b.material(&MaterialSpec {
        name: Some("tile".to_string()),
        texture: Some(texture),
        ..Default::default()
    });
    let mesh = b.mesh(&[PrimitiveSpec::quad().with_material(material)]);
    b.node(&NodeSpec::mesh(mesh).at([-0.6, 0.0, 0.0]));
    b.node(&NodeSpec::mesh(mesh).at([0.6, 0.0, 0.0]));
    b
}

#[test]
fn gltf_with_external_buffer_loads_from_disk() {
    let dir = scratch_dir("external");
    let path = two_quads().write_gltf(&dir, "quads").unwrap();

    let scene = vse_asset::load_scene(&path).unwrap();
    assert_eq!(scene.roots.len(), 2);

    let mut h = Harness::new().unwrap();
    let attached = h.publish(&scene, &CancelToken::new()).unwrap();
    assert_eq!(attached.entities.len(), 2);
    let material = h.registry.material(attached.materials[0]).unwrap();
    assert_eq!(material.name.as_deref(), Some("tile"));
    assert_eq!(h.present().unwrap().draws, 2);

    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn background_loader_parses_glb() {
    let dir = scratch_dir("background");
    let path = dir.join("quads.glb");
    two_quads().write_glb(&path).unwrap();

    let loader = AssetLoader::new(LoaderConfig::default().with_worker_threads(2));
    let handle = loader.load_async(&path);
    let token = handle.token().clone();
    let scene = handle.wait().unwrap();

    let mut h = Harness::new().unwrap();
    let attached = h.publish(&scene, &token).unwrap();
    assert_eq!(attached.roots.len(), 2);
    assert!(attached.bounds.is_some());

    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn background_loader_reports_missing_files() {
    let loader = AssetLoader::new(LoaderConfig::default());
    let handle = loader.load_async(std::env::temp_dir().join("vse-test-missing.glb"));
    assert!(matches!(handle.wait(), Err(AssetError::Io { .. })));
}

#[test]
fn cancelled_upload_leaves_no_trace() {
    let bytes = two_quads().to_glb().unwrap();
    let scene = vse_asset::load_scene_from_slice(&bytes, None).unwrap();

    let mut h = Harness::new().unwrap();
    h.present().unwrap();
    let before = h.residency();

    let token = CancelToken::new();
    token.cancel();
    let error = h.publish(&scene, &token).unwrap_err();
    assert!(matches!(error, TestError::Asset(AssetError::Cancelled)), "{error}");
    assert!(h.graph.is_empty());
    assert_eq!(h.residency(), before);
}

#[test]
fn the_same_file_can_be_loaded_twice() {
    let bytes = two_quads().to_glb().unwrap();
    let mut h = Harness::new().unwrap();
    let first = h.load(&bytes).unwrap();
    let second = h.load(&bytes).unwrap();

    assert_ne!(first.meshes[0][0], second.meshes[0][0]);
    assert_eq!(h.graph.roots().len(), 4);
    assert_eq!(h.present().unwrap().draws, 4);
}

#[test]
fn punctual_lights_are_loaded_onto_entities() {
    let mut b = two_quads();
    let sun = b.light(&LightSpec::Directional {
        color: [1.0, 0.9, 0.8],
        intensity: 3.0,
    });
    let bulb = b.light(&LightSpec::Point {
        color: [1.0, 1.0, 1.0],
        intensity: 20.0,
        range: Some(6.0),
    });
    let spot = b.light(&LightSpec::Spot {
        color: [0.0, 0.0, 1.0],
        intensity: 5.0,
        inner: 0.2,
        outer: 0.4,
    });
    // Pitched down by 90 degrees about x
    let half = std::f32::consts::FRAC_1_SQRT_2;
    b.node(&NodeSpec::light(sun).rotated([-half, 0.0, 0.0, half]));
    b.node(&NodeSpec::light(bulb).at([0.0, 2.0, 0.0]));
    b.node(&NodeSpec::light(spot));
    let bytes = b.to_glb().unwrap();

    let scene = vse_asset::load_scene_from_slice(&bytes, None).unwrap();
    assert!(
        scene.warnings.iter().all(|w| !w.contains("KHR_lights_punctual")),
        "{:?}",
        scene.warnings
    );

    let mut h = Harness::new().unwrap();
    h.publish(&scene, &CancelToken::new()).unwrap();
    let lights = h.graph.collect_lights();
    assert_eq!(lights.len(), 3);

    assert_eq!(lights[0].light.kind, LightKind::Directional);
    assert!((lights[0].direction - Vec3::NEG_Y).length() < 1e-5);
    assert_eq!(lights[1].light.kind, LightKind::Point { range: 6.0 });
    assert!((lights[1].position - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-6);
    assert!(matches!(
        lights[2].light.kind,
        LightKind::Spot { inner_angle, outer_angle, .. } if inner_angle == 0.2 && outer_angle == 0.4
    ));
    assert_eq!(h.present().unwrap().draws, 2);
}
