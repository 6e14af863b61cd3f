//! Broken input is rejected whole and leaves nothing behind.

use vse_asset::{AssetError, LoaderConfig};
use vse_test::{GltfBuilder, Harness, HarnessConfig, MaterialSpec, NodeSpec, PrimitiveSpec, TestError};

fn textured(texture_bytes: &[u8]) -> Vec<u8> {
    let mut b = GltfBuilder::new();
    let texture = b.encoded_texture(texture_bytes, "image/png");
    let material = b.material(&MaterialSpec {
        texture: Some(texture),
        ..Default::default()
    });
    let mesh = b.mesh(&[PrimitiveSpec::quad().with_material(material)]);
    b.node(&NodeSpec::mesh(mesh));
    b.to_glb().unwrap()
}

#[test]
fn out_of_range_index_is_malformed_geometry() {
    let mut b = GltfBuilder::new();
    let good = b.mesh(&[PrimitiveSpec::quad()]);
    let bad = b.mesh(&[
        PrimitiveSpec::triangle(),
        PrimitiveSpec::triangle().with_indices(vec![0, 1, 7]),
    ]);
    b.node(&NodeSpec::mesh(good));
    b.node(&NodeSpec::mesh(bad));

    let mut h = Harness::new().unwrap();
    let before = h.residency();
    let error = h.load(&b.to_glb().unwrap()).unwrap_err();
    assert!(
        matches!(
            error,
            TestError::Asset(AssetError::MalformedGeometry {
                mesh: 1,
                primitive: 1,
                ..
            })
        ),
        "{error}"
    );
    assert!(h.graph.is_empty());
    assert_eq!(h.residency(), before);
}

#[test]
fn partial_triangles_are_malformed_geometry() {
    let mut b = GltfBuilder::new();
    let mesh = b.mesh(&[PrimitiveSpec::quad().with_indices(vec![0, 1, 2, 3])]);
    b.node(&NodeSpec::mesh(mesh));

    let mut h = Harness::new().unwrap();
    let error = h.load(&b.to_glb().unwrap()).unwrap_err();
    assert!(matches!(
        error,
        TestError::Asset(AssetError::MalformedGeometry { mesh: 0, .. })
    ));
}

#[test]
fn undecodable_texture_fails_the_whole_load() {
    let mut h = Harness::new().unwrap();
    let before = h.residency();
    let error = h.load(&textured(b"nope")).unwrap_err();
    assert!(
        matches!(error, TestError::Asset(AssetError::Texture { texture: 0, .. })),
        "{error}"
    );
    // Geometry staged alongside the texture is rolled back too
    assert!(h.graph.is_empty());
    assert_eq!(h.residency(), before);
    assert!(h.device.violations().is_empty());
}

#[test]
fn undecodable_texture_can_fall_back_to_the_default() {
    let config = HarnessConfig::default()
        .with_loader(LoaderConfig::default().with_default_texture_fallback(true));
    let mut h = Harness::with_config(config).unwrap();
    let attached = h.load(&textured(b"nope")).unwrap();

    let material = h.registry.material(attached.materials[0]).unwrap();
    assert_eq!(material.base_color_texture, h.registry.default_texture());
    assert_eq!(h.present().unwrap().draws, 1);
}

#[test]
fn compressed_geometry_is_unsupported() {
    let mut b = GltfBuilder::new();
    let mesh = b.mesh(&[PrimitiveSpec::triangle()]);
    b.node(&NodeSpec::mesh(mesh));
    let b = b.require_extension("KHR_draco_mesh_compression");

    let mut h = Harness::new().unwrap();
    let error = h.load(&b.to_glb().unwrap()).unwrap_err();
    assert!(
        matches!(error, TestError::Asset(AssetError::UnsupportedFeature(ref name)) if name.contains("draco")),
        "{error}"
    );
}

#[test]
fn truncated_glb_is_a_parse_error() {
    let mut b = GltfBuilder::new();
    let mesh = b.mesh(&[PrimitiveSpec::triangle()]);
    b.node(&NodeSpec::mesh(mesh));
    let bytes = b.to_glb().unwrap();

    let mut h = Harness::new().unwrap();
    let error = h.load(&bytes[..bytes.len() / 2]).unwrap_err();
    assert!(matches!(error, TestError::Asset(AssetError::Parse(_))), "{error}");
}

#[test]
fn missing_file_names_the_path() {
    let path = std::env::temp_dir().join("vse-test-does-not-exist.glb");
    match vse_asset::load_scene(&path) {
        Err(AssetError::Io { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected an IO error, got {other:?}"),
    }
}
