//! glTF 2.0 parsing and validation.
//!
//! Parsing is all-or-nothing: any malformed primitive rejects the asset.
//! Unknown extensions and non-triangle primitives are skipped with a warning.

use crate::description::{
    AlphaMode, ImageSource, MaterialDesc, MeshDesc, NodeDesc, PrimitiveDesc, SceneDescription,
    TextureDesc, Vertex,
};
use crate::error::{AssetError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use glam::{Quat, Vec3};
use gltf::buffer::Data as BufferData;
use gltf::khr_lights_punctual::Kind;
use gltf::mesh::Mode;
use gltf::Semantic;
use std::path::Path;
use vse_core::{Aabb, Transform};
use vse_gpu::{AddressMode, Filter, SamplerDesc};
use vse_scene::Light;

/// Extensions read by the loader.
const SUPPORTED_EXTENSIONS: [&str; 1] = ["KHR_lights_punctual"];

/// Extensions that replace the core geometry encoding; the asset cannot be read without them.
const GEOMETRY_COMPRESSION: [&str; 2] = ["KHR_draco_mesh_compression", "EXT_meshopt_compression"];

/// Parse a `.gltf` or `.glb` file. External resources resolve relative to its directory.
pub fn load_scene(path: impl AsRef<Path>) -> Result<SceneDescription> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| AssetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let started = std::time::Instant::now();
    let scene = load_scene_from_slice(&bytes, path.parent())?;
    tracing::debug!(
        "Parsed {} in {:.1} ms: {} nodes, {} primitives, {} materials, {} textures",
        path.display(),
        started.elapsed().as_secs_f64() * 1000.0,
        scene.nodes.len(),
        scene.primitive_count(),
        scene.materials.len(),
        scene.textures.len()
    );
    Ok(scene)
}

/// Parse glTF or GLB bytes. Without `base_dir`, external file references are an error.
pub fn load_scene_from_slice(bytes: &[u8], base_dir: Option<&Path>) -> Result<SceneDescription> {
    let gltf::Gltf { document, blob } = gltf::Gltf::from_slice_without_validation(bytes)?;

    let mut warnings = Vec::new();
    let mut json = document.into_json();
    check_extensions(&mut json, &mut warnings)?;
    let document = gltf::Document::from_json(json)?;
    let buffers = gltf::import_buffers(&document, base_dir, blob)?;

    let meshes = document
        .meshes()
        .map(|mesh| read_mesh(&mesh, &buffers, &mut warnings))
        .collect::<Result<Vec<_>>>()?;
    let materials: Vec<MaterialDesc> = document
        .materials()
        .map(|material| read_material(&material, &mut warnings))
        .collect();
    let textures = read_textures(&document, &materials, &buffers, base_dir)?;
    let (nodes, roots) = read_nodes(&document, &mut warnings)?;

    for warning in &warnings {
        tracing::warn!("{warning}");
    }

    Ok(SceneDescription {
        nodes,
        roots,
        meshes,
        materials,
        textures,
        warnings,
    })
}

fn check_extensions(json: &mut gltf::json::Root, warnings: &mut Vec<String>) -> Result<()> {
    for name in json.extensions_used.iter().chain(&json.extensions_required) {
        if GEOMETRY_COMPRESSION.contains(&name.as_str()) {
            return Err(AssetError::UnsupportedFeature(format!(
                "{name} compressed geometry"
            )));
        }
    }
    let supported = |name: &String| SUPPORTED_EXTENSIONS.contains(&name.as_str());
    for name in json.extensions_used.iter().filter(|n| !supported(n)) {
        warnings.push(format!("extension {name} is not supported and was ignored"));
    }
    for name in json.extensions_required.iter().filter(|n| !supported(n)) {
        if !json.extensions_used.contains(name) {
            warnings.push(format!("extension {name} is not supported and was ignored"));
        }
    }
    // Everything left is optional data the core format renders without
    json.extensions_required.clear();
    Ok(())
}

fn check_accessor(accessor: &gltf::Accessor<'_>, buffers: &[BufferData]) -> std::result::Result<(), String> {
    if accessor.sparse().is_some() {
        return Err(format!("accessor {} is sparse", accessor.index()));
    }
    let Some(view) = accessor.view() else {
        return Err(format!("accessor {} has no buffer view", accessor.index()));
    };
    let buffer_len = buffers.get(view.buffer().index()).map_or(0, |b| b.len());
    if view.offset().saturating_add(view.length()) > buffer_len {
        return Err(format!(
            "buffer view {} exceeds buffer {}",
            view.index(),
            view.buffer().index()
        ));
    }
    if accessor.count() == 0 {
        return Ok(());
    }
    let element = accessor.size();
    let stride = view.stride().unwrap_or(element);
    let end = (accessor.count() - 1)
        .saturating_mul(stride)
        .saturating_add(accessor.offset())
        .saturating_add(element);
    if end > view.length() {
        return Err(format!(
            "accessor {} reads past the end of buffer view {}",
            accessor.index(),
            view.index()
        ));
    }
    Ok(())
}

fn read_mesh(
    mesh: &gltf::Mesh<'_>,
    buffers: &[BufferData],
    warnings: &mut Vec<String>,
) -> Result<MeshDesc> {
    let mut primitives = Vec::new();
    for primitive in mesh.primitives() {
        match primitive.mode() {
            Mode::Triangles | Mode::TriangleStrip | Mode::TriangleFan => {}
            mode => {
                warnings.push(format!(
                    "mesh {} primitive {}: {mode:?} primitives are skipped",
                    mesh.index(),
                    primitive.index()
                ));
                continue;
            }
        }
        primitives.push(read_primitive(mesh.index(), &primitive, buffers, warnings)?);
    }
    Ok(MeshDesc {
        name: mesh.name().map(String::from),
        primitives,
    })
}

fn read_primitive(
    mesh_index: usize,
    primitive: &gltf::Primitive<'_>,
    buffers: &[BufferData],
    warnings: &mut Vec<String>,
) -> Result<PrimitiveDesc> {
    let prim_index = primitive.index();
    let malformed = |reason: String| AssetError::malformed(mesh_index, prim_index, reason);

    let position_accessor = primitive
        .get(&Semantic::Positions)
        .ok_or_else(|| malformed("missing POSITION attribute".to_string()))?;
    let vertex_count = position_accessor.count();

    for (semantic, accessor) in primitive.attributes() {
        check_accessor(&accessor, buffers).map_err(malformed)?;
        if accessor.count() != vertex_count {
            return Err(malformed(format!(
                "{semantic:?} has {} elements but POSITION has {vertex_count}",
                accessor.count()
            )));
        }
    }
    if let Some(indices) = primitive.indices() {
        check_accessor(&indices, buffers).map_err(malformed)?;
    }
    if primitive.get(&Semantic::TexCoords(1)).is_some() {
        warnings.push(format!(
            "mesh {mesh_index} primitive {prim_index}: only TEXCOORD_0 is used"
        ));
    }

    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));
    let positions: Vec<[f32; 3]> = reader
        .read_positions()
        .ok_or_else(|| malformed("unreadable POSITION data".to_string()))?
        .collect();
    let normals: Option<Vec<[f32; 3]>> = reader.read_normals().map(Iterator::collect);
    let uvs: Option<Vec<[f32; 2]>> = reader.read_tex_coords(0).map(|t| t.into_f32().collect());

    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => {
            let count = u32::try_from(vertex_count)
                .map_err(|_| malformed(format!("{vertex_count} vertices exceed the u32 index range")))?;
            (0..count).collect()
        }
    };
    let indices = triangulate(primitive.mode(), indices);
    if indices.len() % 3 != 0 {
        return Err(malformed(format!(
            "{} indices do not form whole triangles",
            indices.len()
        )));
    }
    if let Some(&bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(malformed(format!(
            "index {bad} out of range for {vertex_count} vertices"
        )));
    }

    let mut vertices: Vec<Vertex> = positions
        .iter()
        .enumerate()
        .map(|(i, &position)| Vertex {
            position,
            normal: normals.as_ref().map_or([0.0; 3], |n| n[i]),
            uv: uvs.as_ref().map_or([0.0; 2], |t| t[i]),
        })
        .collect();
    if let Some(i) = vertices.iter().position(|v| !v.is_finite()) {
        return Err(malformed(format!("vertex {i} is not finite")));
    }
    if normals.is_none() {
        generate_normals(&mut vertices, &indices);
    }

    let bounds = Aabb::from_points(positions.iter().map(|&p| Vec3::from(p)))
        .ok_or_else(|| malformed("primitive has no vertices".to_string()))?;

    Ok(PrimitiveDesc {
        vertices,
        indices,
        bounds,
        material: primitive.material().index(),
    })
}

/// Expand strips and fans into a triangle list.
fn triangulate(mode: Mode, indices: Vec<u32>) -> Vec<u32> {
    let triangles = indices.len().saturating_sub(2);
    match mode {
        Mode::TriangleStrip => (0..triangles)
            .flat_map(|i| {
                let (a, b) = if i % 2 == 0 { (i, i + 1) } else { (i + 1, i) };
                [indices[a], indices[b], indices[i + 2]]
            })
            .collect(),
        Mode::TriangleFan => (0..triangles)
            .flat_map(|i| [indices[0], indices[i + 1], indices[i + 2]])
            .collect(),
        _ => indices,
    }
}

/// Area-weighted vertex normals for primitives that ship without them.
fn generate_normals(vertices: &mut [Vertex], indices: &[u32]) {
    let mut accumulated = vec![Vec3::ZERO; vertices.len()];
    for triangle in indices.chunks_exact(3) {
        let [a, b, c] = [triangle[0], triangle[1], triangle[2]].map(|i| i as usize);
        let p = |i: usize| Vec3::from(vertices[i].position);
        let normal = (p(b) - p(a)).cross(p(c) - p(a));
        for i in [a, b, c] {
            accumulated[i] += normal;
        }
    }
    for (vertex, normal) in vertices.iter_mut().zip(accumulated) {
        vertex.normal = normal.try_normalize().unwrap_or(Vec3::Y).to_array();
    }
}

fn read_material(material: &gltf::Material<'_>, warnings: &mut Vec<String>) -> MaterialDesc {
    let pbr = material.pbr_metallic_roughness();
    let base_color_texture = pbr.base_color_texture().map(|info| {
        if info.tex_coord() != 0 {
            warnings.push(format!(
                "material {:?}: base colour uses TEXCOORD_{}, reading TEXCOORD_0",
                material.index(),
                info.tex_coord()
            ));
        }
        info.texture().index()
    });

    MaterialDesc {
        name: material.name().map(String::from),
        base_color: pbr.base_color_factor(),
        metallic: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        emissive: material.emissive_factor(),
        alpha_mode: match material.alpha_mode() {
            gltf::material::AlphaMode::Opaque => AlphaMode::Opaque,
            gltf::material::AlphaMode::Mask => AlphaMode::Mask,
            gltf::material::AlphaMode::Blend => AlphaMode::Blend,
        },
        alpha_cutoff: material.alpha_cutoff().unwrap_or(0.5),
        double_sided: material.double_sided(),
        base_color_texture,
    }
}

fn read_textures(
    document: &gltf::Document,
    materials: &[MaterialDesc],
    buffers: &[BufferData],
    base_dir: Option<&Path>,
) -> Result<Vec<TextureDesc>> {
    document
        .textures()
        .map(|texture| {
            let index = texture.index();
            let source = image_source(&texture.source(), buffers, base_dir)
                .map_err(|reason| AssetError::Texture { texture: index, reason })?;
            Ok(TextureDesc {
                name: texture.name().map(String::from),
                source,
                sampler: sampler_desc(&texture.sampler()),
                srgb: materials
                    .iter()
                    .any(|m| m.base_color_texture == Some(index)),
            })
        })
        .collect()
}

fn image_source(
    image: &gltf::Image<'_>,
    buffers: &[BufferData],
    base_dir: Option<&Path>,
) -> std::result::Result<ImageSource, String> {
    match image.source() {
        gltf::image::Source::View { view, mime_type } => {
            let buffer = buffers
                .get(view.buffer().index())
                .ok_or_else(|| format!("buffer {} is missing", view.buffer().index()))?;
            let bytes = buffer
                .get(view.offset()..view.offset() + view.length())
                .ok_or_else(|| format!("buffer view {} exceeds its buffer", view.index()))?;
            Ok(ImageSource::Encoded {
                bytes: bytes.into(),
                mime_type: Some(mime_type.to_string()),
            })
        }
        gltf::image::Source::Uri { uri, mime_type } => {
            let bytes = if uri.starts_with("data:") {
                parse_data_uri(uri)?
            } else {
                let base = base_dir.ok_or_else(|| format!("external image {uri} without a base directory"))?;
                let path = base.join(uri);
                std::fs::read(&path).map_err(|e| format!("{}: {e}", path.display()))?
            };
            Ok(ImageSource::Encoded {
                bytes: bytes.into(),
                mime_type: mime_type.map(String::from),
            })
        }
    }
}

fn sampler_desc(sampler: &gltf::texture::Sampler<'_>) -> SamplerDesc {
    use gltf::texture::{MagFilter, MinFilter, WrappingMode};

    let wrap = |mode: WrappingMode| match mode {
        WrappingMode::ClampToEdge => AddressMode::ClampToEdge,
        WrappingMode::MirroredRepeat => AddressMode::MirroredRepeat,
        WrappingMode::Repeat => AddressMode::Repeat,
    };
    // Without mipmaps the mip part of the minification filter is dropped
    let min_filter = match sampler.min_filter() {
        Some(MinFilter::Nearest | MinFilter::NearestMipmapNearest | MinFilter::NearestMipmapLinear) => {
            Filter::Nearest
        }
        _ => Filter::Linear,
    };
    SamplerDesc {
        mag_filter: match sampler.mag_filter() {
            Some(MagFilter::Nearest) => Filter::Nearest,
            _ => Filter::Linear,
        },
        min_filter,
        address_u: wrap(sampler.wrap_s()),
        address_v: wrap(sampler.wrap_t()),
    }
}

fn read_light(light: &gltf::khr_lights_punctual::Light<'_>) -> Light {
    let color = Vec3::from(light.color());
    let intensity = light.intensity();
    let range = light.range().unwrap_or(0.0);
    match light.kind() {
        Kind::Directional => Light::directional(color, intensity),
        Kind::Point => Light::point(color, intensity, range),
        Kind::Spot {
            inner_cone_angle,
            outer_cone_angle,
        } => Light::spot(color, intensity, range, inner_cone_angle, outer_cone_angle),
    }
}

fn read_nodes(
    document: &gltf::Document,
    warnings: &mut Vec<String>,
) -> Result<(Vec<NodeDesc>, Vec<usize>)> {
    let mut parents = vec![None; document.nodes().len()];
    let mut nodes = Vec::with_capacity(parents.len());

    for node in document.nodes() {
        let (translation, rotation, scale) = node.transform().decomposed();
        let local = Transform {
            translation: Vec3::from(translation),
            rotation: Quat::from_array(rotation),
            scale: Vec3::from(scale),
        };
        if !local.is_finite() {
            return Err(AssetError::Parse(format!(
                "node {} has a non-finite transform",
                node.index()
            )));
        }

        let children: Vec<usize> = node.children().map(|c| c.index()).collect();
        for &child in &children {
            if parents[child].replace(node.index()).is_some() || child == node.index() {
                return Err(AssetError::Parse(format!(
                    "node {child} has more than one parent"
                )));
            }
        }
        let light = node.light().map(|l| read_light(&l)).filter(|light| {
            let valid = light.is_valid();
            if !valid {
                warnings.push(format!("node {} has an invalid light; dropped", node.index()));
            }
            valid
        });
        nodes.push(NodeDesc {
            name: node.name().map(String::from),
            local,
            mesh: node.mesh().map(|m| m.index()),
            light,
            children,
        });
    }

    let roots: Vec<usize> = match document.default_scene().or_else(|| document.scenes().next()) {
        Some(scene) => scene.nodes().map(|n| n.index()).collect(),
        None => (0..nodes.len()).filter(|&i| parents[i].is_none()).collect(),
    };
    // With one parent per node, parentless roots rule out cycles below them
    if let Some(&root) = roots.iter().find(|&&r| parents[r].is_some()) {
        return Err(AssetError::Parse(format!(
            "scene root {root} is also a child node"
        )));
    }
    Ok((nodes, roots))
}

/// Decode a base64 `data:` URI.
fn parse_data_uri(uri: &str) -> std::result::Result<Vec<u8>, String> {
    let (_, encoded) = uri
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .ok_or_else(|| "data URI is not base64".to_string())?;
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("malformed data URI: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_requires_base64() {
        assert_eq!(
            parse_data_uri("data:application/octet-stream;base64,AQID").unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(parse_data_uri("data:image/png;base64,YQ==").unwrap(), b"a");
        assert!(parse_data_uri("data:text/plain,hello").is_err());
        assert!(parse_data_uri("file.bin").is_err());
    }

    #[test]
    fn truncated_or_overpadded_data_uris_are_rejected() {
        for encoded in ["A===", "A", "AQI", "A*==", "YQ="] {
            let uri = format!("data:application/octet-stream;base64,{encoded}");
            assert!(parse_data_uri(&uri).is_err(), "{encoded} decoded");
        }
    }

    #[test]
    fn strips_and_fans_become_lists() {
        assert_eq!(
            triangulate(Mode::TriangleStrip, vec![0, 1, 2, 3]),
            vec![0, 1, 2, 2, 1, 3]
        );
        assert_eq!(
            triangulate(Mode::TriangleFan, vec![0, 1, 2, 3]),
            vec![0, 1, 2, 0, 2, 3]
        );
        assert_eq!(triangulate(Mode::Triangles, vec![0, 1, 2]), vec![0, 1, 2]);
    }

    #[test]
    fn generated_normals_face_the_winding() {
        let mut vertices = vec![
            Vertex {
                position: [0.0, 0.0, 0.0],
                ..Default::default()
            },
            Vertex {
                position: [1.0, 0.0, 0.0],
                ..Default::default()
            },
            Vertex {
                position: [0.0, 1.0, 0.0],
                ..Default::default()
            },
        ];
        generate_normals(&mut vertices, &[0, 1, 2]);
        assert!(vertices.iter().all(|v| v.normal == [0.0, 0.0, 1.0]));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            load_scene_from_slice(b"not a gltf", None),
            Err(AssetError::Parse(_))
        ));
    }
}
