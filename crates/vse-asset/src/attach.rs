//! Publishing an uploaded batch into the scene.

use crate::error::Result;
use crate::registry::ResourceRegistry;
use crate::upload::UploadedScene;
use vse_core::{Aabb, MaterialId, MeshId, TextureId, Transform};
use vse_scene::{EntityId, SceneGraph};

/// Everything one `attach` call created.
#[derive(Debug, Clone, Default)]
pub struct AttachedScene {
    pub roots: Vec<EntityId>,
    /// All created entities in creation order.
    pub entities: Vec<EntityId>,
    /// Per glTF mesh, one id per primitive.
    pub meshes: Vec<Vec<MeshId>>,
    pub materials: Vec<MaterialId>,
    pub textures: Vec<TextureId>,
    /// World-space bounds of every drawn primitive.
    pub bounds: Option<Aabb>,
}

/// Register every resource of `scene` and create its entities.
///
/// A node's first primitive is drawn by the node's entity; further primitives
/// become identity-transform children so each entity draws one mesh.
pub fn attach(
    graph: &mut SceneGraph,
    registry: &mut ResourceRegistry,
    scene: UploadedScene,
) -> Result<AttachedScene> {
    let order = scene.node_order();
    let UploadedScene {
        meshes,
        textures,
        materials,
        nodes,
        warnings,
        ..
    } = scene;

    let referenced: Vec<bool> = (0..textures.len())
        .map(|t| materials.iter().any(|m| m.desc.base_color_texture == Some(t)))
        .collect();
    let mut texture_ids = Vec::with_capacity(textures.len());
    for (texture, used) in textures.into_iter().zip(referenced) {
        let id = match texture {
            Some(texture) if used => registry.insert_texture(
                texture.name,
                texture.image,
                texture.memory,
                texture.sampler,
                texture.extent,
            ),
            Some(texture) => {
                registry.discard_texture(texture);
                registry.default_texture()
            }
            None => registry.default_texture(),
        };
        texture_ids.push(id);
    }

    let material_ids: Vec<MaterialId> = materials
        .into_iter()
        .map(|material| {
            let texture = material
                .desc
                .base_color_texture
                .and_then(|t| texture_ids.get(t).copied());
            registry.insert_material(material.desc, material.uniform, texture)
        })
        .collect();

    let mut mesh_ids = Vec::with_capacity(meshes.len());
    let mut primitive_materials = Vec::with_capacity(meshes.len());
    for primitives in meshes {
        let mut ids = Vec::with_capacity(primitives.len());
        let mut mats = Vec::with_capacity(primitives.len());
        for primitive in primitives {
            mats.push(primitive.material.and_then(|m| material_ids.get(m).copied()));
            ids.push(registry.insert_mesh(
                primitive.vertices,
                primitive.indices,
                primitive.vertex_count,
                primitive.index_count,
                primitive.bounds,
            ));
        }
        mesh_ids.push(ids);
        primitive_materials.push(mats);
    }

    let mut attached = AttachedScene {
        meshes: mesh_ids,
        materials: material_ids,
        textures: texture_ids,
        ..Default::default()
    };
    let mut parents = vec![None; nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        for &child in &node.children {
            if let Some(slot) = parents.get_mut(child) {
                *slot = Some(index);
            }
        }
    }
    let mut entity_of: Vec<Option<EntityId>> = vec![None; nodes.len()];
    let mut drawn = Vec::new();
    for index in order {
        let node = &nodes[index];
        let parent = parents[index].and_then(|p| entity_of[p]);
        let primitives = node
            .mesh
            .and_then(|m| attached.meshes.get(m).zip(primitive_materials.get(m)));
        let mut draws: Vec<(MeshId, Option<MaterialId>)> = primitives
            .map(|(ids, mats)| ids.iter().copied().zip(mats.iter().copied()).collect())
            .unwrap_or_default();
        let rest = draws.split_off(draws.len().min(1));
        let first = draws.first().copied();

        let entity = graph.add_entity(
            parent,
            node.local,
            first.map(|(mesh, _)| mesh),
            first.and_then(|(_, material)| material),
        )?;
        entity_of[index] = Some(entity);
        attached.entities.push(entity);
        if node.light.is_some() {
            graph.set_light(entity, node.light)?;
        }
        if parent.is_none() {
            attached.roots.push(entity);
        }
        if let Some((mesh, _)) = first {
            drawn.push((entity, mesh));
        }
        for (mesh, material) in rest {
            let child = graph.add_entity(Some(entity), Transform::IDENTITY, Some(mesh), material)?;
            attached.entities.push(child);
            drawn.push((child, mesh));
        }
    }

    for (entity, mesh) in drawn {
        let world = graph.world_transform(entity)?;
        if let Some(gpu) = registry.mesh(mesh) {
            let bounds = gpu.bounds.transformed(&world);
            attached.bounds = Some(attached.bounds.map_or(bounds, |b| b.merge(&bounds)));
        }
    }

    tracing::debug!(
        "Attached {} entities, {} meshes, {} materials ({} warnings)",
        attached.entities.len(),
        attached.meshes.iter().map(Vec::len).sum::<usize>(),
        attached.materials.len(),
        warnings.len()
    );
    Ok(attached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{
        ImageSource, MaterialDesc, MeshDesc, NodeDesc, PrimitiveDesc, SceneDescription,
        TextureDesc, Vertex,
    };
    use crate::loader::{CancelToken, LoaderConfig};
    use crate::upload::Uploader;
    use glam::Vec3;
    use std::sync::Arc;
    use vse_gpu::headless::HeadlessDevice;
    use vse_scene::Light;
    use vse_gpu::{Allocator, AllocatorConfig, SamplerCache, SamplerDesc};

    fn primitive(offset: f32, material: Option<usize>) -> PrimitiveDesc {
        let vertices: Vec<Vertex> = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]
            .into_iter()
            .map(|p: [f32; 3]| Vertex {
                position: [p[0] + offset, p[1], p[2]],
                normal: [0.0, 0.0, 1.0],
                uv: [0.0, 0.0],
            })
            .collect();
        PrimitiveDesc {
            bounds: Aabb::from_points(vertices.iter().map(|v| Vec3::from(v.position))).unwrap(),
            vertices,
            indices: vec![0, 1, 2],
            material,
        }
    }

    fn node(mesh: Option<usize>, children: Vec<usize>, x: f32) -> NodeDesc {
        NodeDesc {
            name: None,
            local: Transform::from_translation(Vec3::X * x),
            mesh,
            light: None,
            children,
        }
    }

    fn texture() -> TextureDesc {
        TextureDesc {
            name: None,
            source: ImageSource::Rgba8 {
                width: 1,
                height: 1,
                pixels: vec![0, 0, 0, 255].into(),
            },
            sampler: SamplerDesc::default(),
            srgb: true,
        }
    }

    struct Fixture {
        device: Arc<HeadlessDevice>,
        uploader: Uploader,
        registry: ResourceRegistry,
        graph: SceneGraph,
    }

    fn fixture() -> Fixture {
        let device = HeadlessDevice::new_default();
        let allocator = Arc::new(Allocator::new(device.clone(), AllocatorConfig::default()));
        let samplers = Arc::new(SamplerCache::new(device.clone()));
        let uploader = Uploader::new(
            device.clone(),
            allocator.clone(),
            samplers.clone(),
            &LoaderConfig::default(),
        )
        .unwrap();
        let registry = ResourceRegistry::new(device.clone(), allocator, samplers).unwrap();
        Fixture {
            device,
            uploader,
            registry,
            graph: SceneGraph::new(),
        }
    }

    fn description() -> SceneDescription {
        SceneDescription {
            // 0 -> [1, 2]; node 1 draws a two-primitive mesh
            nodes: vec![
                node(None, vec![1, 2], 10.0),
                node(Some(0), Vec::new(), 1.0),
                node(Some(1), Vec::new(), 2.0),
            ],
            roots: vec![0],
            meshes: vec![
                MeshDesc {
                    name: None,
                    primitives: vec![primitive(0.0, Some(0)), primitive(5.0, Some(1))],
                },
                MeshDesc {
                    name: None,
                    primitives: vec![primitive(0.0, None)],
                },
            ],
            materials: vec![
                MaterialDesc {
                    base_color_texture: Some(0),
                    ..Default::default()
                },
                MaterialDesc::default(),
            ],
            // Texture 1 is referenced by nothing
            textures: vec![texture(), texture()],
            warnings: Vec::new(),
        }
    }

    #[test]
    fn entities_follow_node_order_with_extra_primitives_as_children() {
        let mut f = fixture();
        let uploaded = f.uploader.upload(&description(), &CancelToken::new()).unwrap();
        let attached = attach(&mut f.graph, &mut f.registry, uploaded).unwrap();

        assert_eq!(attached.roots.len(), 1);
        // Three nodes plus one child for the second primitive
        assert_eq!(attached.entities.len(), 4);
        assert_eq!(f.graph.len(), 4);

        let root = f.graph.entity(attached.roots[0]).unwrap();
        assert_eq!(root.children().len(), 2);
        let first = f.graph.entity(root.children()[0]).unwrap();
        assert_eq!(first.mesh(), Some(attached.meshes[0][0]));
        assert_eq!(first.material(), Some(attached.materials[0]));
        let extra = f.graph.entity(first.children()[0]).unwrap();
        assert_eq!(extra.mesh(), Some(attached.meshes[0][1]));
        assert_eq!(*extra.local(), Transform::IDENTITY);

        let second = f.graph.entity(root.children()[1]).unwrap();
        assert_eq!(second.material(), None);
    }

    #[test]
    fn textures_are_counted_and_unused_ones_dropped() {
        let mut f = fixture();
        let uploaded = f.uploader.upload(&description(), &CancelToken::new()).unwrap();
        let attached = attach(&mut f.graph, &mut f.registry, uploaded).unwrap();

        let textured = f.registry.material(attached.materials[0]).unwrap();
        assert_eq!(textured.base_color_texture, attached.textures[0]);
        assert_eq!(f.registry.texture_refs(attached.textures[0]), 1);
        assert_eq!(attached.textures[1], f.registry.default_texture());
        // Default white plus the one referenced texture
        assert_eq!(f.device.live_images(), 2);
    }

    #[test]
    fn bounds_cover_world_space_geometry() {
        let mut f = fixture();
        let uploaded = f.uploader.upload(&description(), &CancelToken::new()).unwrap();
        let attached = attach(&mut f.graph, &mut f.registry, uploaded).unwrap();
        let bounds = attached.bounds.unwrap();
        // Node 1 sits at x = 11; its second primitive spans x in [16, 17]
        assert!((bounds.min.x - 11.0).abs() < 1e-5);
        assert!((bounds.max.x - 17.0).abs() < 1e-5);
    }

    #[test]
    fn node_lights_are_attached_to_their_entities() {
        let mut f = fixture();
        let mut desc = description();
        desc.nodes[2].light = Some(Light::point(Vec3::new(1.0, 0.5, 0.2), 4.0, 8.0));
        let uploaded = f.uploader.upload(&desc, &CancelToken::new()).unwrap();
        attach(&mut f.graph, &mut f.registry, uploaded).unwrap();

        let lights = f.graph.collect_lights();
        assert_eq!(lights.len(), 1);
        approx::assert_relative_eq!(lights[0].position.x, 12.0);
        assert_eq!(lights[0].light.intensity, 4.0);
    }
}
