//! Culled, sorted draw lists built from the scene graph.

use crate::graph::{EntityId, SceneGraph};
use glam::Mat4;
use vse_core::{Aabb, Frustum, MaterialId, MeshId};

/// What a mesh/material pair needs to be drawn.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedDraw {
    /// Material actually used; the default when the entity has none.
    pub material: MaterialId,
    /// Sort key of the material's pipeline.
    pub pipeline: u64,
    /// Sort key of the material's descriptor set.
    pub descriptor: u64,
    /// Object-space bounds of the mesh.
    pub bounds: Aabb,
}

/// Maps scene references onto resident GPU state.
pub trait DrawResolver {
    /// `None` when the mesh is not resident.
    fn resolve(&self, mesh: MeshId, material: Option<MaterialId>) -> Option<ResolvedDraw>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawItem {
    pub entity: EntityId,
    pub mesh: MeshId,
    pub material: MaterialId,
    pub model: Mat4,
    pub pipeline: u64,
    pub descriptor: u64,
    /// Position in traversal order.
    pub order: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewStats {
    pub visited: u32,
    pub culled: u32,
    pub unresolved: u32,
}

/// Draws of one frame in submission order.
#[derive(Clone, Debug, Default)]
pub struct SceneView {
    draws: Vec<DrawItem>,
    stats: ViewStats,
}

impl SceneView {
    /// Update world transforms, cull against `frustum` and sort by
    /// (pipeline, descriptor set, traversal order).
    pub fn build(
        graph: &mut SceneGraph,
        frustum: Option<&Frustum>,
        resolver: &impl DrawResolver,
    ) -> Self {
        graph.update_world_transforms();

        let mut stats = ViewStats::default();
        let mut draws = Vec::new();
        for (order, id) in (0u32..).zip(graph.traverse()) {
            let Some(node) = graph.entity(id) else {
                continue;
            };
            let Some(mesh) = node.mesh() else {
                continue;
            };
            stats.visited += 1;

            let Some(resolved) = resolver.resolve(mesh, node.material()) else {
                stats.unresolved += 1;
                continue;
            };
            let model = node.cached_world();
            if let Some(frustum) = frustum {
                if !frustum.test_aabb(&resolved.bounds.transformed(&model)) {
                    stats.culled += 1;
                    continue;
                }
            }

            draws.push(DrawItem {
                entity: id,
                mesh,
                material: resolved.material,
                model,
                pipeline: resolved.pipeline,
                descriptor: resolved.descriptor,
                order,
            });
        }

        draws.sort_by_key(|d| (d.pipeline, d.descriptor, d.order));
        tracing::trace!(
            "Scene view: {} draws ({} culled, {} unresolved)",
            draws.len(),
            stats.culled,
            stats.unresolved
        );
        Self { draws, stats }
    }

    pub fn draws(&self) -> &[DrawItem] {
        &self.draws
    }

    pub const fn stats(&self) -> ViewStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }
}
