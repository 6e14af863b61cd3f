//! Entity hierarchy with lazily computed world transforms.
//!
//! Entities live in a generational [`HandleMap`]; parents and children refer to
//! each other by [`EntityId`]. Roots and siblings are kept ordered by insertion
//! serial so traversal order never depends on removal history.

use glam::Mat4;
use hashbrown::HashMap;
use std::hash::Hash;
use crate::light::{Light, WorldLight};
use thiserror::Error;
use vse_core::{Handle, HandleMap, MaterialId, MeshId, Transform};

/// Marker for entity handles.
pub enum Entity {}

pub type EntityId = Handle<Entity>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("unknown entity {0:?}")]
    UnknownEntity(EntityId),

    #[error("parenting {entity:?} under {parent:?} would create a cycle")]
    Cycle { entity: EntityId, parent: EntityId },

    /// `None` when the entity was being created.
    #[error("transform of {0:?} is not finite")]
    NonFiniteTransform(Option<EntityId>),

    #[error("light on {0:?} has invalid parameters")]
    InvalidLight(EntityId),
}

pub type Result<T> = std::result::Result<T, SceneError>;

/// One scene entity.
#[derive(Debug, Clone)]
pub struct Node {
    local: Transform,
    parent: Option<EntityId>,
    children: Vec<EntityId>,
    mesh: Option<MeshId>,
    material: Option<MaterialId>,
    light: Option<Light>,
    serial: u64,
    world: Mat4,
    dirty: bool,
}

impl Node {
    pub const fn local(&self) -> &Transform {
        &self.local
    }

    pub const fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    /// Children in insertion order.
    pub fn children(&self) -> &[EntityId] {
        &self.children
    }

    pub const fn mesh(&self) -> Option<MeshId> {
        self.mesh
    }

    pub const fn material(&self) -> Option<MaterialId> {
        self.material
    }

    pub const fn light(&self) -> Option<&Light> {
        self.light.as_ref()
    }

    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// Cached world matrix; stale while [`Node::is_dirty`].
    pub const fn cached_world(&self) -> Mat4 {
        self.world
    }

    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Resources whose last entity reference was dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Released {
    pub meshes: Vec<MeshId>,
    pub materials: Vec<MaterialId>,
}

impl Released {
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty() && self.materials.is_empty()
    }
}

struct RefCounts<K> {
    counts: HashMap<K, u32>,
    released: Vec<K>,
}

impl<K> Default for RefCounts<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            released: Vec::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> RefCounts<K> {
    fn acquire(&mut self, key: Option<K>) {
        if let Some(key) = key {
            *self.counts.entry(key).or_insert(0) += 1;
            // Re-referenced before anyone collected the release
            self.released.retain(|k| *k != key);
        }
    }

    fn release(&mut self, key: Option<K>) {
        let Some(key) = key else {
            return;
        };
        if let Some(count) = self.counts.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&key);
                self.released.push(key);
            }
        }
    }

    fn count(&self, key: K) -> u32 {
        self.counts.get(&key).copied().unwrap_or(0)
    }
}

/// Hierarchical scene of entities.
#[derive(Default)]
pub struct SceneGraph {
    nodes: HandleMap<Node, Entity>,
    roots: Vec<EntityId>,
    next_serial: u64,
    meshes: RefCounts<MeshId>,
    materials: RefCounts<MaterialId>,
    light_count: usize,
}

impl SceneGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.nodes.contains(id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Top-level entities in insertion order.
    pub fn roots(&self) -> &[EntityId] {
        &self.roots
    }

    /// Number of entities referencing `mesh`.
    pub fn mesh_refs(&self, mesh: MeshId) -> u32 {
        self.meshes.count(mesh)
    }

    pub fn material_refs(&self, material: MaterialId) -> u32 {
        self.materials.count(material)
    }

    fn node(&self, id: EntityId) -> Result<&Node> {
        self.nodes.get(id).ok_or(SceneError::UnknownEntity(id))
    }

    fn node_mut(&mut self, id: EntityId) -> Result<&mut Node> {
        self.nodes.get_mut(id).ok_or(SceneError::UnknownEntity(id))
    }

    pub fn add_entity(
        &mut self,
        parent: Option<EntityId>,
        local: Transform,
        mesh: Option<MeshId>,
        material: Option<MaterialId>,
    ) -> Result<EntityId> {
        if !local.is_finite() {
            return Err(SceneError::NonFiniteTransform(None));
        }
        if let Some(parent) = parent {
            self.node(parent)?;
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        let id = self.nodes.insert(Node {
            local,
            parent,
            children: Vec::new(),
            mesh,
            material,
            light: None,
            serial,
            world: Mat4::IDENTITY,
            dirty: true,
        });

        // Serials only grow, so appending keeps sibling lists sorted
        match parent {
            Some(parent) => self.node_mut(parent)?.children.push(id),
            None => self.roots.push(id),
        }
        self.meshes.acquire(mesh);
        self.materials.acquire(material);
        Ok(id)
    }

    /// Remove one entity. Its children move to the root, keeping their local transforms.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<()> {
        let node = self.nodes.remove(id).ok_or(SceneError::UnknownEntity(id))?;
        self.detach(id, node.parent);

        for child in node.children {
            if let Some(child_node) = self.nodes.get_mut(child) {
                child_node.parent = None;
                let serial = child_node.serial;
                self.insert_sorted_root(child, serial);
                self.mark_dirty(child);
            }
        }

        self.meshes.release(node.mesh);
        self.materials.release(node.material);
        if node.light.is_some() {
            self.light_count -= 1;
        }
        tracing::trace!("Removed entity {id:?}");
        Ok(())
    }

    pub fn set_transform(&mut self, id: EntityId, local: Transform) -> Result<()> {
        if !local.is_finite() {
            return Err(SceneError::NonFiniteTransform(Some(id)));
        }
        self.node_mut(id)?.local = local;
        self.mark_dirty(id);
        Ok(())
    }

    /// Move `id` under `parent` (or to the root). Rejects moving an entity under itself
    /// or one of its descendants.
    pub fn set_parent(&mut self, id: EntityId, parent: Option<EntityId>) -> Result<()> {
        let old_parent = self.node(id)?.parent;
        if let Some(parent) = parent {
            self.node(parent)?;
            if self.is_ancestor_or_self(id, parent) {
                return Err(SceneError::Cycle { entity: id, parent });
            }
        }
        if old_parent == parent {
            return Ok(());
        }

        self.detach(id, old_parent);
        let node = self.node_mut(id)?;
        node.parent = parent;
        let serial = node.serial;
        match parent {
            Some(parent) => {
                let nodes = &self.nodes;
                let siblings = &self
                    .nodes
                    .get(parent)
                    .ok_or(SceneError::UnknownEntity(parent))?
                    .children;
                let at = sorted_position(nodes, siblings, serial);
                self.node_mut(parent)?.children.insert(at, id);
            }
            None => self.insert_sorted_root(id, serial),
        }
        self.mark_dirty(id);
        Ok(())
    }

    /// Swap the mesh reference. Returns the previous one.
    pub fn set_mesh(&mut self, id: EntityId, mesh: Option<MeshId>) -> Result<Option<MeshId>> {
        let node = self.node_mut(id)?;
        let previous = std::mem::replace(&mut node.mesh, mesh);
        // Acquire first so swapping an id for itself never releases it
        self.meshes.acquire(mesh);
        self.meshes.release(previous);
        Ok(previous)
    }

    pub fn set_material(
        &mut self,
        id: EntityId,
        material: Option<MaterialId>,
    ) -> Result<Option<MaterialId>> {
        let node = self.node_mut(id)?;
        let previous = std::mem::replace(&mut node.material, material);
        self.materials.acquire(material);
        self.materials.release(previous);
        Ok(previous)
    }

    /// Attach or clear the light carried by `id`. Returns the previous one.
    pub fn set_light(&mut self, id: EntityId, light: Option<Light>) -> Result<Option<Light>> {
        if light.is_some_and(|l| !l.is_valid()) {
            return Err(SceneError::InvalidLight(id));
        }
        let node = self.node_mut(id)?;
        let previous = std::mem::replace(&mut node.light, light);
        match (previous.is_some(), light.is_some()) {
            (false, true) => self.light_count += 1,
            (true, false) => self.light_count -= 1,
            _ => {}
        }
        Ok(previous)
    }

    /// Every light in world space, in traversal order.
    pub fn collect_lights(&mut self) -> Vec<WorldLight> {
        if self.light_count == 0 {
            return Vec::new();
        }
        self.update_world_transforms();
        let mut lights = Vec::with_capacity(self.light_count);
        for id in self.traverse() {
            if let Some(node) = self.nodes.get(id) {
                if let Some(light) = &node.light {
                    lights.push(light.placed(&node.world));
                }
            }
        }
        lights
    }

    /// Drain resources whose entity reference count reached zero since the last call.
    pub fn take_released(&mut self) -> Released {
        Released {
            meshes: std::mem::take(&mut self.meshes.released),
            materials: std::mem::take(&mut self.materials.released),
        }
    }

    /// World matrix of `id`, recomputing stale ancestors on the way.
    pub fn world_transform(&mut self, id: EntityId) -> Result<Mat4> {
        // Dirty flags propagate to whole subtrees, so the first clean ancestor is current
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        let mut base = Mat4::IDENTITY;
        while let Some(current) = cursor {
            let node = self.node(current)?;
            if !node.dirty {
                base = node.world;
                break;
            }
            chain.push(current);
            cursor = node.parent;
        }

        for current in chain.into_iter().rev() {
            let node = self.node_mut(current)?;
            base *= node.local.to_matrix();
            node.world = base;
            node.dirty = false;
        }
        Ok(base)
    }

    /// Recompute every stale world matrix.
    pub fn update_world_transforms(&mut self) {
        let mut stack: Vec<(EntityId, Mat4)> = self
            .roots
            .iter()
            .rev()
            .map(|&root| (root, Mat4::IDENTITY))
            .collect();

        while let Some((id, parent_world)) = stack.pop() {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if node.dirty {
                node.world = parent_world * node.local.to_matrix();
                node.dirty = false;
            }
            let world = node.world;
            stack.extend(node.children.iter().rev().map(|&child| (child, world)));
        }
    }

    /// Depth-first pre-order; roots and siblings in insertion order.
    pub fn traverse(&self) -> Vec<EntityId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<EntityId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                order.push(id);
                stack.extend(node.children.iter().rev());
            }
        }
        order
    }

    fn is_ancestor_or_self(&self, ancestor: EntityId, mut id: EntityId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.nodes.get(id).and_then(|n| n.parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    fn detach(&mut self, id: EntityId, parent: Option<EntityId>) {
        let siblings = match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(parent) => &mut parent.children,
            None => &mut self.roots,
        };
        siblings.retain(|&sibling| sibling != id);
    }

    fn insert_sorted_root(&mut self, id: EntityId, serial: u64) {
        let at = sorted_position(&self.nodes, &self.roots, serial);
        self.roots.insert(at, id);
    }

    fn mark_dirty(&mut self, id: EntityId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(current) {
                node.dirty = true;
                stack.extend_from_slice(&node.children);
            }
        }
    }
}

fn sorted_position(nodes: &HandleMap<Node, Entity>, siblings: &[EntityId], serial: u64) -> usize {
    siblings.partition_point(|&sibling| nodes.get(sibling).map_or(0, |n| n.serial) < serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::light::LightKind;
    use glam::Vec3;
    use vse_core::{Material, Mesh};

    fn at(x: f32) -> Transform {
        Transform::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    fn mesh_ids(n: usize) -> Vec<MeshId> {
        let mut map: HandleMap<(), Mesh> = HandleMap::new();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn material_id() -> MaterialId {
        let mut map: HandleMap<(), Material> = HandleMap::new();
        map.insert(())
    }

    #[test]
    fn world_transform_composes_parents() {
        let mut scene = SceneGraph::new();
        let root = scene.add_entity(None, at(1.0), None, None).unwrap();
        let child = scene.add_entity(Some(root), at(2.0), None, None).unwrap();
        let world = scene.world_transform(child).unwrap();
        assert_relative_eq!(world.w_axis.x, 3.0);
        assert!(!scene.entity(root).unwrap().is_dirty());
    }

    #[test]
    fn set_transform_dirties_subtree() {
        let mut scene = SceneGraph::new();
        let root = scene.add_entity(None, at(1.0), None, None).unwrap();
        let child = scene.add_entity(Some(root), at(1.0), None, None).unwrap();
        let grandchild = scene.add_entity(Some(child), at(1.0), None, None).unwrap();
        scene.update_world_transforms();
        assert!(!scene.entity(grandchild).unwrap().is_dirty());

        scene.set_transform(root, at(10.0)).unwrap();
        assert!(scene.entity(grandchild).unwrap().is_dirty());
        assert_relative_eq!(scene.world_transform(grandchild).unwrap().w_axis.x, 12.0);
    }

    #[test]
    fn non_finite_transforms_are_rejected_on_add_and_set() {
        let mut scene = SceneGraph::new();
        let broken = Transform::from_translation(Vec3::new(f32::NAN, 0.0, 0.0));
        assert_eq!(
            scene.add_entity(None, broken, None, None),
            Err(SceneError::NonFiniteTransform(None))
        );
        assert!(scene.is_empty());

        let root = scene.add_entity(None, at(1.0), None, None).unwrap();
        let mut infinite = at(1.0);
        infinite.scale = Vec3::splat(f32::INFINITY);
        assert_eq!(
            scene.set_transform(root, infinite),
            Err(SceneError::NonFiniteTransform(Some(root)))
        );
        assert_eq!(scene.entity(root).unwrap().local(), &at(1.0));
    }

    #[test]
    fn lights_follow_their_entities() {
        let mut scene = SceneGraph::new();
        let root = scene.add_entity(None, at(2.0), None, None).unwrap();
        let lamp = scene.add_entity(Some(root), at(1.0), None, None).unwrap();
        let sun = scene.add_entity(None, Transform::IDENTITY, None, None).unwrap();
        assert!(scene.collect_lights().is_empty());

        scene
            .set_light(lamp, Some(Light::point(Vec3::ONE, 5.0, 10.0)))
            .unwrap();
        scene
            .set_light(sun, Some(Light::directional(Vec3::ONE, 1.0)))
            .unwrap();
        let lights = scene.collect_lights();
        assert_eq!(lights.len(), 2);
        assert_relative_eq!(lights[0].position.x, 3.0);
        assert_eq!(lights[1].light.kind, LightKind::Directional);

        scene.set_transform(root, at(-1.0)).unwrap();
        assert_relative_eq!(scene.collect_lights()[0].position.x, 0.0);

        scene.remove_entity(lamp).unwrap();
        assert_eq!(scene.collect_lights().len(), 1);
        assert_eq!(
            scene.set_light(sun, None).unwrap(),
            Some(Light::directional(Vec3::ONE, 1.0))
        );
        assert!(scene.collect_lights().is_empty());
    }

    #[test]
    fn invalid_lights_are_refused() {
        let mut scene = SceneGraph::new();
        let id = scene.add_entity(None, Transform::IDENTITY, None, None).unwrap();
        let broken = Light::point(Vec3::ONE, f32::NAN, 1.0);
        assert_eq!(scene.set_light(id, Some(broken)), Err(SceneError::InvalidLight(id)));
        assert_eq!(scene.entity(id).unwrap().light(), None);
    }

    #[test]
    fn removing_parent_reparents_children_to_root() {
        let mut scene = SceneGraph::new();
        let a = scene.add_entity(None, at(0.0), None, None).unwrap();
        let parent = scene.add_entity(None, at(5.0), None, None).unwrap();
        let b = scene.add_entity(None, at(0.0), None, None).unwrap();
        let child = scene.add_entity(Some(parent), at(1.0), None, None).unwrap();

        scene.remove_entity(parent).unwrap();
        assert!(!scene.contains(parent));
        assert!(scene.contains(child));
        assert_eq!(scene.entity(child).unwrap().parent(), None);
        // Re-inserted by serial, after b
        assert_eq!(scene.roots(), &[a, b, child]);
        assert_relative_eq!(scene.world_transform(child).unwrap().w_axis.x, 1.0);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut scene = SceneGraph::new();
        let a = scene.add_entity(None, Transform::IDENTITY, None, None).unwrap();
        let b = scene.add_entity(Some(a), Transform::IDENTITY, None, None).unwrap();
        let c = scene.add_entity(Some(b), Transform::IDENTITY, None, None).unwrap();

        assert_eq!(
            scene.set_parent(a, Some(c)),
            Err(SceneError::Cycle { entity: a, parent: c })
        );
        assert!(matches!(scene.set_parent(a, Some(a)), Err(SceneError::Cycle { .. })));

        scene.set_parent(c, None).unwrap();
        assert_eq!(scene.roots(), &[a, c]);
        scene.set_parent(a, Some(c)).unwrap();
        assert_eq!(scene.traverse(), vec![c, a, b]);
    }

    #[test]
    fn traversal_is_preorder_by_serial() {
        let mut scene = SceneGraph::new();
        let r1 = scene.add_entity(None, Transform::IDENTITY, None, None).unwrap();
        let r2 = scene.add_entity(None, Transform::IDENTITY, None, None).unwrap();
        let c1 = scene.add_entity(Some(r1), Transform::IDENTITY, None, None).unwrap();
        let c2 = scene.add_entity(Some(r2), Transform::IDENTITY, None, None).unwrap();
        let c3 = scene.add_entity(Some(r1), Transform::IDENTITY, None, None).unwrap();

        assert_eq!(scene.traverse(), vec![r1, c1, c3, r2, c2]);
        scene.set_parent(c2, Some(r1)).unwrap();
        assert_eq!(scene.traverse(), vec![r1, c1, c2, c3, r2]);
    }

    #[test]
    fn releases_resources_at_zero_references() {
        let mut scene = SceneGraph::new();
        let meshes = mesh_ids(2);
        let material = material_id();
        let a = scene
            .add_entity(None, Transform::IDENTITY, Some(meshes[0]), Some(material))
            .unwrap();
        let b = scene
            .add_entity(None, Transform::IDENTITY, Some(meshes[0]), Some(material))
            .unwrap();
        assert_eq!(scene.mesh_refs(meshes[0]), 2);

        scene.remove_entity(a).unwrap();
        assert!(scene.take_released().is_empty());

        scene.set_mesh(b, Some(meshes[1])).unwrap();
        let released = scene.take_released();
        assert_eq!(released.meshes, vec![meshes[0]]);
        assert!(released.materials.is_empty());

        scene.remove_entity(b).unwrap();
        let released = scene.take_released();
        assert_eq!(released.meshes, vec![meshes[1]]);
        assert_eq!(released.materials, vec![material]);
    }

    #[test]
    fn rereference_cancels_pending_release() {
        let mut scene = SceneGraph::new();
        let mesh = mesh_ids(1)[0];
        let a = scene.add_entity(None, Transform::IDENTITY, Some(mesh), None).unwrap();
        scene.set_mesh(a, None).unwrap();
        scene.set_mesh(a, Some(mesh)).unwrap();
        assert!(scene.take_released().is_empty());
    }

    #[test]
    fn stale_ids_are_unknown() {
        let mut scene = SceneGraph::new();
        let a = scene.add_entity(None, Transform::IDENTITY, None, None).unwrap();
        scene.remove_entity(a).unwrap();
        assert_eq!(scene.remove_entity(a), Err(SceneError::UnknownEntity(a)));
        assert!(scene.add_entity(Some(a), Transform::IDENTITY, None, None).is_err());
    }
}
