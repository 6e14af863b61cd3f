//! Resident GPU resources addressed by generational handles.

use crate::description::{AlphaMode, MaterialDesc};
use crate::error::Result;
use crate::upload::{self, MaterialUniform, UploadedTexture};
use hashbrown::HashMap;
use std::sync::Arc;
use vse_core::{Aabb, HandleMap, Material, MaterialId, Mesh, MeshId, Texture, TextureId};
use vse_gpu::{
    Allocation, Allocator, BufferSlice, Command, CommandList, Extent2D, Format, GpuDevice,
    ImageDesc, ImageId, RetirementQueue, SamplerCache, SamplerDesc, SamplerId,
};
use vse_scene::Released;

#[derive(Debug)]
pub struct GpuMesh {
    vertices: Allocation,
    indices: Allocation,
    pub vertex_count: u32,
    pub index_count: u32,
    pub bounds: Aabb,
}

impl GpuMesh {
    pub const fn vertex_buffer(&self) -> BufferSlice {
        self.vertices.slice()
    }

    pub const fn index_buffer(&self) -> BufferSlice {
        self.indices.slice()
    }
}

#[derive(Debug)]
pub struct GpuTexture {
    pub name: Option<String>,
    pub image: ImageId,
    memory: Allocation,
    pub sampler: SamplerId,
    pub extent: Extent2D,
}

#[derive(Debug)]
pub struct GpuMaterial {
    pub name: Option<String>,
    uniform: Allocation,
    pub params: MaterialUniform,
    /// The default texture when the material has none.
    pub base_color_texture: TextureId,
    pub alpha_mode: AlphaMode,
    pub double_sided: bool,
}

impl GpuMaterial {
    pub const fn uniform(&self) -> BufferSlice {
        self.uniform.slice()
    }
}

#[derive(Debug)]
enum RetiredResource {
    Mesh(GpuMesh),
    Material(GpuMaterial),
    Texture(GpuTexture),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub meshes: usize,
    pub materials: usize,
    pub textures: usize,
    /// Resources waiting for their last frame to complete.
    pub retiring: usize,
}

/// Owns every mesh, material and texture the renderer can draw.
///
/// Materials hold counted references to their textures. Meshes and materials
/// are counted by the scene graph, which reports unused ones through
/// [`Released`]; the registry defers their destruction until the GPU is done.
pub struct ResourceRegistry {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<Allocator>,
    samplers: Arc<SamplerCache>,
    meshes: HandleMap<GpuMesh, Mesh>,
    materials: HandleMap<GpuMaterial, Material>,
    textures: HandleMap<GpuTexture, Texture>,
    texture_refs: HashMap<TextureId, u32>,
    default_texture: TextureId,
    default_material: MaterialId,
    retired: RetirementQueue<RetiredResource>,
}

impl ResourceRegistry {
    /// Create the registry with its 1x1 white texture and default material.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        allocator: Arc<Allocator>,
        samplers: Arc<SamplerCache>,
    ) -> Result<Self> {
        let white = create_white_texture(device.as_ref(), &allocator, &samplers)?;
        let default_desc = MaterialDesc {
            name: Some("default".to_string()),
            ..Default::default()
        };
        let uniform = match upload::material_uniform(device.as_ref(), &allocator, &default_desc) {
            Ok(uniform) => uniform,
            Err(error) => {
                device.destroy_image(white.image);
                allocator.free(white.memory);
                return Err(error);
            }
        };

        let mut textures = HandleMap::new();
        let default_texture = textures.insert(white);
        let mut materials = HandleMap::new();
        let default_material = materials.insert(GpuMaterial {
            params: MaterialUniform::from(&default_desc),
            name: default_desc.name,
            uniform,
            base_color_texture: default_texture,
            alpha_mode: default_desc.alpha_mode,
            double_sided: default_desc.double_sided,
        });

        tracing::debug!("Resource registry ready with default texture and material");
        Ok(Self {
            device,
            allocator,
            samplers,
            meshes: HandleMap::new(),
            materials,
            textures,
            texture_refs: HashMap::new(),
            default_texture,
            default_material,
            retired: RetirementQueue::new(),
        })
    }

    pub const fn default_texture(&self) -> TextureId {
        self.default_texture
    }

    pub const fn default_material(&self) -> MaterialId {
        self.default_material
    }

    pub fn mesh(&self, id: MeshId) -> Option<&GpuMesh> {
        self.meshes.get(id)
    }

    pub fn material(&self, id: MaterialId) -> Option<&GpuMaterial> {
        self.materials.get(id)
    }

    pub fn texture(&self, id: TextureId) -> Option<&GpuTexture> {
        self.textures.get(id)
    }

    /// Number of live materials referencing `texture`.
    pub fn texture_refs(&self, texture: TextureId) -> u32 {
        self.texture_refs.get(&texture).copied().unwrap_or(0)
    }

    pub fn meshes(&self) -> impl Iterator<Item = (MeshId, &GpuMesh)> {
        self.meshes.iter()
    }

    pub fn materials(&self) -> impl Iterator<Item = (MaterialId, &GpuMaterial)> {
        self.materials.iter()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            meshes: self.meshes.len(),
            materials: self.materials.len(),
            textures: self.textures.len(),
            retiring: self.retired.pending_count(),
        }
    }

    pub fn insert_mesh(
        &mut self,
        vertices: Allocation,
        indices: Allocation,
        vertex_count: u32,
        index_count: u32,
        bounds: Aabb,
    ) -> MeshId {
        self.meshes.insert(GpuMesh {
            vertices,
            indices,
            vertex_count,
            index_count,
            bounds,
        })
    }

    pub fn insert_texture(
        &mut self,
        name: Option<String>,
        image: ImageId,
        memory: Allocation,
        sampler: SamplerId,
        extent: Extent2D,
    ) -> TextureId {
        self.textures.insert(GpuTexture {
            name,
            image,
            memory,
            sampler,
            extent,
        })
    }

    /// Register a material whose uniform block is already written.
    ///
    /// A `base_color_texture` that is not resident falls back to the default texture.
    pub fn insert_material(
        &mut self,
        desc: MaterialDesc,
        uniform: Allocation,
        base_color_texture: Option<TextureId>,
    ) -> MaterialId {
        let texture = base_color_texture
            .filter(|&t| self.textures.contains(t))
            .unwrap_or(self.default_texture);
        if texture != self.default_texture {
            *self.texture_refs.entry(texture).or_insert(0) += 1;
        }
        self.materials.insert(GpuMaterial {
            params: MaterialUniform::from(&desc),
            name: desc.name,
            uniform,
            base_color_texture: texture,
            alpha_mode: desc.alpha_mode,
            double_sided: desc.double_sided,
        })
    }

    /// Create and register a material from its description.
    pub fn create_material(
        &mut self,
        desc: MaterialDesc,
        base_color_texture: Option<TextureId>,
    ) -> Result<MaterialId> {
        let uniform = upload::material_uniform(self.device.as_ref(), &self.allocator, &desc)?;
        Ok(self.insert_material(desc, uniform, base_color_texture))
    }

    /// Retire resources the scene no longer references once `generation` completes.
    ///
    /// Textures whose last material goes are retired with it. Default resources
    /// are kept.
    pub fn release(&mut self, released: &Released, generation: u64) {
        for &mesh in &released.meshes {
            if let Some(mesh) = self.meshes.remove(mesh) {
                self.retired.retire(RetiredResource::Mesh(mesh), generation);
            }
        }
        for &id in &released.materials {
            if id == self.default_material {
                continue;
            }
            let Some(material) = self.materials.remove(id) else {
                continue;
            };
            let texture = material.base_color_texture;
            self.retired.retire(RetiredResource::Material(material), generation);
            self.release_texture(texture, generation);
        }
    }

    /// Destroy retired resources whose generation has completed.
    pub fn collect(&mut self, completed_generation: u64) -> usize {
        let ready = self.retired.drain_completed(completed_generation);
        let count = ready.len();
        for resource in ready {
            self.destroy(resource);
        }
        if count > 0 {
            tracing::trace!("Destroyed {count} retired resources at generation {completed_generation}");
        }
        count
    }

    /// Destroy everything, including default resources. The device must be idle.
    pub fn destroy_all(&mut self) {
        for resource in self.retired.flush() {
            self.destroy(resource);
        }
        let meshes: Vec<_> = self.meshes.iter().map(|(id, _)| id).collect();
        for id in meshes {
            if let Some(mesh) = self.meshes.remove(id) {
                self.destroy(RetiredResource::Mesh(mesh));
            }
        }
        let materials: Vec<_> = self.materials.iter().map(|(id, _)| id).collect();
        for id in materials {
            if let Some(material) = self.materials.remove(id) {
                self.destroy(RetiredResource::Material(material));
            }
        }
        let textures: Vec<_> = self.textures.iter().map(|(id, _)| id).collect();
        for id in textures {
            if let Some(texture) = self.textures.remove(id) {
                self.destroy(RetiredResource::Texture(texture));
            }
        }
        self.texture_refs.clear();
    }

    /// Destroy a texture that was uploaded but never registered. Its upload must have completed.
    pub(crate) fn discard_texture(&self, texture: UploadedTexture) {
        self.device.destroy_image(texture.image);
        self.allocator.free(texture.memory);
    }

    pub fn samplers(&self) -> &Arc<SamplerCache> {
        &self.samplers
    }

    fn release_texture(&mut self, texture: TextureId, generation: u64) {
        if texture == self.default_texture {
            return;
        }
        let Some(count) = self.texture_refs.get_mut(&texture) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.texture_refs.remove(&texture);
        if let Some(texture) = self.textures.remove(texture) {
            self.retired.retire(RetiredResource::Texture(texture), generation);
        }
    }

    fn destroy(&self, resource: RetiredResource) {
        match resource {
            RetiredResource::Mesh(mesh) => {
                self.allocator.free(mesh.vertices);
                self.allocator.free(mesh.indices);
            }
            RetiredResource::Material(material) => self.allocator.free(material.uniform),
            RetiredResource::Texture(texture) => {
                self.device.destroy_image(texture.image);
                self.allocator.free(texture.memory);
            }
        }
    }
}

fn create_white_texture(
    device: &dyn GpuDevice,
    allocator: &Allocator,
    samplers: &SamplerCache,
) -> Result<GpuTexture> {
    let extent = Extent2D::new(1, 1);
    let (image, memory) = upload::create_texture_image(
        device,
        allocator,
        &ImageDesc::texture(extent, Format::Rgba8Unorm),
    )?;

    let filled = (|| -> Result<SamplerId> {
        let sampler = samplers.get_or_create(&SamplerDesc::default())?;
        let tag = allocator.begin_transient();
        let staged = upload::stage(allocator, device, &[255; 4], tag);
        let submitted = staged.and_then(|staged| {
            let copy: CommandList = [Command::CopyBufferToImage {
                src: staged.slice(),
                image,
                extent,
            }]
            .into_iter()
            .collect();
            let result = upload::submit_and_wait(device, &copy);
            allocator.free(staged);
            result.map_err(Into::into)
        });
        allocator.retire_transient(tag);
        submitted.map(|()| sampler)
    })();

    match filled {
        Ok(sampler) => Ok(GpuTexture {
            name: Some("default white".to_string()),
            image,
            memory,
            sampler,
            extent,
        }),
        Err(error) => {
            device.destroy_image(image);
            allocator.free(memory);
            Err(error)
        }
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vse_gpu::headless::HeadlessDevice;
    use vse_gpu::{AllocatorConfig, UsageClass};

    fn registry() -> (Arc<HeadlessDevice>, Arc<Allocator>, ResourceRegistry) {
        let device = HeadlessDevice::new_default();
        let allocator = Arc::new(Allocator::new(device.clone(), AllocatorConfig::default()));
        let samplers = Arc::new(SamplerCache::new(device.clone()));
        let registry = ResourceRegistry::new(device.clone(), allocator.clone(), samplers).unwrap();
        (device, allocator, registry)
    }

    fn texture(device: &HeadlessDevice, allocator: &Allocator, registry: &mut ResourceRegistry) -> TextureId {
        let extent = Extent2D::new(2, 2);
        let (image, memory) = upload::create_texture_image(
            device,
            allocator,
            &ImageDesc::texture(extent, Format::Rgba8Srgb),
        )
        .unwrap();
        let sampler = registry.samplers().get_or_create(&SamplerDesc::default()).unwrap();
        registry.insert_texture(None, image, memory, sampler, extent)
    }

    #[test]
    fn defaults_are_resident() {
        let (device, _allocator, registry) = registry();
        let white = registry.texture(registry.default_texture()).unwrap();
        assert_eq!(white.extent, Extent2D::new(1, 1));
        let material = registry.material(registry.default_material()).unwrap();
        assert_eq!(material.base_color_texture, registry.default_texture());
        assert_eq!(device.live_images(), 1);
        assert_eq!(device.submission_count(), 1);
    }

    #[test]
    fn shared_texture_outlives_its_first_material() {
        let (device, allocator, mut registry) = registry();
        let shared = texture(&device, &allocator, &mut registry);
        let a = registry.create_material(MaterialDesc::default(), Some(shared)).unwrap();
        let b = registry.create_material(MaterialDesc::default(), Some(shared)).unwrap();
        assert_eq!(registry.texture_refs(shared), 2);

        registry.release(
            &Released {
                meshes: Vec::new(),
                materials: vec![a],
            },
            5,
        );
        assert!(registry.texture(shared).is_some());
        assert_eq!(registry.collect(5), 1);

        registry.release(
            &Released {
                meshes: Vec::new(),
                materials: vec![b],
            },
            6,
        );
        assert!(registry.texture(shared).is_none());
        assert_eq!(device.live_images(), 2);
        assert_eq!(registry.collect(6), 2);
        assert_eq!(device.live_images(), 1);
    }

    #[test]
    fn destruction_waits_for_the_generation() {
        let (_device, allocator, mut registry) = registry();
        let vertices = allocator.allocate(96, 16, UsageClass::Vertex).unwrap();
        let indices = allocator.allocate(12, 16, UsageClass::Index).unwrap();
        let mesh = registry.insert_mesh(vertices, indices, 3, 3, Aabb::EMPTY);

        registry.release(
            &Released {
                meshes: vec![mesh],
                materials: Vec::new(),
            },
            3,
        );
        assert!(registry.mesh(mesh).is_none());
        assert_eq!(registry.stats().retiring, 1);
        assert_eq!(registry.collect(2), 0);
        assert_eq!(allocator.stats().class(UsageClass::Vertex).allocated, 96);
        assert_eq!(registry.collect(3), 1);
        assert_eq!(allocator.stats().class(UsageClass::Vertex).allocated, 0);
    }

    #[test]
    fn default_material_is_never_released() {
        let (_device, _allocator, mut registry) = registry();
        let default = registry.default_material();
        registry.release(
            &Released {
                meshes: Vec::new(),
                materials: vec![default],
            },
            1,
        );
        assert!(registry.material(default).is_some());
        assert_eq!(registry.stats().retiring, 0);
    }

    #[test]
    fn drop_releases_every_image() {
        let (device, allocator, mut registry) = registry();
        texture(&device, &allocator, &mut registry);
        drop(registry);
        assert_eq!(device.live_images(), 0);
    }
}
