//! Parallel GPU upload of a parsed scene.
//!
//! Every primitive and texture is one unit on the worker pool. Units stage
//! their bytes and allocate their destinations; the orchestrating thread then
//! submits all copies at once and waits for the transfer fence. A failed or
//! cancelled batch releases everything it allocated.

use crate::description::{ImageSource, MaterialDesc, NodeDesc, SceneDescription, TextureDesc};
use crate::error::{AssetError, Result};
use crate::loader::{CancelToken, LoaderConfig};
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use std::sync::Arc;
use vse_core::Aabb;
use vse_gpu::{
    Allocation, Allocator, Command, CommandBufferLevel, CommandList, Extent2D, Format, GpuDevice,
    GpuError, ImageDesc, ImageId, QueueKind, SamplerCache, SamplerId, Submission, TransientTag,
    UsageClass,
};

/// Per-material uniform block at set 1, binding 0 of the mesh program.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MaterialUniform {
    pub base_color: [f32; 4],
    pub emissive: [f32; 4],
    /// Metallic, roughness, alpha cutoff, unused.
    pub factors: [f32; 4],
}

impl From<&MaterialDesc> for MaterialUniform {
    fn from(desc: &MaterialDesc) -> Self {
        let [r, g, b] = desc.emissive;
        Self {
            base_color: desc.base_color,
            emissive: [r, g, b, 0.0],
            factors: [desc.metallic, desc.roughness, desc.alpha_cutoff, 0.0],
        }
    }
}

/// Device-local geometry of one primitive.
#[derive(Debug)]
pub struct UploadedPrimitive {
    pub vertices: Allocation,
    pub indices: Allocation,
    pub vertex_count: u32,
    pub index_count: u32,
    pub bounds: Aabb,
    pub material: Option<usize>,
}

#[derive(Debug)]
pub struct UploadedTexture {
    pub name: Option<String>,
    pub image: ImageId,
    pub memory: Allocation,
    pub sampler: SamplerId,
    pub extent: Extent2D,
}

#[derive(Debug)]
pub struct UploadedMaterial {
    pub desc: MaterialDesc,
    pub uniform: Allocation,
}

/// A fully resident batch waiting to be attached.
///
/// Owns GPU memory: hand it to `attach` or `Uploader::discard`.
#[derive(Debug)]
pub struct UploadedScene {
    pub(crate) meshes: Vec<Vec<UploadedPrimitive>>,
    /// `None` where decoding failed and the default texture stands in.
    pub(crate) textures: Vec<Option<UploadedTexture>>,
    pub(crate) materials: Vec<UploadedMaterial>,
    pub(crate) nodes: Vec<NodeDesc>,
    pub(crate) roots: Vec<usize>,
    pub(crate) warnings: Vec<String>,
}

impl UploadedScene {
    pub fn primitive_count(&self) -> usize {
        self.meshes.iter().map(Vec::len).sum()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.iter().flatten().count()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Node indices in depth-first pre-order from the roots.
    pub(crate) fn node_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            if let Some(node) = self.nodes.get(index) {
                order.push(index);
                stack.extend(node.children.iter().rev());
            }
        }
        order
    }
}

enum Unit {
    Primitive { mesh: usize, primitive: usize },
    Texture(usize),
}

enum Output {
    Primitive {
        mesh: usize,
        uploaded: UploadedPrimitive,
    },
    Texture {
        index: usize,
        uploaded: Option<UploadedTexture>,
        warning: Option<String>,
    },
}

/// Result of one unit: its output, the staging memory it used and its copies.
struct Staged {
    output: Output,
    staging: Vec<Allocation>,
    commands: Vec<Command>,
}

/// Uploads parsed scenes on a fixed worker pool.
pub struct Uploader {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<Allocator>,
    samplers: Arc<SamplerCache>,
    pool: rayon::ThreadPool,
    texture_fallback: bool,
}

impl Uploader {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        allocator: Arc<Allocator>,
        samplers: Arc<SamplerCache>,
        config: &LoaderConfig,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads.max(1))
            .thread_name(|i| format!("vse-asset-{i}"))
            .build()
            .map_err(|e| AssetError::Worker(e.to_string()))?;
        Ok(Self {
            device,
            allocator,
            samplers,
            pool,
            texture_fallback: config.fallback_to_default_texture,
        })
    }

    /// Upload every primitive, texture and material of `scene`.
    pub fn upload(&self, scene: &SceneDescription, cancel: &CancelToken) -> Result<UploadedScene> {
        let started = std::time::Instant::now();
        let tag = self.allocator.begin_transient();

        let units: Vec<Unit> = scene
            .meshes
            .iter()
            .enumerate()
            .flat_map(|(mesh, desc)| {
                (0..desc.primitives.len()).map(move |primitive| Unit::Primitive { mesh, primitive })
            })
            .chain((0..scene.textures.len()).map(Unit::Texture))
            .collect();

        // Slot per unit keeps error reporting independent of worker scheduling
        let results: Vec<Mutex<Option<Result<Staged>>>> =
            units.iter().map(|_| Mutex::new(None)).collect();
        self.pool.scope(|s| {
            for (unit, slot) in units.iter().zip(&results) {
                s.spawn(move |_| {
                    let result = if cancel.is_cancelled() {
                        Err(AssetError::Cancelled)
                    } else {
                        self.run_unit(scene, unit, tag)
                    };
                    *slot.lock() = Some(result);
                });
            }
        });

        let mut staged = Vec::with_capacity(results.len());
        let mut first_error = None;
        for slot in results {
            match slot.into_inner() {
                Some(Ok(unit)) => staged.push(unit),
                Some(Err(error)) => {
                    first_error.get_or_insert(error);
                }
                None => {
                    first_error.get_or_insert(AssetError::Worker("unit did not run".to_string()));
                }
            }
        }
        if cancel.is_cancelled() {
            first_error = Some(AssetError::Cancelled);
        }

        let mut materials = Vec::with_capacity(scene.materials.len());
        if first_error.is_none() {
            for desc in &scene.materials {
                match self.upload_material(desc) {
                    Ok(material) => materials.push(material),
                    Err(error) => {
                        first_error = Some(error);
                        break;
                    }
                }
            }
        }

        let commands: CommandList = staged
            .iter_mut()
            .flat_map(|unit| std::mem::take(&mut unit.commands))
            .collect();
        if first_error.is_none() && !commands.is_empty() {
            if let Err(error) = submit_and_wait(self.device.as_ref(), &commands) {
                first_error = Some(error.into());
            }
        }

        let mut outputs = Vec::with_capacity(staged.len());
        for unit in staged {
            for allocation in unit.staging {
                self.allocator.free(allocation);
            }
            outputs.push(unit.output);
        }
        self.allocator.retire_transient(tag);

        if let Some(error) = first_error {
            for output in outputs {
                self.release_output(output);
            }
            for material in materials {
                self.allocator.free(material.uniform);
            }
            tracing::debug!("Upload rolled back: {error}");
            return Err(error);
        }

        let mut uploaded = UploadedScene {
            meshes: scene
                .meshes
                .iter()
                .map(|m| Vec::with_capacity(m.primitives.len()))
                .collect(),
            textures: (0..scene.textures.len()).map(|_| None).collect(),
            materials,
            nodes: scene.nodes.clone(),
            roots: scene.roots.clone(),
            warnings: scene.warnings.clone(),
        };
        // Units were collected in creation order, so primitives arrive sorted
        for output in outputs {
            match output {
                Output::Primitive { mesh, uploaded: primitive } => {
                    uploaded.meshes[mesh].push(primitive);
                }
                Output::Texture {
                    index,
                    uploaded: texture,
                    warning,
                } => {
                    uploaded.textures[index] = texture;
                    if let Some(warning) = warning {
                        tracing::warn!("{warning}");
                        uploaded.warnings.push(warning);
                    }
                }
            }
        }

        tracing::debug!(
            "Uploaded {} primitives, {} textures and {} materials in {:.1} ms",
            uploaded.primitive_count(),
            uploaded.texture_count(),
            uploaded.material_count(),
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(uploaded)
    }

    /// Free a batch that will not be attached.
    pub fn discard(&self, scene: UploadedScene) {
        for primitive in scene.meshes.into_iter().flatten() {
            self.allocator.free(primitive.vertices);
            self.allocator.free(primitive.indices);
        }
        for texture in scene.textures.into_iter().flatten() {
            self.device.destroy_image(texture.image);
            self.allocator.free(texture.memory);
        }
        for material in scene.materials {
            self.allocator.free(material.uniform);
        }
    }

    fn run_unit(&self, scene: &SceneDescription, unit: &Unit, tag: TransientTag) -> Result<Staged> {
        match *unit {
            Unit::Primitive { mesh, primitive } => {
                self.upload_primitive(scene, mesh, primitive, tag)
            }
            Unit::Texture(index) => self.upload_texture(&scene.textures[index], index, tag),
        }
    }

    fn upload_primitive(
        &self,
        scene: &SceneDescription,
        mesh: usize,
        primitive: usize,
        tag: TransientTag,
    ) -> Result<Staged> {
        let desc = &scene.meshes[mesh].primitives[primitive];
        let count = |n: usize, what: &str| {
            u32::try_from(n).map_err(|_| AssetError::malformed(mesh, primitive, format!("too many {what}")))
        };
        let vertex_count = count(desc.vertices.len(), "vertices")?;
        let index_count = count(desc.indices.len(), "indices")?;
        if vertex_count == 0 || index_count == 0 {
            return Err(AssetError::malformed(mesh, primitive, "empty primitive".to_string()));
        }

        let mut staging = Vec::new();
        let mut commands = Vec::new();
        let mut destinations = Vec::new();
        let result = (|| {
            for (bytes, class) in [
                (bytemuck::cast_slice::<_, u8>(&desc.vertices), UsageClass::Vertex),
                (bytemuck::cast_slice::<_, u8>(&desc.indices), UsageClass::Index),
            ] {
                let src = self.stage(bytes, tag)?;
                let dst = self.allocator.allocate(bytes.len() as u64, 16, class)?;
                commands.push(Command::CopyBuffer {
                    src: src.slice(),
                    dst: dst.slice(),
                });
                staging.push(src);
                destinations.push(dst);
            }
            Ok::<_, AssetError>(())
        })();

        if let Err(error) = result {
            for allocation in staging.into_iter().chain(destinations) {
                self.allocator.free(allocation);
            }
            return Err(error);
        }

        let indices = destinations.pop();
        let vertices = destinations.pop();
        let (Some(vertices), Some(indices)) = (vertices, indices) else {
            return Err(AssetError::Worker("primitive destinations missing".to_string()));
        };
        Ok(Staged {
            output: Output::Primitive {
                mesh,
                uploaded: UploadedPrimitive {
                    vertices,
                    indices,
                    vertex_count,
                    index_count,
                    bounds: desc.bounds,
                    material: desc.material,
                },
            },
            staging,
            commands,
        })
    }

    fn upload_texture(&self, desc: &TextureDesc, index: usize, tag: TransientTag) -> Result<Staged> {
        let (width, height, pixels) = match decode(&desc.source) {
            Ok(decoded) => decoded,
            Err(reason) if self.texture_fallback => {
                return Ok(Staged {
                    output: Output::Texture {
                        index,
                        uploaded: None,
                        warning: Some(format!(
                            "texture {index}: {reason}; using the default texture"
                        )),
                    },
                    staging: Vec::new(),
                    commands: Vec::new(),
                });
            }
            Err(reason) => return Err(AssetError::Texture { texture: index, reason }),
        };

        let extent = Extent2D::new(width, height);
        let format = if desc.srgb {
            Format::Rgba8Srgb
        } else {
            Format::Rgba8Unorm
        };
        let sampler = self.samplers.get_or_create(&desc.sampler)?;
        let (image, memory) = create_texture_image(
            self.device.as_ref(),
            &self.allocator,
            &ImageDesc::texture(extent, format),
        )?;
        let src = match self.stage(&pixels, tag) {
            Ok(src) => src,
            Err(error) => {
                self.device.destroy_image(image);
                self.allocator.free(memory);
                return Err(error);
            }
        };

        Ok(Staged {
            commands: vec![Command::CopyBufferToImage {
                src: src.slice(),
                image,
                extent,
            }],
            staging: vec![src],
            output: Output::Texture {
                index,
                uploaded: Some(UploadedTexture {
                    name: desc.name.clone(),
                    image,
                    memory,
                    sampler,
                    extent,
                }),
                warning: None,
            },
        })
    }

    fn upload_material(&self, desc: &MaterialDesc) -> Result<UploadedMaterial> {
        Ok(UploadedMaterial {
            desc: desc.clone(),
            uniform: material_uniform(self.device.as_ref(), &self.allocator, desc)?,
        })
    }

    /// Copy `bytes` into staging memory, ring first.
    fn stage(&self, bytes: &[u8], tag: TransientTag) -> Result<Allocation> {
        stage(&self.allocator, self.device.as_ref(), bytes, tag)
    }

    fn release_output(&self, output: Output) {
        match output {
            Output::Primitive { uploaded, .. } => {
                self.allocator.free(uploaded.vertices);
                self.allocator.free(uploaded.indices);
            }
            Output::Texture {
                uploaded: Some(texture),
                ..
            } => {
                self.device.destroy_image(texture.image);
                self.allocator.free(texture.memory);
            }
            Output::Texture { uploaded: None, .. } => {}
        }
    }
}

/// Stage bytes in the ring, falling back to a stable staging allocation when it is full.
pub(crate) fn stage(
    allocator: &Allocator,
    device: &dyn GpuDevice,
    bytes: &[u8],
    tag: TransientTag,
) -> Result<Allocation> {
    let size = bytes.len() as u64;
    let alignment = device.limits().optimal_buffer_copy_offset_alignment.max(4);
    let allocation = match allocator.allocate_transient(size, alignment, tag) {
        Ok(allocation) => allocation,
        Err(GpuError::OutOfMemory { .. }) => {
            tracing::trace!("Staging ring full, {size} bytes go to a stable staging allocation");
            allocator.allocate(size, alignment, UsageClass::Staging)?
        }
        Err(error) => return Err(error.into()),
    };
    if let Err(error) = allocator.write(&allocation, 0, bytes) {
        allocator.free(allocation);
        return Err(error.into());
    }
    Ok(allocation)
}

/// Allocate and fill the uniform block of a material.
pub(crate) fn material_uniform(
    device: &dyn GpuDevice,
    allocator: &Allocator,
    desc: &MaterialDesc,
) -> Result<Allocation> {
    let uniform = allocator.allocate(
        std::mem::size_of::<MaterialUniform>() as u64,
        device.limits().min_uniform_buffer_offset_alignment,
        UsageClass::Uniform,
    )?;
    let params = MaterialUniform::from(desc);
    if let Err(error) = allocator.write(&uniform, 0, bytemuck::bytes_of(&params)) {
        allocator.free(uniform);
        return Err(error.into());
    }
    Ok(uniform)
}

/// Create a sampled image bound to memory from the image class.
pub(crate) fn create_texture_image(
    device: &dyn GpuDevice,
    allocator: &Allocator,
    desc: &ImageDesc,
) -> Result<(ImageId, Allocation)> {
    let requirements = device.image_requirements(desc)?;
    let memory = allocator.allocate(requirements.size, requirements.alignment, UsageClass::Image)?;
    match device.create_image(desc, memory.region(), memory.offset()) {
        Ok(image) => Ok((image, memory)),
        Err(error) => {
            allocator.free(memory);
            Err(error.into())
        }
    }
}

/// Submit `commands` on the transfer queue and block until they complete.
pub(crate) fn submit_and_wait(device: &dyn GpuDevice, commands: &CommandList) -> vse_gpu::Result<()> {
    let cmd = device.create_command_buffer(QueueKind::Transfer, CommandBufferLevel::Primary)?;
    let fence = match device.create_fence(false) {
        Ok(fence) => fence,
        Err(error) => {
            device.free_command_buffer(cmd);
            return Err(error);
        }
    };

    let result = device
        .encode(cmd, commands)
        .and_then(|()| {
            device.submit(
                QueueKind::Transfer,
                &Submission {
                    command_buffers: vec![cmd],
                    fence: Some(fence),
                    ..Default::default()
                },
            )
        })
        .and_then(|()| device.wait_fence(fence, u64::MAX))
        .and_then(|signaled| if signaled { Ok(()) } else { Err(GpuError::Timeout) });

    device.destroy_fence(fence);
    device.free_command_buffer(cmd);
    result
}

/// Decode to tightly packed RGBA8.
fn decode(source: &ImageSource) -> std::result::Result<(u32, u32, Vec<u8>), String> {
    let (width, height, pixels) = match source {
        ImageSource::Encoded { bytes, .. } => {
            let image = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
            let rgba = image.to_rgba8();
            (rgba.width(), rgba.height(), rgba.into_raw())
        }
        ImageSource::Rgba8 {
            width,
            height,
            pixels,
        } => {
            let expected = u64::from(*width) * u64::from(*height) * 4;
            if pixels.len() as u64 != expected {
                return Err(format!(
                    "{} bytes of pixels for a {width}x{height} image",
                    pixels.len()
                ));
            }
            (*width, *height, pixels.to_vec())
        }
    };
    if width == 0 || height == 0 {
        return Err("image has no pixels".to_string());
    }
    Ok((width, height, pixels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{MeshDesc, PrimitiveDesc, Vertex};
    use glam::Vec3;
    use vse_gpu::headless::HeadlessDevice;
    use vse_gpu::{AllocatorConfig, ClassLimits, SamplerDesc};

    struct Fixture {
        device: Arc<HeadlessDevice>,
        allocator: Arc<Allocator>,
        uploader: Uploader,
    }

    fn fixture(config: AllocatorConfig, loader: &LoaderConfig) -> Fixture {
        let device = HeadlessDevice::new_default();
        let allocator = Arc::new(Allocator::new(device.clone(), config));
        let samplers = Arc::new(SamplerCache::new(device.clone()));
        let uploader = Uploader::new(device.clone(), allocator.clone(), samplers, loader).unwrap();
        Fixture {
            device,
            allocator,
            uploader,
        }
    }

    fn triangle(material: Option<usize>) -> PrimitiveDesc {
        let vertices = vec![
            Vertex {
                position: [0.0, 0.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                uv: [0.0, 0.0],
            },
            Vertex {
                position: [1.0, 0.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                uv: [1.0, 0.0],
            },
            Vertex {
                position: [0.0, 1.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                uv: [0.0, 1.0],
            },
        ];
        PrimitiveDesc {
            bounds: Aabb::from_points(vertices.iter().map(|v| Vec3::from(v.position))).unwrap(),
            vertices,
            indices: vec![0, 1, 2],
            material,
        }
    }

    fn checker() -> TextureDesc {
        TextureDesc {
            name: Some("checker".to_string()),
            source: ImageSource::Rgba8 {
                width: 2,
                height: 2,
                pixels: vec![255; 16].into(),
            },
            sampler: SamplerDesc::default(),
            srgb: true,
        }
    }

    fn scene(primitives: usize, textures: Vec<TextureDesc>) -> SceneDescription {
        SceneDescription {
            nodes: vec![NodeDesc {
                name: None,
                local: vse_core::Transform::IDENTITY,
                mesh: Some(0),
                light: None,
                children: Vec::new(),
            }],
            roots: vec![0],
            meshes: vec![MeshDesc {
                name: None,
                primitives: (0..primitives).map(|_| triangle(Some(0))).collect(),
            }],
            materials: vec![MaterialDesc {
                base_color_texture: (!textures.is_empty()).then_some(0),
                ..Default::default()
            }],
            textures,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn uploads_geometry_in_one_transfer_submission() {
        let f = fixture(AllocatorConfig::default(), &LoaderConfig::default());
        let desc = scene(3, vec![checker()]);
        let uploaded = f.uploader.upload(&desc, &CancelToken::new()).unwrap();

        assert_eq!(uploaded.primitive_count(), 3);
        assert_eq!(uploaded.texture_count(), 1);
        assert_eq!(uploaded.material_count(), 1);

        let submitted = f.device.submitted_commands();
        assert_eq!(submitted.len(), 1);
        let (queue, commands) = &submitted[0];
        assert_eq!(*queue, QueueKind::Transfer);
        assert_eq!(commands.count(|c| matches!(c, Command::CopyBuffer { .. })), 6);
        assert_eq!(commands.count(|c| matches!(c, Command::CopyBufferToImage { .. })), 1);

        let primitive = &uploaded.meshes[0][0];
        let bytes = f.device.read_region(
            primitive.indices.region(),
            primitive.indices.offset(),
            12,
        );
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[0, 1, 2]));
        assert!(f.device.violations().is_empty());

        f.uploader.discard(uploaded);
        assert_eq!(f.device.live_images(), 0);
        assert_eq!(f.allocator.stats().class(UsageClass::Vertex).allocated, 0);
    }

    #[test]
    fn material_uniforms_are_written_at_upload() {
        let f = fixture(AllocatorConfig::default(), &LoaderConfig::default());
        let mut desc = scene(1, Vec::new());
        desc.materials[0].base_color = [0.25, 0.5, 0.75, 1.0];
        let uploaded = f.uploader.upload(&desc, &CancelToken::new()).unwrap();

        let uniform = &uploaded.materials[0].uniform;
        let bytes = f.device.read_region(uniform.region(), uniform.offset(), 48);
        let params: MaterialUniform = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(params.base_color, [0.25, 0.5, 0.75, 1.0]);
        approx::assert_relative_eq!(params.factors[2], 0.5);
        f.uploader.discard(uploaded);
    }

    #[test]
    fn full_ring_falls_back_to_stable_staging() {
        let config = AllocatorConfig::default().with_ring_size(64);
        let f = fixture(config, &LoaderConfig::default());
        let uploaded = f.uploader.upload(&scene(2, Vec::new()), &CancelToken::new()).unwrap();
        assert_eq!(uploaded.primitive_count(), 2);
        // Stable staging is returned once the copies complete
        assert_eq!(f.allocator.stats().class(UsageClass::Staging).allocated, 0);
        f.uploader.discard(uploaded);
    }

    #[test]
    fn cancelled_upload_frees_everything() {
        let f = fixture(AllocatorConfig::default(), &LoaderConfig::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = f.uploader.upload(&scene(4, vec![checker()]), &cancel);
        assert!(matches!(result, Err(AssetError::Cancelled)));
        assert_eq!(f.device.submission_count(), 0);
        assert_eq!(f.device.live_images(), 0);
        for class in UsageClass::ALL {
            assert_eq!(f.allocator.stats().class(class).allocated, 0, "{class:?}");
        }
    }

    #[test]
    fn exhausted_vertex_memory_rolls_back() {
        let config = AllocatorConfig::default()
            .with_class_limits(UsageClass::Vertex, ClassLimits::new(96, 96));
        let f = fixture(config, &LoaderConfig::default());
        let result = f.uploader.upload(&scene(3, vec![checker()]), &CancelToken::new());
        assert!(matches!(result, Err(AssetError::Gpu(GpuError::OutOfMemory { .. }))));
        assert_eq!(f.device.submission_count(), 0);
        assert_eq!(f.device.live_images(), 0);
        assert_eq!(f.allocator.stats().class(UsageClass::Index).allocated, 0);
        assert_eq!(f.allocator.stats().class(UsageClass::Vertex).allocated, 0);
    }

    #[test]
    fn undecodable_texture_fails_or_falls_back() {
        let broken = TextureDesc {
            source: ImageSource::Encoded {
                bytes: vec![1, 2, 3].into(),
                mime_type: Some("image/png".to_string()),
            },
            ..checker()
        };

        let strict = fixture(AllocatorConfig::default(), &LoaderConfig::default());
        let result = strict
            .uploader
            .upload(&scene(1, vec![broken.clone()]), &CancelToken::new());
        assert!(matches!(result, Err(AssetError::Texture { texture: 0, .. })));

        let lenient = fixture(
            AllocatorConfig::default(),
            &LoaderConfig::default().with_default_texture_fallback(true),
        );
        let uploaded = lenient
            .uploader
            .upload(&scene(1, vec![broken]), &CancelToken::new())
            .unwrap();
        assert_eq!(uploaded.texture_count(), 0);
        assert_eq!(uploaded.warnings().len(), 1);
        lenient.uploader.discard(uploaded);
    }
}
