//! Per-frame orchestration: deferred releases, material pipelines, frame
//! uniforms, the depth target and command recording.

use crate::error::{RecordError, Result};
use crate::lights::{select_lights, GpuLight, MAX_LIGHTS};
use crate::recorder::{CommandRecorder, DrawResources, MaterialBinding, MeshBinding, OverlaySource, RecordStats};
use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use vse_asset::{AlphaMode, GpuMaterial, ResourceRegistry, Vertex};
use vse_core::{MaterialId, MeshId};
use vse_gpu::{
    Allocation, Allocator, BlendMode, Command, CommandList, CullMode, DepthState, DescriptorCache,
    DescriptorKey, DescriptorResource, DescriptorSetId, DescriptorWrite, DeviceContext, Extent2D,
    Format, FrameError, FrameHandle, FrameScheduler, GpuDevice, ImageDesc, ImageId, PipelineCache,
    PipelineKey, RenderState, RenderingInfo, RetirementQueue, SetLayoutId, ShaderProgram,
    UsageClass, DEFAULT_DESCRIPTOR_LIFETIME,
};
use vse_scene::{Camera, DrawResolver, ResolvedDraw, SceneGraph, SceneView, WorldLight};
use vse_shaders::{builtin, ShaderLibrary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub clear_color: [f32; 4],
    /// `None` renders without a depth attachment.
    pub depth_format: Option<Format>,
    /// Unused frames before a transient descriptor set is evicted.
    pub descriptor_lifetime: u64,
    /// Direction the fallback light travels, in world space. The fallback
    /// shades scenes that carry no lights of their own.
    pub light_direction: [f32; 3],
    pub light_color: [f32; 3],
    /// Linear RGB added to every lit surface.
    pub ambient: [f32; 3],
    /// Persist compiled shaders here between runs.
    pub shader_cache_dir: Option<PathBuf>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            clear_color: [0.05, 0.05, 0.08, 1.0],
            depth_format: Some(Format::D32Float),
            descriptor_lifetime: DEFAULT_DESCRIPTOR_LIFETIME,
            light_direction: [-0.4, -1.0, -0.3],
            light_color: [1.0, 1.0, 1.0],
            ambient: [0.03, 0.03, 0.03],
            shader_cache_dir: None,
        }
    }
}

impl RendererConfig {
    #[must_use]
    pub const fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    #[must_use]
    pub const fn with_depth_format(mut self, depth_format: Option<Format>) -> Self {
        self.depth_format = depth_format;
        self
    }

    #[must_use]
    pub const fn with_descriptor_lifetime(mut self, frames: u64) -> Self {
        self.descriptor_lifetime = frames;
        self
    }

    #[must_use]
    pub const fn with_light(mut self, direction: [f32; 3], color: [f32; 3]) -> Self {
        self.light_direction = direction;
        self.light_color = color;
        self
    }

    #[must_use]
    pub const fn with_ambient(mut self, ambient: [f32; 3]) -> Self {
        self.ambient = ambient;
        self
    }

    #[must_use]
    pub fn with_shader_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_cache_dir = Some(dir.into());
        self
    }
}

/// Set 0, binding 0 of the mesh program.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameGlobals {
    pub view_proj: [[f32; 4]; 4],
    pub camera_position: [f32; 4],
    pub ambient: [f32; 4],
    /// x: entries of `lights` in use
    pub light_count: [u32; 4],
    pub lights: [GpuLight; MAX_LIGHTS],
}

impl FrameGlobals {
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(camera: &Camera, config: &RendererConfig, lights: &[WorldLight]) -> Self {
        let mut selected = select_lights(lights, camera.position);
        if selected.is_empty() {
            selected.push(GpuLight::sun(
                Vec3::from(config.light_direction),
                Vec3::from(config.light_color),
            ));
        }
        let mut globals = Self {
            view_proj: camera.view_projection_matrix().to_cols_array_2d(),
            camera_position: camera.position.extend(1.0).to_array(),
            ambient: Vec3::from(config.ambient).extend(0.0).to_array(),
            light_count: [selected.len() as u32, 0, 0, 0],
            ..Self::default()
        };
        globals.lights[..selected.len()].copy_from_slice(&selected);
        globals
    }
}

/// Result of [`Renderer::render_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented(RecordStats),
    /// The surface was lost, out of date or minimized; nothing was submitted.
    Skipped,
}

struct MaterialEntry {
    pipeline: PipelineKey,
    pipeline_sort: u64,
    descriptor: DescriptorKey,
    set: DescriptorSetId,
}

#[derive(Debug)]
struct DepthTarget {
    image: ImageId,
    memory: Allocation,
    extent: Extent2D,
}

/// Draws a [`SceneGraph`] whose resources live in a [`ResourceRegistry`].
pub struct Renderer {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<Allocator>,
    config: RendererConfig,
    shaders: ShaderLibrary,
    opaque: Arc<ShaderProgram>,
    masked: Arc<ShaderProgram>,
    pipelines: PipelineCache,
    descriptors: DescriptorCache,
    recorder: CommandRecorder,
    globals_layout: SetLayoutId,
    material_layout: SetLayoutId,
    /// One uniform block per frame slot.
    globals: Vec<Allocation>,
    materials: HashMap<MaterialId, MaterialEntry>,
    /// Materials whose pipeline failed to build, with the target format tried.
    failed: HashMap<MaterialId, Format>,
    depth: Option<DepthTarget>,
    retired_depth: RetirementQueue<DepthTarget>,
}

impl Renderer {
    /// Compile the built-in programs and allocate per-slot uniforms.
    pub fn new(ctx: &DeviceContext, frames_in_flight: u32, config: RendererConfig) -> Result<Self> {
        let library = match &config.shader_cache_dir {
            Some(dir) => ShaderLibrary::default().with_disk_cache(dir),
            None => ShaderLibrary::default(),
        };
        Self::with_library(ctx, frames_in_flight, config, library)
    }

    pub fn with_library(
        ctx: &DeviceContext,
        frames_in_flight: u32,
        config: RendererConfig,
        shaders: ShaderLibrary,
    ) -> Result<Self> {
        let device = ctx.device().clone();
        let allocator = ctx.allocator().clone();

        for program in shaders.warm_up(&[builtin::mesh_program(false), builtin::mesh_program(true)]) {
            program?;
        }
        let opaque = shaders.mesh_program(false)?;
        let masked = shaders.mesh_program(true)?;

        let pipelines = PipelineCache::new(device.clone());
        let globals_layout = pipelines
            .set_layouts()
            .get_or_create(&opaque.layout().set_layout(0))?;
        let material_layout = pipelines
            .set_layouts()
            .get_or_create(&opaque.layout().set_layout(1))?;

        let alignment = device.limits().min_uniform_buffer_offset_alignment.max(1);
        let size = std::mem::size_of::<FrameGlobals>() as u64;
        let mut globals = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight {
            match allocator.allocate(size, alignment, UsageClass::Uniform) {
                Ok(memory) => globals.push(memory),
                Err(error) => {
                    for memory in globals {
                        allocator.free(memory);
                    }
                    return Err(error.into());
                }
            }
        }

        tracing::info!(
            "Renderer initialized: {} frame uniform slots, depth {:?}",
            frames_in_flight,
            config.depth_format
        );
        Ok(Self {
            descriptors: DescriptorCache::new(device.clone(), config.descriptor_lifetime),
            recorder: CommandRecorder::new(config.clear_color),
            device,
            allocator,
            config,
            shaders,
            opaque,
            masked,
            pipelines,
            globals_layout,
            material_layout,
            globals,
            materials: HashMap::new(),
            failed: HashMap::new(),
            depth: None,
            retired_depth: RetirementQueue::new(),
        })
    }

    pub const fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        self.config.clear_color = clear_color;
        self.recorder.set_clear_color(clear_color);
    }

    pub const fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    pub const fn descriptors(&self) -> &DescriptorCache {
        &self.descriptors
    }

    pub const fn shaders(&self) -> &ShaderLibrary {
        &self.shaders
    }

    /// Materials with a resident pipeline and descriptor set.
    pub fn prepared_materials(&self) -> usize {
        self.materials.len()
    }

    pub fn depth_extent(&self) -> Option<Extent2D> {
        self.depth.as_ref().map(|d| d.extent)
    }

    pub const fn last_stats(&self) -> RecordStats {
        self.recorder.last_stats()
    }

    /// Render and present one frame of `graph`.
    ///
    /// Resources released by the graph since the last frame are retired first and
    /// destroyed once the frames that may reference them have completed.
    pub fn render_frame(
        &mut self,
        scheduler: &mut FrameScheduler,
        graph: &mut SceneGraph,
        registry: &mut ResourceRegistry,
        camera: &Camera,
        overlay: Option<&mut dyn OverlaySource>,
    ) -> Result<FrameOutcome> {
        self.release(graph, registry, scheduler.last_submitted_generation());

        let frame = match scheduler.begin_frame() {
            Ok(frame) => frame,
            Err(FrameError::SurfaceLost) => return Ok(FrameOutcome::Skipped),
            Err(error) => return Err(error.into()),
        };
        self.collect(registry, scheduler.completed_generation());

        let retire_at = scheduler.last_submitted_generation();
        let commands = match self.record_frame(&frame, retire_at, graph, registry, camera, overlay) {
            Ok(commands) => commands,
            Err(error) => {
                // The slot still has to be submitted to leave the recording state.
                let fallback = self.clear_only(&frame);
                scheduler.end_frame(frame, &fallback)?;
                return Err(error);
            }
        };

        let generation = frame.generation();
        scheduler.end_frame(frame, &commands)?;
        self.descriptors.evict_unused(generation);
        Ok(FrameOutcome::Presented(self.recorder.last_stats()))
    }

    fn record_frame(
        &mut self,
        frame: &FrameHandle,
        retire_at: u64,
        graph: &mut SceneGraph,
        registry: &ResourceRegistry,
        camera: &Camera,
        overlay: Option<&mut dyn OverlaySource>,
    ) -> Result<CommandList> {
        let generation = frame.generation();
        self.prepare_materials(registry, frame.format(), generation)?;
        self.ensure_depth(frame.extent(), retire_at)?;

        let memory = self
            .globals
            .get(frame.slot())
            .ok_or(RecordError::MissingFrameGlobals(frame.slot()))?;
        let lights = graph.collect_lights();
        // The slot's previous frame has completed, so its block is free to overwrite.
        self.allocator.write(
            memory,
            0,
            bytemuck::bytes_of(&FrameGlobals::new(camera, &self.config, &lights)),
        )?;
        let key = DescriptorKey::new(
            self.globals_layout,
            vec![DescriptorWrite {
                binding: 0,
                resource: DescriptorResource::UniformBuffer(memory.slice()),
            }],
        );
        let globals = self.descriptors.get_or_create(&key, true, generation)?;

        let resources = FrameResources {
            registry,
            materials: &self.materials,
            globals,
            depth: self.depth.as_ref().map(|d| d.image),
        };
        let frustum = camera.frustum();
        let view = SceneView::build(graph, Some(&frustum), &resources);
        let snapshot = self.pipelines.snapshot();
        Ok(self
            .recorder
            .record(frame, &view, &snapshot, &resources, overlay)?)
    }

    /// Build pipelines and descriptor sets for new materials, or for all of
    /// them when the target format changed.
    fn prepare_materials(
        &mut self,
        registry: &ResourceRegistry,
        format: Format,
        generation: u64,
    ) -> Result<()> {
        for (id, material) in registry.materials() {
            let current = self
                .materials
                .get(&id)
                .is_some_and(|e| e.pipeline.state.color_format == format);
            if current || self.failed.get(&id) == Some(&format) {
                continue;
            }

            let pipeline = match self.material_pipeline(material, format) {
                Ok(pipeline) => pipeline,
                Err(error) if id != registry.default_material() => {
                    tracing::warn!(
                        "Material {:?} has no pipeline and falls back to the default: {error}",
                        material.name
                    );
                    self.failed.insert(id, format);
                    continue;
                }
                Err(error) => return Err(error),
            };

            let (descriptor, set) = match self.materials.remove(&id) {
                Some(entry) => (entry.descriptor, entry.set),
                None => {
                    let key = self.material_descriptor(registry, material);
                    let set = self.descriptors.get_or_create(&key, true, generation)?;
                    (key, set)
                }
            };
            self.failed.remove(&id);
            self.materials.insert(
                id,
                MaterialEntry {
                    pipeline_sort: pipeline.sort_key(),
                    pipeline,
                    descriptor,
                    set,
                },
            );
        }
        Ok(())
    }

    fn material_pipeline(&self, material: &GpuMaterial, format: Format) -> Result<PipelineKey> {
        let program = if material.alpha_mode == AlphaMode::Mask {
            &self.masked
        } else {
            &self.opaque
        };

        let mut state =
            RenderState::new(Vertex::layout(), format).with_depth_format(self.config.depth_format);
        if material.double_sided {
            state = state.with_cull_mode(CullMode::None);
        }
        if material.alpha_mode == AlphaMode::Blend {
            state = state.with_blend(BlendMode::Alpha).with_depth(DepthState {
                write: false,
                ..DepthState::default()
            });
        }
        if self.config.depth_format.is_none() {
            state = state.with_depth(DepthState {
                test: false,
                write: false,
                ..DepthState::default()
            });
        }

        let pipeline = self.pipelines.build_pipeline(program, &state)?;
        Ok(pipeline.key().clone())
    }

    fn material_descriptor(&self, registry: &ResourceRegistry, material: &GpuMaterial) -> DescriptorKey {
        let mut writes = vec![DescriptorWrite {
            binding: 0,
            resource: DescriptorResource::UniformBuffer(material.uniform()),
        }];
        let texture = registry
            .texture(material.base_color_texture)
            .or_else(|| registry.texture(registry.default_texture()));
        if let Some(texture) = texture {
            writes.push(DescriptorWrite {
                binding: 1,
                resource: DescriptorResource::SampledImage(texture.image),
            });
            writes.push(DescriptorWrite {
                binding: 2,
                resource: DescriptorResource::Sampler(texture.sampler),
            });
        }
        DescriptorKey::new(self.material_layout, writes)
    }

    fn ensure_depth(&mut self, extent: Extent2D, retire_at: u64) -> Result<()> {
        let Some(format) = self.config.depth_format else {
            return Ok(());
        };
        if self.depth.as_ref().is_some_and(|d| d.extent == extent) {
            return Ok(());
        }
        if let Some(old) = self.depth.take() {
            self.retired_depth.retire(old, retire_at);
        }

        let desc = ImageDesc::depth(extent, format);
        let requirements = self.device.image_requirements(&desc)?;
        let memory = self
            .allocator
            .allocate(requirements.size, requirements.alignment, UsageClass::Image)?;
        let image = match self.device.create_image(&desc, memory.region(), memory.offset()) {
            Ok(image) => image,
            Err(error) => {
                self.allocator.free(memory);
                return Err(error.into());
            }
        };

        tracing::debug!("Depth target {}x{} ({format:?})", extent.width, extent.height);
        self.depth = Some(DepthTarget {
            image,
            memory,
            extent,
        });
        Ok(())
    }

    fn release(&mut self, graph: &mut SceneGraph, registry: &mut ResourceRegistry, generation: u64) {
        let released = graph.take_released();
        if released.is_empty() {
            return;
        }
        for id in &released.materials {
            if *id == registry.default_material() {
                continue;
            }
            self.failed.remove(id);
            if let Some(entry) = self.materials.remove(id) {
                self.descriptors.release(&entry.descriptor, generation);
            }
        }
        registry.release(&released, generation);
        tracing::trace!(
            "Released {} meshes and {} materials after generation {generation}",
            released.meshes.len(),
            released.materials.len()
        );
    }

    fn collect(&mut self, registry: &mut ResourceRegistry, completed: u64) {
        registry.collect(completed);
        self.descriptors.collect(completed);
        for target in self.retired_depth.drain_completed(completed) {
            self.destroy_depth(target);
        }
    }

    fn destroy_depth(&self, target: DepthTarget) {
        self.device.destroy_image(target.image);
        self.allocator.free(target.memory);
    }

    fn clear_only(&self, frame: &FrameHandle) -> CommandList {
        [
            Command::BeginRendering(RenderingInfo {
                color: frame.image(),
                clear_color: self.config.clear_color,
                depth: None,
                extent: frame.extent(),
            }),
            Command::EndRendering,
            Command::PrepareForPresent(frame.image()),
        ]
        .into_iter()
        .collect()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle: {e}");
        }
        self.descriptors.destroy_all();
        self.pipelines.destroy_all();
        for memory in std::mem::take(&mut self.globals) {
            self.allocator.free(memory);
        }
        let targets: Vec<DepthTarget> = self
            .depth
            .take()
            .into_iter()
            .chain(self.retired_depth.flush())
            .collect();
        for target in targets {
            self.destroy_depth(target);
        }
    }
}

/// Read-only view of the resident state one frame draws from.
struct FrameResources<'a> {
    registry: &'a ResourceRegistry,
    materials: &'a HashMap<MaterialId, MaterialEntry>,
    globals: DescriptorSetId,
    depth: Option<ImageId>,
}

impl FrameResources<'_> {
    /// Entities without a prepared material draw with the default one.
    fn effective_material(&self, material: Option<MaterialId>) -> MaterialId {
        material
            .filter(|m| self.materials.contains_key(m))
            .unwrap_or_else(|| self.registry.default_material())
    }
}

impl DrawResolver for FrameResources<'_> {
    fn resolve(&self, mesh: MeshId, material: Option<MaterialId>) -> Option<ResolvedDraw> {
        let bounds = self.registry.mesh(mesh)?.bounds;
        let material = self.effective_material(material);
        let entry = self.materials.get(&material)?;
        Some(ResolvedDraw {
            material,
            pipeline: entry.pipeline_sort,
            descriptor: entry.set.raw(),
            bounds,
        })
    }
}

impl DrawResources for FrameResources<'_> {
    fn mesh(&self, mesh: MeshId) -> Option<MeshBinding> {
        self.registry.mesh(mesh).map(|m| MeshBinding {
            vertices: m.vertex_buffer(),
            indices: m.index_buffer(),
            index_count: m.index_count,
        })
    }

    fn material(&self, material: MaterialId) -> Option<MaterialBinding<'_>> {
        self.materials.get(&material).map(|entry| MaterialBinding {
            pipeline: &entry.pipeline,
            descriptor: entry.set,
        })
    }

    fn frame_globals(&self, _frame: &FrameHandle) -> Option<DescriptorSetId> {
        Some(self.globals)
    }

    fn depth_target(&self) -> Option<ImageId> {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use vse_asset::MaterialDesc;
    use vse_core::{Aabb, Transform};
    use vse_gpu::headless::{HeadlessBackend, HeadlessConfig, HeadlessDevice, HeadlessSurface};
    use vse_gpu::{DeviceConfig, FrameConfig, QueueKind, SamplerCache};

    struct Fixture {
        device: Arc<HeadlessDevice>,
        surface: Arc<HeadlessSurface>,
        renderer: Renderer,
        scheduler: FrameScheduler,
        registry: ResourceRegistry,
        graph: SceneGraph,
        camera: Camera,
        ctx: DeviceContext,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default()));
        let surface = HeadlessSurface::new(Extent2D::new(320, 240));
        let ctx = DeviceContext::initialize(
            backend.clone(),
            &DeviceConfig::default(),
            Some(surface.handle()),
        )
        .unwrap();
        let device = backend.device().unwrap();
        let scheduler = FrameScheduler::new(&ctx, surface.clone(), FrameConfig::default()).unwrap();
        let renderer = Renderer::new(&ctx, scheduler.frames_in_flight(), RendererConfig::default()).unwrap();
        let samplers = Arc::new(SamplerCache::new(ctx.device().clone()));
        let registry =
            ResourceRegistry::new(ctx.device().clone(), ctx.allocator().clone(), samplers).unwrap();

        let mut camera = Camera {
            position: Vec3::new(0.0, 0.0, 5.0),
            ..Camera::default()
        };
        camera.set_aspect(320.0 / 240.0);
        Fixture {
            device,
            surface,
            renderer,
            scheduler,
            registry,
            graph: SceneGraph::new(),
            camera,
            ctx,
        }
    }

    fn mesh(f: &mut Fixture) -> MeshId {
        let allocator = f.ctx.allocator();
        let vertices = allocator.allocate(96, 4, UsageClass::Vertex).unwrap();
        let indices = allocator.allocate(12, 4, UsageClass::Index).unwrap();
        f.registry.insert_mesh(
            vertices,
            indices,
            3,
            3,
            Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5)),
        )
    }

    fn frame(f: &mut Fixture) -> FrameOutcome {
        f.renderer
            .render_frame(&mut f.scheduler, &mut f.graph, &mut f.registry, &f.camera, None)
            .unwrap()
    }

    fn presented(outcome: FrameOutcome) -> RecordStats {
        match outcome {
            FrameOutcome::Presented(stats) => stats,
            FrameOutcome::Skipped => panic!("frame was skipped"),
        }
    }

    #[test]
    fn frame_globals_match_the_shader_block() {
        assert_eq!(std::mem::size_of::<FrameGlobals>(), 96 + 64 * MAX_LIGHTS);
        let camera = Camera::default();
        let globals = FrameGlobals::new(&camera, &RendererConfig::default(), &[]);
        assert_eq!(globals.camera_position, [0.0, 0.0, 5.0, 1.0]);
        // Without scene lights the configured sun shades the frame
        assert_eq!(globals.light_count[0], 1);
        assert_eq!(globals.lights[0].direction_kind[3], crate::lights::KIND_DIRECTIONAL);
        approx::assert_relative_eq!(globals.ambient[0], 0.03);
    }

    #[test]
    fn scene_lights_reach_the_frame_uniform() {
        let mut f = fixture();
        let mesh = mesh(&mut f);
        f.graph
            .add_entity(None, Transform::IDENTITY, Some(mesh), None)
            .unwrap();
        let lamp = f
            .graph
            .add_entity(None, Transform::from_translation(Vec3::new(0.0, 2.0, 1.0)), None, None)
            .unwrap();
        f.graph
            .set_light(lamp, Some(vse_scene::Light::point(Vec3::ONE, 6.0, 10.0)))
            .unwrap();

        presented(frame(&mut f));
        let memory = &f.renderer.globals[0];
        let bytes = f.device.read_region(
            memory.region(),
            memory.offset(),
            std::mem::size_of::<FrameGlobals>(),
        );
        let globals: FrameGlobals = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(globals.light_count[0], 1);
        assert_eq!(globals.lights[0].position_range, [0.0, 2.0, 1.0, 10.0]);
        assert_eq!(globals.lights[0].color_intensity[3], 6.0);
    }

    #[test]
    fn renders_a_resident_mesh_with_the_default_material() {
        let mut f = fixture();
        let mesh = mesh(&mut f);
        f.graph
            .add_entity(None, Transform::IDENTITY, Some(mesh), None)
            .unwrap();

        let stats = presented(frame(&mut f));
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.skipped, 0);

        let submitted = f.device.submitted_commands();
        let (queue, list) = submitted.last().unwrap();
        assert_eq!(*queue, QueueKind::Graphics);
        assert_eq!(list.draw_count(), 1);
        assert!(f.device.violations().is_empty());
    }

    #[test]
    fn pipelines_are_built_once_across_frames() {
        let mut f = fixture();
        let mesh = mesh(&mut f);
        f.graph
            .add_entity(None, Transform::IDENTITY, Some(mesh), None)
            .unwrap();

        for _ in 0..4 {
            presented(frame(&mut f));
        }
        assert_eq!(f.renderer.pipelines().build_count(), 1);
        assert_eq!(f.renderer.prepared_materials(), 1);
    }

    #[test]
    fn material_modes_select_distinct_pipelines() {
        let mut f = fixture();
        let mesh = mesh(&mut f);
        let descs = [
            MaterialDesc {
                alpha_mode: AlphaMode::Mask,
                ..Default::default()
            },
            MaterialDesc {
                alpha_mode: AlphaMode::Blend,
                ..Default::default()
            },
            MaterialDesc {
                double_sided: true,
                ..Default::default()
            },
            // Same state as the default material
            MaterialDesc::default(),
        ];
        for desc in descs {
            let material = f.registry.create_material(desc, None).unwrap();
            f.graph
                .add_entity(None, Transform::IDENTITY, Some(mesh), Some(material))
                .unwrap();
        }

        let stats = presented(frame(&mut f));
        assert_eq!(stats.draws, 4);
        assert_eq!(f.renderer.pipelines().build_count(), 4);
        assert_eq!(stats.pipeline_binds, 4);
    }

    #[test]
    fn resize_replaces_the_depth_target_after_the_gpu_is_done() {
        let mut f = fixture();
        presented(frame(&mut f));
        assert_eq!(f.renderer.depth_extent(), Some(Extent2D::new(320, 240)));
        // White default texture and the depth target
        assert_eq!(f.device.live_images(), 2);

        f.surface.resize(Extent2D::new(640, 480));
        presented(frame(&mut f));
        assert_eq!(f.renderer.depth_extent(), Some(Extent2D::new(640, 480)));
        for _ in 0..2 {
            presented(frame(&mut f));
        }
        assert_eq!(f.device.live_images(), 2);
    }

    #[test]
    fn minimized_surface_skips_the_frame() {
        let mut f = fixture();
        presented(frame(&mut f));
        f.surface.resize(Extent2D::new(0, 0));
        assert_eq!(frame(&mut f), FrameOutcome::Skipped);

        f.surface.resize(Extent2D::new(320, 240));
        presented(frame(&mut f));
    }

    #[test]
    fn removed_entity_resources_wait_for_their_last_frame() {
        let mut f = fixture();
        let mesh = mesh(&mut f);
        let material = f.registry.create_material(MaterialDesc::default(), None).unwrap();
        let entity = f
            .graph
            .add_entity(None, Transform::IDENTITY, Some(mesh), Some(material))
            .unwrap();
        presented(frame(&mut f));
        presented(frame(&mut f));
        let sets = f.device.live_descriptor_sets();

        f.graph.remove_entity(entity).unwrap();
        // Frame 3 retires at generation 2 but has only seen frame 1 complete
        let stats = presented(frame(&mut f));
        assert_eq!(stats.draws, 0);
        assert_eq!(f.registry.stats().retiring, 2);
        assert!(f.registry.mesh(mesh).is_none());

        presented(frame(&mut f));
        assert_eq!(f.registry.stats().retiring, 0);
        assert_eq!(f.device.live_descriptor_sets(), sets - 1);
        assert_eq!(f.renderer.prepared_materials(), 1);
    }

    #[test]
    fn entity_without_material_uses_the_default() {
        let mut f = fixture();
        let mesh = mesh(&mut f);
        let material = f.registry.create_material(MaterialDesc::default(), None).unwrap();
        f.graph
            .add_entity(None, Transform::IDENTITY, Some(mesh), Some(material))
            .unwrap();
        f.graph
            .add_entity(None, Transform::IDENTITY, Some(mesh), None)
            .unwrap();

        let stats = presented(frame(&mut f));
        assert_eq!(stats.draws, 2);
        // Both share one pipeline but bind two material sets
        assert_eq!(stats.pipeline_binds, 1);
        assert_eq!(stats.descriptor_binds, 2);
    }

    #[test]
    fn culled_entities_are_not_drawn() {
        let mut f = fixture();
        let mesh = mesh(&mut f);
        f.graph
            .add_entity(None, Transform::IDENTITY, Some(mesh), None)
            .unwrap();
        f.graph
            .add_entity(
                None,
                Transform::from_translation(Vec3::new(0.0, 0.0, 100.0)),
                Some(mesh),
                None,
            )
            .unwrap();

        let stats = presented(frame(&mut f));
        assert_eq!(stats.draws, 1);
    }
}
