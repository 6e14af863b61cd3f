//! Recording a frame's commands from a sorted scene view.
//!
//! Recording allocates no GPU memory and builds no pipelines: everything a
//! draw needs must already be resident, otherwise the draw is skipped.

use crate::error::RecordError;
use vse_core::{MaterialId, MeshId};
use vse_gpu::{
    BufferSlice, Command, CommandBufferId, CommandList, DepthAttachment, DescriptorSetId,
    FrameHandle, ImageId, PipelineKey, PipelineLayoutId, PipelineSnapshot, RawPipelineId,
    RenderingInfo, ShaderStages,
};
use vse_scene::SceneView;

/// Buffers of a resident mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshBinding {
    pub vertices: BufferSlice,
    pub indices: BufferSlice,
    pub index_count: u32,
}

/// Pipeline and set 1 of a material.
#[derive(Clone, Copy, Debug)]
pub struct MaterialBinding<'a> {
    pub pipeline: &'a PipelineKey,
    pub descriptor: DescriptorSetId,
}

/// Resident state the recorder reads while walking a view.
pub trait DrawResources {
    fn mesh(&self, mesh: MeshId) -> Option<MeshBinding>;
    fn material(&self, material: MaterialId) -> Option<MaterialBinding<'_>>;
    /// Set 0 for the frame's slot.
    fn frame_globals(&self, frame: &FrameHandle) -> Option<DescriptorSetId>;
    fn depth_target(&self) -> Option<ImageId>;
}

/// What a UI overlay contributes to a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum OverlayOutput {
    /// Spliced into the render pass after the scene draws.
    Inline(CommandList),
    /// Executed after the render pass ends.
    Secondary(CommandBufferId),
}

/// Extension point for UI drawn on top of the scene.
pub trait OverlaySource {
    fn overlay(&mut self, frame: &FrameHandle) -> Option<OverlayOutput>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub draws: u32,
    /// Draws whose mesh, material or pipeline was not resident.
    pub skipped: u32,
    pub pipeline_binds: u32,
    pub descriptor_binds: u32,
    pub buffer_binds: u32,
    pub overlay: bool,
}

#[derive(Default)]
struct Bound {
    pipeline: Option<(RawPipelineId, PipelineLayoutId)>,
    material: Option<DescriptorSetId>,
    vertices: Option<BufferSlice>,
    indices: Option<BufferSlice>,
}

/// Builds command lists. One recorder per recording thread.
#[derive(Debug, Clone)]
pub struct CommandRecorder {
    clear_color: [f32; 4],
    last_stats: RecordStats,
}

impl Default for CommandRecorder {
    fn default() -> Self {
        Self::new([0.0, 0.0, 0.0, 1.0])
    }
}

impl CommandRecorder {
    pub fn new(clear_color: [f32; 4]) -> Self {
        Self {
            clear_color,
            last_stats: RecordStats::default(),
        }
    }

    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        self.clear_color = clear_color;
    }

    /// Statistics of the most recent [`record`](Self::record).
    pub const fn last_stats(&self) -> RecordStats {
        self.last_stats
    }

    /// Record the frame: the scene pass, the overlay and the present transition.
    pub fn record(
        &mut self,
        frame: &FrameHandle,
        view: &SceneView,
        pipelines: &PipelineSnapshot,
        resources: &dyn DrawResources,
        overlay: Option<&mut dyn OverlaySource>,
    ) -> Result<CommandList, RecordError> {
        let extent = frame.extent();
        if extent.is_zero() {
            return Err(RecordError::EmptyTarget);
        }

        let mut stats = RecordStats::default();
        let mut commands = CommandList::with_capacity(4 + view.len() * 3);
        commands.push(Command::BeginRendering(RenderingInfo {
            color: frame.image(),
            clear_color: self.clear_color,
            depth: resources.depth_target().map(|image| DepthAttachment {
                image,
                clear_depth: 1.0,
            }),
            extent,
        }));
        commands.push(Command::SetViewport(extent));

        let globals = resources.frame_globals(frame);
        let mut bound = Bound::default();
        for draw in view.draws() {
            let Some(material) = resources.material(draw.material) else {
                stats.skipped += 1;
                continue;
            };
            let Some(pipeline) = pipelines.get(material.pipeline) else {
                stats.skipped += 1;
                continue;
            };
            let Some(mesh) = resources.mesh(draw.mesh) else {
                stats.skipped += 1;
                continue;
            };

            let layout = pipeline.layout();
            if bound.pipeline != Some((pipeline.raw(), layout)) {
                let globals = globals.ok_or(RecordError::MissingFrameGlobals(frame.slot()))?;
                commands.push(Command::BindPipeline {
                    pipeline: pipeline.raw(),
                });
                commands.push(Command::BindDescriptorSet {
                    layout,
                    index: 0,
                    set: globals,
                });
                bound.pipeline = Some((pipeline.raw(), layout));
                bound.material = None;
                stats.pipeline_binds += 1;
            }
            if bound.material != Some(material.descriptor) {
                commands.push(Command::BindDescriptorSet {
                    layout,
                    index: 1,
                    set: material.descriptor,
                });
                bound.material = Some(material.descriptor);
                stats.descriptor_binds += 1;
            }
            if bound.vertices != Some(mesh.vertices) {
                commands.push(Command::BindVertexBuffer(mesh.vertices));
                bound.vertices = Some(mesh.vertices);
                stats.buffer_binds += 1;
            }
            if bound.indices != Some(mesh.indices) {
                commands.push(Command::BindIndexBuffer(mesh.indices));
                bound.indices = Some(mesh.indices);
                stats.buffer_binds += 1;
            }

            let stages = pipeline
                .push_constants()
                .first()
                .map_or(ShaderStages::VERTEX, |range| range.stages);
            commands.push(Command::PushConstants {
                layout,
                stages,
                offset: 0,
                data: bytemuck::bytes_of(&draw.model.to_cols_array()).to_vec(),
            });
            commands.push(Command::DrawIndexed {
                index_count: mesh.index_count,
                first_index: 0,
                vertex_offset: 0,
            });
            stats.draws += 1;
        }

        let secondary = match overlay.and_then(|source| source.overlay(frame)) {
            Some(OverlayOutput::Inline(list)) => {
                commands.extend(&list);
                stats.overlay = true;
                None
            }
            Some(OverlayOutput::Secondary(buffer)) => {
                stats.overlay = true;
                Some(buffer)
            }
            None => None,
        };
        commands.push(Command::EndRendering);
        if let Some(buffer) = secondary {
            commands.push(Command::ExecuteSecondary(buffer));
        }
        commands.push(Command::PrepareForPresent(frame.image()));

        tracing::trace!(
            "Recorded frame {}: {} draws, {} skipped, {} pipeline binds",
            frame.generation(),
            stats.draws,
            stats.skipped,
            stats.pipeline_binds
        );
        self.last_stats = stats;
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;
    use hashbrown::HashMap;
    use std::sync::Arc;
    use vse_core::{Aabb, HandleMap, Material, Mesh, Transform};
    use vse_gpu::headless::{HeadlessBackend, HeadlessConfig, HeadlessSurface};
    use vse_gpu::{
        BindingKind, BindingLayout, DescriptorBinding, DeviceConfig, DeviceContext, Extent2D,
        Format, FrameConfig, FrameScheduler, IntermediateBinary, PipelineCache, PushConstantRange,
        RegionId, RenderState, ShaderProgram, ShaderStage, VertexFormat, VertexInput, VertexLayout,
    };
    use vse_scene::{DrawResolver, ResolvedDraw, SceneGraph};

    fn program() -> ShaderProgram {
        let vertex = BindingLayout {
            bindings: vec![DescriptorBinding {
                set: 0,
                binding: 0,
                kind: BindingKind::UniformBuffer,
                count: 1,
                stages: ShaderStages::VERTEX,
            }],
            push_constants: vec![PushConstantRange {
                offset: 0,
                size: 64,
                stages: ShaderStages::VERTEX,
            }],
            vertex_inputs: vec![VertexInput {
                location: 0,
                format: VertexFormat::Float32x3,
            }],
        };
        let fragment = BindingLayout {
            bindings: vec![DescriptorBinding {
                set: 1,
                binding: 0,
                kind: BindingKind::UniformBuffer,
                count: 1,
                stages: ShaderStages::FRAGMENT,
            }],
            ..Default::default()
        };
        ShaderProgram::link(vec![
            (
                IntermediateBinary::new(ShaderStage::Vertex, "main", vec![0x0723_0203, 1]),
                vertex,
            ),
            (
                IntermediateBinary::new(ShaderStage::Fragment, "main", vec![0x0723_0203, 2]),
                fragment,
            ),
        ])
        .unwrap()
    }

    fn slice(region: u64) -> BufferSlice {
        BufferSlice {
            region: RegionId(region),
            offset: 0,
            size: 256,
        }
    }

    struct Table {
        meshes: HashMap<MeshId, MeshBinding>,
        materials: HashMap<MaterialId, (PipelineKey, DescriptorSetId)>,
        globals: Option<DescriptorSetId>,
    }

    impl DrawResources for Table {
        fn mesh(&self, mesh: MeshId) -> Option<MeshBinding> {
            self.meshes.get(&mesh).copied()
        }

        fn material(&self, material: MaterialId) -> Option<MaterialBinding<'_>> {
            self.materials
                .get(&material)
                .map(|(pipeline, descriptor)| MaterialBinding {
                    pipeline,
                    descriptor: *descriptor,
                })
        }

        fn frame_globals(&self, _frame: &FrameHandle) -> Option<DescriptorSetId> {
            self.globals
        }

        fn depth_target(&self) -> Option<ImageId> {
            Some(ImageId(9000))
        }
    }

    impl DrawResolver for Table {
        fn resolve(&self, _mesh: MeshId, material: Option<MaterialId>) -> Option<ResolvedDraw> {
            let material = material?;
            let (pipeline, descriptor) = self.materials.get(&material)?;
            Some(ResolvedDraw {
                material,
                pipeline: pipeline.sort_key(),
                descriptor: descriptor.raw(),
                bounds: Aabb::new(glam::Vec3::ZERO, glam::Vec3::ONE),
            })
        }
    }

    struct Fixture {
        _ctx: DeviceContext,
        scheduler: FrameScheduler,
        pipelines: PipelineCache,
        table: Table,
        graph: SceneGraph,
        meshes: Vec<MeshId>,
        materials: Vec<MaterialId>,
    }

    /// Two materials on distinct pipelines, two meshes, and one mesh id that is not resident.
    fn fixture() -> Fixture {
        let backend = Arc::new(HeadlessBackend::new(HeadlessConfig::default()));
        let surface = HeadlessSurface::new(Extent2D::new(64, 48));
        let ctx = DeviceContext::initialize(
            backend.clone(),
            &DeviceConfig::default(),
            Some(surface.handle()),
        )
        .unwrap();
        let scheduler = FrameScheduler::new(&ctx, surface, FrameConfig::default()).unwrap();
        let pipelines = PipelineCache::new(ctx.device().clone());

        let layout = VertexLayout::packed(&[(0, VertexFormat::Float32x3)]);
        let program = program();
        let opaque = pipelines
            .build_pipeline(&program, &RenderState::new(layout.clone(), Format::Bgra8Srgb))
            .unwrap();
        let culled = pipelines
            .build_pipeline(
                &program,
                &RenderState::new(layout, Format::Bgra8Srgb)
                    .with_cull_mode(vse_gpu::CullMode::None),
            )
            .unwrap();

        let mut mesh_ids: HandleMap<(), Mesh> = HandleMap::new();
        let mut material_ids: HandleMap<(), Material> = HandleMap::new();
        let meshes: Vec<MeshId> = (0..3).map(|_| mesh_ids.insert(())).collect();
        let materials: Vec<MaterialId> = (0..2).map(|_| material_ids.insert(())).collect();

        let mut table = Table {
            meshes: HashMap::new(),
            materials: HashMap::new(),
            globals: Some(DescriptorSetId(500)),
        };
        for (i, &mesh) in meshes.iter().take(2).enumerate() {
            let base = 10 * (i as u64 + 1);
            table.meshes.insert(
                mesh,
                MeshBinding {
                    vertices: slice(base),
                    indices: slice(base + 1),
                    index_count: 3,
                },
            );
        }
        table
            .materials
            .insert(materials[0], (opaque.key().clone(), DescriptorSetId(600)));
        table
            .materials
            .insert(materials[1], (culled.key().clone(), DescriptorSetId(601)));

        Fixture {
            _ctx: ctx,
            scheduler,
            pipelines,
            table,
            graph: SceneGraph::new(),
            meshes,
            materials,
        }
    }

    fn add(f: &mut Fixture, mesh: usize, material: usize) {
        f.graph
            .add_entity(
                None,
                Transform::IDENTITY,
                Some(f.meshes[mesh]),
                Some(f.materials[material]),
            )
            .unwrap();
    }

    fn record(f: &mut Fixture, overlay: Option<&mut dyn OverlaySource>) -> (CommandList, RecordStats) {
        let view = SceneView::build(&mut f.graph, None, &f.table);
        let frame = f.scheduler.begin_frame().unwrap();
        let mut recorder = CommandRecorder::default();
        let list = recorder
            .record(&frame, &view, &f.pipelines.snapshot(), &f.table, overlay)
            .unwrap();
        f.scheduler.end_frame(frame, &list).unwrap();
        (list, recorder.last_stats())
    }

    #[test]
    fn redundant_binds_are_elided() {
        let mut f = fixture();
        add(&mut f, 0, 0);
        add(&mut f, 0, 0);
        add(&mut f, 1, 0);

        let (list, stats) = record(&mut f, None);
        assert_eq!(stats.draws, 3);
        assert_eq!(stats.pipeline_binds, 1);
        assert_eq!(stats.descriptor_binds, 1);
        // Vertex and index buffers of two meshes
        assert_eq!(stats.buffer_binds, 4);
        assert_eq!(list.draw_count(), 3);
        assert_eq!(
            list.count(|c| matches!(c, Command::PushConstants { data, .. } if data.len() == 64)),
            3
        );
    }

    #[test]
    fn pipeline_change_rebinds_frame_globals() {
        let mut f = fixture();
        add(&mut f, 0, 0);
        add(&mut f, 0, 1);

        let (list, stats) = record(&mut f, None);
        assert_eq!(stats.pipeline_binds, 2);
        let globals = list.count(|c| {
            matches!(
                c,
                Command::BindDescriptorSet {
                    index: 0,
                    set: DescriptorSetId(500),
                    ..
                }
            )
        });
        assert_eq!(globals, 2);
    }

    #[test]
    fn frame_is_bracketed_by_rendering_and_present() {
        let mut f = fixture();
        add(&mut f, 0, 0);

        let (list, _) = record(&mut f, None);
        let commands = list.commands();
        let Command::BeginRendering(info) = &commands[0] else {
            panic!("first command is {:?}", commands[0]);
        };
        assert_eq!(info.extent, Extent2D::new(64, 48));
        assert_eq!(info.depth.map(|d| d.image), Some(ImageId(9000)));
        assert_eq!(commands[1], Command::SetViewport(Extent2D::new(64, 48)));
        assert!(matches!(commands[commands.len() - 2], Command::EndRendering));
        assert!(matches!(
            commands[commands.len() - 1],
            Command::PrepareForPresent(image) if image == info.color
        ));
    }

    #[test]
    fn missing_pipeline_or_mesh_is_skipped() {
        let mut f = fixture();
        add(&mut f, 0, 0);
        // Mesh 2 resolves but has no buffers
        add(&mut f, 2, 0);
        // Material 1 now names a pipeline that was never built
        let mut stale = f.table.materials[&f.materials[1]].0.clone();
        stale.state.color_format = Format::Rgba16Float;
        f.table
            .materials
            .insert(f.materials[1], (stale, DescriptorSetId(601)));
        add(&mut f, 0, 1);

        let (list, stats) = record(&mut f, None);
        assert_eq!(stats.draws, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(list.draw_count(), 1);
    }

    #[test]
    fn missing_frame_globals_is_an_error() {
        let mut f = fixture();
        add(&mut f, 0, 0);
        f.table.globals = None;

        let view = SceneView::build(&mut f.graph, None, &f.table);
        let frame = f.scheduler.begin_frame().unwrap();
        let result = CommandRecorder::default().record(
            &frame,
            &view,
            &f.pipelines.snapshot(),
            &f.table,
            None,
        );
        assert_eq!(result, Err(RecordError::MissingFrameGlobals(frame.slot())));
    }

    struct Inline;

    impl OverlaySource for Inline {
        fn overlay(&mut self, _frame: &FrameHandle) -> Option<OverlayOutput> {
            Some(OverlayOutput::Inline(
                [Command::Draw {
                    vertex_count: 6,
                    first_vertex: 0,
                }]
                .into_iter()
                .collect(),
            ))
        }
    }

    struct Secondary(CommandBufferId);

    impl OverlaySource for Secondary {
        fn overlay(&mut self, _frame: &FrameHandle) -> Option<OverlayOutput> {
            Some(OverlayOutput::Secondary(self.0))
        }
    }

    #[test]
    fn inline_overlay_lands_inside_the_pass() {
        let mut f = fixture();
        add(&mut f, 0, 0);

        let (list, stats) = record(&mut f, Some(&mut Inline));
        assert!(stats.overlay);
        let commands = list.commands();
        let draw = commands
            .iter()
            .position(|c| matches!(c, Command::Draw { vertex_count: 6, .. }))
            .unwrap();
        let end = commands
            .iter()
            .position(|c| matches!(c, Command::EndRendering))
            .unwrap();
        assert!(draw < end);
    }

    #[test]
    fn secondary_overlay_runs_after_the_pass() {
        let mut f = fixture();
        add(&mut f, 0, 0);

        let mut overlay = Secondary(CommandBufferId(77));
        let (list, _) = record(&mut f, Some(&mut overlay));
        let commands = list.commands();
        let end = commands
            .iter()
            .position(|c| matches!(c, Command::EndRendering))
            .unwrap();
        assert_eq!(
            commands[end + 1],
            Command::ExecuteSecondary(CommandBufferId(77))
        );
    }

    #[test]
    fn model_matrix_is_pushed_column_major() {
        let mut f = fixture();
        f.graph
            .add_entity(
                None,
                Transform::from_translation(glam::Vec3::new(1.0, 2.0, 3.0)),
                Some(f.meshes[0]),
                Some(f.materials[0]),
            )
            .unwrap();

        let (list, _) = record(&mut f, None);
        let data = list
            .commands()
            .iter()
            .find_map(|c| match c {
                Command::PushConstants { data, .. } => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        let floats: Vec<f32> = data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        let expected = Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0)).to_cols_array();
        assert_eq!(floats.len(), 16);
        for (a, b) in floats.iter().zip(expected) {
            approx::assert_relative_eq!(*a, b);
        }
    }
}
