//! Render state, pipeline keys and the pipeline cache.
//!
//! Lookups read an immutable [`PipelineSnapshot`]; inserts copy the published
//! map under the build lock and publish a new snapshot, so readers never wait
//! on a pipeline build.

use crate::device::{GpuDevice, GraphicsPipelineDesc};
use crate::error::GpuError;
use crate::shader::{ProgramId, PushConstantRange, SetLayoutDesc, ShaderProgram, VertexFormat};
use crate::types::{Format, PipelineLayoutId, RawPipelineId, SetLayoutId};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Topology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    LessOrEqual,
    Equal,
    Greater,
    Always,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// Straight alpha: `src * a + dst * (1 - a)`.
    Alpha,
    Additive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare: CompareOp::Less,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Interleaved layout of vertex buffer binding 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Pack attributes tightly in the given order.
    pub fn packed(formats: &[(u32, VertexFormat)]) -> Self {
        let mut offset = 0;
        let attributes = formats
            .iter()
            .map(|&(location, format)| {
                let attribute = VertexAttribute {
                    location,
                    format,
                    offset,
                };
                offset += format.size();
                attribute
            })
            .collect();
        Self {
            stride: offset,
            attributes,
        }
    }
}

/// Fixed-function state and attachment formats of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub vertex_layout: VertexLayout,
    pub topology: Topology,
    pub raster: RasterState,
    pub depth: DepthState,
    pub blend: BlendMode,
    pub color_format: Format,
    pub depth_format: Option<Format>,
}

impl RenderState {
    pub fn new(vertex_layout: VertexLayout, color_format: Format) -> Self {
        Self {
            vertex_layout,
            topology: Topology::default(),
            raster: RasterState::default(),
            depth: DepthState::default(),
            blend: BlendMode::default(),
            color_format,
            depth_format: Some(Format::D32Float),
        }
    }

    #[must_use]
    pub const fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.raster.cull_mode = cull_mode;
        self
    }

    #[must_use]
    pub const fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    #[must_use]
    pub const fn with_depth(mut self, depth: DepthState) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub const fn with_depth_format(mut self, depth_format: Option<Format>) -> Self {
        self.depth_format = depth_format;
        self
    }
}

/// Cache key: program identity plus render state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub program: ProgramId,
    pub state: RenderState,
}

impl PipelineKey {
    pub const fn new(program: ProgramId, state: RenderState) -> Self {
        Self { program, state }
    }

    /// Stable hash used as a draw sort key.
    pub fn sort_key(&self) -> u64 {
        let mut hasher = foldhash::fast::FixedState::default().build_hasher();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("vertex input at location {location} is not provided by the vertex layout")]
    MissingVertexAttribute { location: u32 },
    #[error("vertex input at location {location} expects {expected:?}, layout provides {found:?}")]
    VertexFormatMismatch {
        location: u32,
        expected: VertexFormat,
        found: VertexFormat,
    },
    #[error("program has no vertex stage")]
    MissingVertexStage,
    #[error("depth format {0:?} used as color target")]
    InvalidColorFormat(Format),
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// An immutable pipeline state object.
#[derive(Debug)]
pub struct Pipeline {
    key: PipelineKey,
    raw: RawPipelineId,
    layout: PipelineLayoutId,
    set_layouts: Vec<SetLayoutId>,
    push_constants: Vec<PushConstantRange>,
}

impl Pipeline {
    pub const fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub const fn raw(&self) -> RawPipelineId {
        self.raw
    }

    pub const fn layout(&self) -> PipelineLayoutId {
        self.layout
    }

    /// Set layout for each descriptor set index.
    pub fn set_layouts(&self) -> &[SetLayoutId] {
        &self.set_layouts
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.push_constants
    }
}

/// Immutable view of every published pipeline.
pub type PipelineSnapshot = HashMap<PipelineKey, Arc<Pipeline>>;

/// Deduplicates descriptor set layouts so equal layouts share a handle.
pub struct SetLayoutCache {
    device: Arc<dyn GpuDevice>,
    layouts: Mutex<HashMap<SetLayoutDesc, SetLayoutId>>,
}

impl SetLayoutCache {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            layouts: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, desc: &SetLayoutDesc) -> Result<SetLayoutId, GpuError> {
        let mut layouts = self.layouts.lock();
        if let Some(&layout) = layouts.get(desc) {
            return Ok(layout);
        }
        let layout = self.device.create_set_layout(desc)?;
        layouts.insert(desc.clone(), layout);
        Ok(layout)
    }

    fn destroy_all(&self) {
        for (_, layout) in self.layouts.lock().drain() {
            self.device.destroy_set_layout(layout);
        }
    }
}

/// Cache of pipeline state objects keyed by [`PipelineKey`].
pub struct PipelineCache {
    device: Arc<dyn GpuDevice>,
    set_layouts: SetLayoutCache,
    published: RwLock<Arc<PipelineSnapshot>>,
    build_lock: Mutex<()>,
    builds: AtomicU64,
}

impl PipelineCache {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            set_layouts: SetLayoutCache::new(device.clone()),
            device,
            published: RwLock::new(Arc::new(HashMap::new())),
            build_lock: Mutex::new(()),
            builds: AtomicU64::new(0),
        }
    }

    pub const fn set_layouts(&self) -> &SetLayoutCache {
        &self.set_layouts
    }

    /// Currently published pipelines. Lookups on the snapshot take no lock.
    pub fn snapshot(&self) -> Arc<PipelineSnapshot> {
        self.published.read().clone()
    }

    pub fn get(&self, key: &PipelineKey) -> Option<Arc<Pipeline>> {
        self.snapshot().get(key).cloned()
    }

    /// Number of pipelines created through the driver.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.published.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached pipeline for `(program, state)`, building it on a miss.
    pub fn build_pipeline(
        &self,
        program: &ShaderProgram,
        state: &RenderState,
    ) -> Result<Arc<Pipeline>, PipelineError> {
        let key = PipelineKey::new(program.id(), state.clone());
        if let Some(pipeline) = self.snapshot().get(&key) {
            return Ok(pipeline.clone());
        }

        let _guard = self.build_lock.lock();
        // Another thread may have published it while we waited.
        if let Some(pipeline) = self.snapshot().get(&key) {
            return Ok(pipeline.clone());
        }

        validate(program, state)?;
        let pipeline = Arc::new(self.create(program, key.clone())?);
        self.builds.fetch_add(1, Ordering::Relaxed);

        let mut next = PipelineSnapshot::clone(&self.snapshot());
        next.insert(key, pipeline.clone());
        *self.published.write() = Arc::new(next);

        tracing::debug!(
            "Built pipeline {:?} for program {:?} ({:?})",
            pipeline.raw,
            program.id(),
            state.color_format
        );
        Ok(pipeline)
    }

    fn create(&self, program: &ShaderProgram, key: PipelineKey) -> Result<Pipeline, GpuError> {
        let layout = program.layout();
        let set_layouts = (0..layout.set_count())
            .map(|set| self.set_layouts.get_or_create(&layout.set_layout(set)))
            .collect::<Result<Vec<_>, _>>()?;

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&set_layouts, &layout.push_constants)?;

        let raw = match self.device.create_graphics_pipeline(&GraphicsPipelineDesc {
            layout: pipeline_layout,
            stages: program.stages(),
            state: &key.state,
        }) {
            Ok(raw) => raw,
            Err(e) => {
                self.device.destroy_pipeline_layout(pipeline_layout);
                return Err(e);
            }
        };

        Ok(Pipeline {
            key,
            raw,
            layout: pipeline_layout,
            set_layouts,
            push_constants: layout.push_constants.clone(),
        })
    }

    /// Destroy every pipeline and set layout. The device must be idle.
    pub fn destroy_all(&self) {
        let _guard = self.build_lock.lock();
        let published = std::mem::take(&mut *self.published.write());
        for pipeline in published.values() {
            self.device.destroy_pipeline(pipeline.raw);
            self.device.destroy_pipeline_layout(pipeline.layout);
        }
        self.set_layouts.destroy_all();
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

/// Check the vertex layout against the program's reflected vertex inputs.
fn validate(program: &ShaderProgram, state: &RenderState) -> Result<(), PipelineError> {
    if state.color_format.is_depth() {
        return Err(PipelineError::InvalidColorFormat(state.color_format));
    }
    if !program
        .stages()
        .iter()
        .any(|s| s.stage == crate::shader::ShaderStage::Vertex)
    {
        return Err(PipelineError::MissingVertexStage);
    }

    for input in &program.layout().vertex_inputs {
        let attribute = state
            .vertex_layout
            .attributes
            .iter()
            .find(|a| a.location == input.location)
            .ok_or(PipelineError::MissingVertexAttribute {
                location: input.location,
            })?;
        if attribute.format != input.format {
            return Err(PipelineError::VertexFormatMismatch {
                location: input.location,
                expected: input.format,
                found: attribute.format,
            });
        }
    }
    Ok(())
}
