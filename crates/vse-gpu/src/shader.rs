//! Compiled shader binaries, reflected binding layouts and linked programs.

use bitflags::bitflags;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const fn flag(self) -> ShaderStages {
        match self {
            Self::Vertex => ShaderStages::VERTEX,
            Self::Fragment => ShaderStages::FRAGMENT,
            Self::Compute => ShaderStages::COMPUTE,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

/// A portable SPIR-V module for one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntermediateBinary {
    pub stage: ShaderStage,
    pub entry_point: String,
    pub words: Arc<[u32]>,
    /// Content hash of the module, stable across runs.
    pub hash: u64,
}

impl IntermediateBinary {
    pub fn new(stage: ShaderStage, entry_point: impl Into<String>, words: Vec<u32>) -> Self {
        let entry_point = entry_point.into();
        let mut hasher = foldhash::fast::FixedState::default().build_hasher();
        stage.hash(&mut hasher);
        entry_point.hash(&mut hasher);
        words.hash(&mut hasher);
        Self {
            stage,
            entry_point,
            hash: hasher.finish(),
            words: words.into(),
        }
    }

    /// Little-endian byte view of the module.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    Sampler,
    CombinedImageSampler,
    StorageImage,
}

/// One reflected descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: BindingKind,
    pub count: u32,
    pub stages: ShaderStages,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
    pub stages: ShaderStages,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Sint32,
    Uint32x4,
}

impl VertexFormat {
    pub const fn size(self) -> u32 {
        match self {
            Self::Float32 | Self::Uint32 | Self::Sint32 => 4,
            Self::Float32x2 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 | Self::Uint32x4 => 16,
        }
    }
}

/// A reflected vertex stage input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexInput {
    pub location: u32,
    pub format: VertexFormat,
}

/// Bindings of one descriptor set, sorted by binding index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SetLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("set {set} binding {binding} is {first:?} in one stage and {second:?} in another")]
    ConflictingBinding {
        set: u32,
        binding: u32,
        first: BindingKind,
        second: BindingKind,
    },
    #[error("program has no stages")]
    Empty,
    #[error("stage {0:?} appears more than once")]
    DuplicateStage(ShaderStage),
}

/// Resource slots, push constants and vertex inputs of one or more stages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BindingLayout {
    /// Sorted by `(set, binding)`.
    pub bindings: Vec<DescriptorBinding>,
    pub push_constants: Vec<PushConstantRange>,
    /// Sorted by location; only the vertex stage contributes.
    pub vertex_inputs: Vec<VertexInput>,
}

impl BindingLayout {
    /// Merge another stage's layout into this one.
    pub fn merge(&mut self, other: &Self) -> Result<(), LinkError> {
        for incoming in &other.bindings {
            match self
                .bindings
                .iter_mut()
                .find(|b| b.set == incoming.set && b.binding == incoming.binding)
            {
                Some(existing) if existing.kind != incoming.kind => {
                    return Err(LinkError::ConflictingBinding {
                        set: incoming.set,
                        binding: incoming.binding,
                        first: existing.kind,
                        second: incoming.kind,
                    });
                }
                Some(existing) => {
                    existing.stages |= incoming.stages;
                    existing.count = existing.count.max(incoming.count);
                }
                None => self.bindings.push(*incoming),
            }
        }
        self.bindings.sort_by_key(|b| (b.set, b.binding));

        for range in &other.push_constants {
            match self
                .push_constants
                .iter_mut()
                .find(|r| r.offset == range.offset && r.size == range.size)
            {
                Some(existing) => existing.stages |= range.stages,
                None => self.push_constants.push(*range),
            }
        }

        for input in &other.vertex_inputs {
            if !self.vertex_inputs.contains(input) {
                self.vertex_inputs.push(*input);
            }
        }
        self.vertex_inputs.sort_by_key(|i| i.location);
        Ok(())
    }

    /// Number of descriptor sets the pipeline layout must declare.
    pub fn set_count(&self) -> u32 {
        self.bindings.iter().map(|b| b.set + 1).max().unwrap_or(0)
    }

    /// Layout of one descriptor set; empty when the set has no bindings.
    pub fn set_layout(&self, set: u32) -> SetLayoutDesc {
        SetLayoutDesc {
            bindings: self
                .bindings
                .iter()
                .filter(|b| b.set == set)
                .copied()
                .collect(),
        }
    }
}

/// Identity of a linked stage set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u64);

/// Linked shader stages with their merged binding layout.
#[derive(Clone, Debug)]
pub struct ShaderProgram {
    id: ProgramId,
    stages: Vec<IntermediateBinary>,
    layout: BindingLayout,
}

impl ShaderProgram {
    /// Link reflected stages into a program.
    pub fn link(stages: Vec<(IntermediateBinary, BindingLayout)>) -> Result<Self, LinkError> {
        if stages.is_empty() {
            return Err(LinkError::Empty);
        }

        let mut layout = BindingLayout::default();
        let mut binaries = Vec::with_capacity(stages.len());
        for (binary, stage_layout) in stages {
            if binaries
                .iter()
                .any(|b: &IntermediateBinary| b.stage == binary.stage)
            {
                return Err(LinkError::DuplicateStage(binary.stage));
            }
            layout.merge(&stage_layout)?;
            binaries.push(binary);
        }
        binaries.sort_by_key(|b| b.stage);

        let mut hasher = foldhash::fast::FixedState::default().build_hasher();
        for binary in &binaries {
            binary.hash.hash(&mut hasher);
        }

        Ok(Self {
            id: ProgramId(hasher.finish()),
            stages: binaries,
            layout,
        })
    }

    pub const fn id(&self) -> ProgramId {
        self.id
    }

    pub fn stages(&self) -> &[IntermediateBinary] {
        &self.stages
    }

    pub const fn layout(&self) -> &BindingLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(set: u32, binding: u32, kind: BindingKind, stages: ShaderStages) -> DescriptorBinding {
        DescriptorBinding {
            set,
            binding,
            kind,
            count: 1,
            stages,
        }
    }

    fn stage(stage: ShaderStage, layout: BindingLayout) -> (IntermediateBinary, BindingLayout) {
        (IntermediateBinary::new(stage, "main", vec![0x0723_0203, stage as u32]), layout)
    }

    #[test]
    fn merge_ors_stage_masks() {
        let vertex = BindingLayout {
            bindings: vec![binding(0, 0, BindingKind::UniformBuffer, ShaderStages::VERTEX)],
            vertex_inputs: vec![VertexInput {
                location: 0,
                format: VertexFormat::Float32x3,
            }],
            ..Default::default()
        };
        let fragment = BindingLayout {
            bindings: vec![
                binding(0, 0, BindingKind::UniformBuffer, ShaderStages::FRAGMENT),
                binding(1, 1, BindingKind::SampledImage, ShaderStages::FRAGMENT),
            ],
            ..Default::default()
        };

        let program = ShaderProgram::link(vec![
            stage(ShaderStage::Fragment, fragment),
            stage(ShaderStage::Vertex, vertex),
        ])
        .unwrap();
        let layout = program.layout();
        assert_eq!(layout.set_count(), 2);
        assert_eq!(
            layout.bindings[0].stages,
            ShaderStages::VERTEX | ShaderStages::FRAGMENT
        );
        assert_eq!(layout.set_layout(1).bindings.len(), 1);
        assert_eq!(program.stages()[0].stage, ShaderStage::Vertex);
    }

    #[test]
    fn conflicting_kinds_fail_to_link() {
        let a = BindingLayout {
            bindings: vec![binding(0, 0, BindingKind::UniformBuffer, ShaderStages::VERTEX)],
            ..Default::default()
        };
        let b = BindingLayout {
            bindings: vec![binding(0, 0, BindingKind::StorageBuffer, ShaderStages::FRAGMENT)],
            ..Default::default()
        };
        let err = ShaderProgram::link(vec![
            stage(ShaderStage::Vertex, a),
            stage(ShaderStage::Fragment, b),
        ])
        .unwrap_err();
        assert!(matches!(err, LinkError::ConflictingBinding { set: 0, binding: 0, .. }));
    }

    #[test]
    fn program_id_is_order_independent() {
        let a = ShaderProgram::link(vec![
            stage(ShaderStage::Vertex, BindingLayout::default()),
            stage(ShaderStage::Fragment, BindingLayout::default()),
        ])
        .unwrap();
        let b = ShaderProgram::link(vec![
            stage(ShaderStage::Fragment, BindingLayout::default()),
            stage(ShaderStage::Vertex, BindingLayout::default()),
        ])
        .unwrap();
        assert_eq!(a.id(), b.id());
    }
}
