//! Backend-neutral command lists.
//!
//! The recorder and uploader build a [`CommandList`]; the device encodes it
//! into a driver command buffer at submission time.

use crate::types::{
    BufferSlice, CommandBufferId, DescriptorSetId, Extent2D, ImageId, PipelineLayoutId,
    RawPipelineId,
};
use crate::shader::ShaderStages;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthAttachment {
    pub image: ImageId,
    pub clear_depth: f32,
}

/// Dynamic rendering pass targeting one color image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderingInfo {
    pub color: ImageId,
    pub clear_color: [f32; 4],
    pub depth: Option<DepthAttachment>,
    pub extent: Extent2D,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginRendering(RenderingInfo),
    EndRendering,
    /// Full-extent viewport and scissor.
    SetViewport(Extent2D),
    BindPipeline {
        pipeline: RawPipelineId,
    },
    BindDescriptorSet {
        layout: PipelineLayoutId,
        index: u32,
        set: DescriptorSetId,
    },
    PushConstants {
        layout: PipelineLayoutId,
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    BindVertexBuffer(BufferSlice),
    /// Indices are `u32`.
    BindIndexBuffer(BufferSlice),
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    Draw {
        vertex_count: u32,
        first_vertex: u32,
    },
    CopyBuffer {
        src: BufferSlice,
        dst: BufferSlice,
    },
    /// Transition to transfer-dst, copy, then transition to shader-read.
    CopyBufferToImage {
        src: BufferSlice,
        image: ImageId,
        extent: Extent2D,
    },
    ExecuteSecondary(CommandBufferId),
    /// Transition a color attachment for presentation.
    PrepareForPresent(ImageId),
}

/// An ordered list of commands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub const fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn extend(&mut self, other: &Self) {
        self.commands.extend_from_slice(&other.commands);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Number of draw commands.
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::DrawIndexed { .. } | Command::Draw { .. }))
            .count()
    }

    /// Count commands matching a predicate.
    pub fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| predicate(c)).count()
    }
}

impl FromIterator<Command> for CommandList {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}
