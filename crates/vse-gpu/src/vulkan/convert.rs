//! Engine enums to Vulkan enums.

use crate::memory::UsageClass;
use crate::pipeline::{BlendMode, CompareOp, CullMode, FrontFace, PolygonMode, Topology};
use crate::shader::{BindingKind, ShaderStage, ShaderStages, VertexFormat};
use crate::types::{AddressMode, Filter, Format, ImageUsage, PipelineStage};
use ash::vk;

pub const fn format(format: Format) -> vk::Format {
    match format {
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Swapchain formats the engine can render to.
pub const fn surface_format(format: vk::Format) -> Option<Format> {
    match format {
        vk::Format::B8G8R8A8_SRGB => Some(Format::Bgra8Srgb),
        vk::Format::B8G8R8A8_UNORM => Some(Format::Bgra8Unorm),
        vk::Format::R8G8B8A8_SRGB => Some(Format::Rgba8Srgb),
        vk::Format::R8G8B8A8_UNORM => Some(Format::Rgba8Unorm),
        vk::Format::R16G16B16A16_SFLOAT => Some(Format::Rgba16Float),
        _ => None,
    }
}

pub fn aspect(format: Format) -> vk::ImageAspectFlags {
    match format {
        Format::D32Float => vk::ImageAspectFlags::DEPTH,
        Format::D24UnormS8 => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(ImageUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(ImageUsage::DEPTH_ATTACHMENT) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    flags
}

/// Buffer usage of a region of `class`; `None` for image memory.
pub fn buffer_usage(class: UsageClass) -> Option<vk::BufferUsageFlags> {
    match class {
        UsageClass::Vertex => {
            Some(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        }
        UsageClass::Index => {
            Some(vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        }
        UsageClass::Uniform => Some(vk::BufferUsageFlags::UNIFORM_BUFFER),
        UsageClass::Staging => Some(vk::BufferUsageFlags::TRANSFER_SRC),
        UsageClass::Image => None,
    }
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

pub const fn shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
    }
}

pub const fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
        BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub const fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32 => vk::Format::R32_SFLOAT,
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Uint32 => vk::Format::R32_UINT,
        VertexFormat::Sint32 => vk::Format::R32_SINT,
        VertexFormat::Uint32x4 => vk::Format::R32G32B32A32_UINT,
    }
}

pub const fn topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

pub const fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub const fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub const fn polygon_mode(mode: PolygonMode) -> vk::PolygonMode {
    match mode {
        PolygonMode::Fill => vk::PolygonMode::FILL,
        PolygonMode::Line => vk::PolygonMode::LINE,
    }
}

pub const fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn blend_attachment(mode: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    match mode {
        BlendMode::Opaque => state.blend_enable(false),
        BlendMode::Alpha => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD),
        BlendMode::Additive => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
}

pub const fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub const fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    }
}

pub const fn pipeline_stage(stage: PipelineStage) -> vk::PipelineStageFlags2 {
    match stage {
        PipelineStage::ColorAttachmentOutput => vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        PipelineStage::Transfer => vk::PipelineStageFlags2::TRANSFER,
        PipelineStage::AllCommands => vk::PipelineStageFlags2::ALL_COMMANDS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_formats_round_trip() {
        for f in [
            Format::Bgra8Srgb,
            Format::Bgra8Unorm,
            Format::Rgba8Srgb,
            Format::Rgba8Unorm,
            Format::Rgba16Float,
        ] {
            assert_eq!(surface_format(format(f)), Some(f));
        }
        assert_eq!(surface_format(format(Format::D32Float)), None);
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(aspect(Format::D32Float), vk::ImageAspectFlags::DEPTH);
        assert!(aspect(Format::D24UnormS8).contains(vk::ImageAspectFlags::STENCIL));
        assert_eq!(aspect(Format::Bgra8Srgb), vk::ImageAspectFlags::COLOR);
    }
}
