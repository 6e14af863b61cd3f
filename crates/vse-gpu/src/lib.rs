//! GPU layer for the VSE engine.
//!
//! This crate provides:
//! - Adapter enumeration, capability checks and device context setup
//! - Class-segregated memory arenas and a transient ring pool
//! - Pipeline, descriptor set and sampler caches
//! - The frame scheduler with fence-based backpressure
//! - A Vulkan backend and, behind the `headless` feature, an in-process test device

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod memory;
pub mod pipeline;
pub mod sampler;
pub mod shader;
pub mod types;
pub mod vulkan;

pub use capabilities::{
    AdapterInfo, AdapterType, DeviceLimits, DeviceRequirements, Features, GpuVendor, QueuePlan,
    RejectReason, Rejection,
};
pub use command::{Command, CommandList, DepthAttachment, RenderingInfo};
pub use context::{DeviceConfig, DeviceContext, InitError};
pub use deferred::{Retired, RetirementQueue};
pub use descriptors::{DescriptorCache, DescriptorKey, DescriptorStats, DEFAULT_DESCRIPTOR_LIFETIME};
pub use device::{Backend, DescriptorResource, DescriptorWrite, GpuDevice, GraphicsPipelineDesc};
pub use error::{GpuError, Result};
pub use frame::{FrameConfig, FrameError, FrameHandle, FrameScheduler, PresentTarget, SlotState};
pub use memory::{
    Allocation, Allocator, AllocatorConfig, AllocatorStats, ClassLimits, PoolKind, TransientTag,
    UsageClass,
};
pub use pipeline::{
    BlendMode, CompareOp, CullMode, DepthState, FrontFace, Pipeline, PipelineCache, PipelineError,
    PipelineKey, PipelineSnapshot, PolygonMode, RasterState, RenderState, Topology,
    VertexAttribute, VertexLayout,
};
pub use sampler::SamplerCache;
pub use shader::{
    BindingKind, BindingLayout, DescriptorBinding, IntermediateBinary, LinkError, ProgramId,
    PushConstantRange, SetLayoutDesc, ShaderProgram, ShaderStage, ShaderStages, VertexFormat,
    VertexInput,
};
pub use types::*;
pub use vulkan::{VulkanBackend, VulkanDevice};
