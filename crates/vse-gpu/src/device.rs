//! The seam between the engine and a graphics driver.
//!
//! `VulkanBackend` implements these traits on top of `ash`; the `headless`
//! feature provides an in-process implementation used by tests.

use crate::capabilities::{AdapterInfo, DeviceLimits, Features, QueuePlan};
use crate::command::CommandList;
use crate::error::Result;
use crate::pipeline::RenderState;
use crate::shader::{IntermediateBinary, PushConstantRange, SetLayoutDesc};
use crate::types::{
    AcquiredImage, BufferSlice, CommandBufferId, CommandBufferLevel, DescriptorSetId, FenceId,
    ImageDesc, ImageId, MemoryRequirements, PipelineLayoutId, QueueKind, RawPipelineId, RegionDesc,
    RegionId, SamplerDesc, SamplerId, SemaphoreId, SetLayoutId, Submission, SurfaceHandle,
    SwapchainDesc, SwapchainId, SwapchainInfo,
};
use std::sync::Arc;

/// Enumerates adapters and opens logical devices.
pub trait Backend: Send + Sync {
    /// Adapters visible to the backend; queue family `present` flags refer to `surface`.
    fn enumerate_adapters(&self, surface: Option<SurfaceHandle>) -> Result<Vec<AdapterInfo>>;

    /// Create a logical device with queues for every family in `plan`.
    fn open_device(
        &self,
        adapter: &AdapterInfo,
        plan: &QueuePlan,
        extensions: &[String],
        features: Features,
    ) -> Result<Arc<dyn GpuDevice>>;
}

/// What a descriptor slot is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    UniformBuffer(BufferSlice),
    StorageBuffer(BufferSlice),
    SampledImage(ImageId),
    Sampler(SamplerId),
    CombinedImageSampler(ImageId, SamplerId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

pub struct GraphicsPipelineDesc<'a> {
    pub layout: PipelineLayoutId,
    pub stages: &'a [IntermediateBinary],
    pub state: &'a RenderState,
}

/// A logical device. Every method is callable from any thread.
pub trait GpuDevice: Send + Sync {
    fn limits(&self) -> DeviceLimits;

    // Memory regions
    fn create_region(&self, desc: &RegionDesc) -> Result<RegionId>;
    fn destroy_region(&self, region: RegionId);
    /// Write into a host-visible region.
    fn write_region(&self, region: RegionId, offset: u64, data: &[u8]) -> Result<()>;

    // Images and samplers
    fn image_requirements(&self, desc: &ImageDesc) -> Result<MemoryRequirements>;
    /// Create an image bound to `region` at `offset`.
    fn create_image(&self, desc: &ImageDesc, region: RegionId, offset: u64) -> Result<ImageId>;
    fn destroy_image(&self, image: ImageId);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId>;
    fn destroy_sampler(&self, sampler: SamplerId);

    // Pipelines
    fn create_set_layout(&self, desc: &SetLayoutDesc) -> Result<SetLayoutId>;
    fn destroy_set_layout(&self, layout: SetLayoutId);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[SetLayoutId],
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutId>;
    fn destroy_pipeline_layout(&self, layout: PipelineLayoutId);
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<RawPipelineId>;
    fn destroy_pipeline(&self, pipeline: RawPipelineId);

    // Descriptor sets
    fn allocate_descriptor_set(&self, layout: SetLayoutId) -> Result<DescriptorSetId>;
    fn update_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite])
        -> Result<()>;
    fn free_descriptor_set(&self, set: DescriptorSetId);

    // Command buffers
    fn create_command_buffer(
        &self,
        queue: QueueKind,
        level: CommandBufferLevel,
    ) -> Result<CommandBufferId>;
    fn free_command_buffer(&self, cmd: CommandBufferId);
    /// Reset `cmd` and record `commands` into it.
    fn encode(&self, cmd: CommandBufferId, commands: &CommandList) -> Result<()>;
    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<()>;

    // Synchronization
    fn create_fence(&self, signaled: bool) -> Result<FenceId>;
    fn destroy_fence(&self, fence: FenceId);
    /// Returns `Ok(false)` on timeout.
    fn wait_fence(&self, fence: FenceId, timeout_ns: u64) -> Result<bool>;
    fn reset_fence(&self, fence: FenceId) -> Result<()>;
    fn create_semaphore(&self) -> Result<SemaphoreId>;
    fn destroy_semaphore(&self, semaphore: SemaphoreId);

    // Presentation
    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<SwapchainInfo>;
    fn destroy_swapchain(&self, swapchain: SwapchainId);
    fn acquire_next_image(
        &self,
        swapchain: SwapchainId,
        signal: SemaphoreId,
        timeout_ns: u64,
    ) -> Result<AcquiredImage>;
    /// Queue a present on the present queue; `Ok(true)` when suboptimal.
    fn present(&self, swapchain: SwapchainId, image_index: u32, wait: &[SemaphoreId])
        -> Result<bool>;

    fn wait_idle(&self) -> Result<()>;
}
