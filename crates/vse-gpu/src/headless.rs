//! In-process implementation of the device seam.
//!
//! `HeadlessDevice` keeps every object in host memory and logs what happens to
//! it in an event log ordered by a logical clock. Submissions complete
//! immediately or when a test calls [`HeadlessDevice::complete_next`];
//! buffer copies are executed on completion so uploaded bytes can be read back.

use crate::capabilities::{
    AdapterInfo, AdapterType, DeviceLimits, Features, GpuVendor, QueueFamilyInfo, QueuePlan,
};
use crate::command::{Command, CommandList};
use crate::device::{Backend, DescriptorWrite, GpuDevice, GraphicsPipelineDesc};
use crate::error::{GpuError, Result};
use crate::frame::PresentTarget;
use crate::memory::UsageClass;
use crate::shader::{PushConstantRange, SetLayoutDesc};
use crate::types::{
    AcquiredImage, CommandBufferId, CommandBufferLevel, DescriptorSetId, Extent2D, FenceId,
    Format, ImageDesc, ImageId, MemoryRequirements, PipelineLayoutId, QueueKind, RawPipelineId,
    RegionDesc, RegionId, SamplerDesc, SamplerId, SemaphoreId, SetLayoutId, Submission,
    SurfaceHandle, SwapchainDesc, SwapchainId, SwapchainInfo,
};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// When submitted work completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionMode {
    /// Work completes during `submit`.
    #[default]
    Immediate,
    /// Work completes when the test calls `complete_next` or `complete_all`.
    Manual,
}

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub completion: CompletionMode,
    /// Total bytes of regions the device may hold before `OutOfDeviceMemory`.
    pub memory_budget: Option<u64>,
    /// Live descriptor sets before `DescriptorPoolExhausted`.
    pub descriptor_capacity: Option<usize>,
    pub swapchain_images: u32,
    pub limits: DeviceLimits,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            completion: CompletionMode::Immediate,
            memory_budget: None,
            descriptor_capacity: None,
            swapchain_images: 3,
            limits: DeviceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadlessEvent {
    RegionCreated {
        region: RegionId,
        class: UsageClass,
        size: u64,
    },
    RegionDestroyed(RegionId),
    ImageCreated(ImageId),
    ImageDestroyed(ImageId),
    PipelineCreated(RawPipelineId),
    DescriptorSetAllocated(DescriptorSetId),
    DescriptorSetFreed(DescriptorSetId),
    Encoded {
        command_buffer: CommandBufferId,
        commands: usize,
    },
    Submitted {
        queue: QueueKind,
        command_buffers: Vec<CommandBufferId>,
        fence: Option<FenceId>,
        draws: usize,
    },
    FenceSignaled(FenceId),
    FenceWaitStarted(FenceId),
    FenceWaitFinished(FenceId),
    FenceReset(FenceId),
    SwapchainCreated {
        swapchain: SwapchainId,
        extent: Extent2D,
    },
    SwapchainDestroyed(SwapchainId),
    ImageAcquired {
        swapchain: SwapchainId,
        index: u32,
    },
    Presented {
        swapchain: SwapchainId,
        index: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    /// Logical clock value; strictly increasing.
    pub seq: u64,
    pub event: HeadlessEvent,
}

struct Region {
    class: UsageClass,
    bytes: Vec<u8>,
}

struct CommandBufferState {
    commands: CommandList,
    pending: bool,
}

struct PendingSubmission {
    command_buffers: Vec<CommandBufferId>,
    fence: Option<FenceId>,
}

struct Swapchain {
    images: Vec<ImageId>,
    next_image: usize,
}

#[derive(Default)]
struct State {
    regions: HashMap<RegionId, Region>,
    memory_used: u64,
    images: HashMap<ImageId, ImageDesc>,
    samplers: HashSet<SamplerId>,
    set_layouts: HashMap<SetLayoutId, SetLayoutDesc>,
    pipeline_layouts: HashSet<PipelineLayoutId>,
    pipelines: HashSet<RawPipelineId>,
    pipelines_created: usize,
    descriptor_sets: HashMap<DescriptorSetId, Vec<DescriptorWrite>>,
    command_buffers: HashMap<CommandBufferId, CommandBufferState>,
    fences: HashMap<FenceId, bool>,
    /// Binary semaphores and whether each is signaled.
    semaphores: HashMap<SemaphoreId, bool>,
    swapchains: HashMap<SwapchainId, Swapchain>,
    pending: VecDeque<PendingSubmission>,
    /// Commands of each submission, captured when it was submitted.
    submitted: Vec<(QueueKind, CommandList)>,
    fence_waiters: usize,
    acquire_errors: VecDeque<GpuError>,
    submit_errors: VecDeque<GpuError>,
    present_errors: VecDeque<GpuError>,
    device_lost: bool,
    events: Vec<LoggedEvent>,
    violations: Vec<String>,
    clock: u64,
}

impl State {
    fn log(&mut self, event: HeadlessEvent) {
        self.clock += 1;
        self.events.push(LoggedEvent {
            seq: self.clock,
            event,
        });
    }

    fn violation(&mut self, message: String) -> GpuError {
        tracing::error!("Headless device: {message}");
        self.violations.push(message.clone());
        GpuError::InvalidState(message)
    }

    /// Execute the front pending submission.
    fn complete_front(&mut self) -> bool {
        let Some(submission) = self.pending.pop_front() else {
            return false;
        };
        for cmd in &submission.command_buffers {
            let copies: Vec<Command> = match self.command_buffers.get_mut(cmd) {
                Some(state) => {
                    state.pending = false;
                    state
                        .commands
                        .commands()
                        .iter()
                        .filter(|c| matches!(c, Command::CopyBuffer { .. }))
                        .cloned()
                        .collect()
                }
                None => Vec::new(),
            };
            for copy in copies {
                if let Command::CopyBuffer { src, dst } = copy {
                    self.copy(src, dst);
                }
            }
        }
        if let Some(fence) = submission.fence {
            self.fences.insert(fence, true);
            self.log(HeadlessEvent::FenceSignaled(fence));
        }
        true
    }

    fn copy(&mut self, src: crate::types::BufferSlice, dst: crate::types::BufferSlice) {
        let len = src.size.min(dst.size) as usize;
        let data = match self.regions.get(&src.region) {
            Some(region) => {
                let start = src.offset as usize;
                region.bytes.get(start..start + len).map(<[u8]>::to_vec)
            }
            None => None,
        };
        let Some(data) = data else {
            let _ = self.violation(format!("copy from invalid source range {src:?}"));
            return;
        };
        match self.regions.get_mut(&dst.region) {
            Some(region) if (dst.offset as usize + len) <= region.bytes.len() => {
                let start = dst.offset as usize;
                region.bytes[start..start + len].copy_from_slice(&data);
            }
            _ => {
                let _ = self.violation(format!("copy to invalid destination range {dst:?}"));
            }
        }
    }
}

/// A device that runs no GPU work.
pub struct HeadlessDevice {
    config: HeadlessConfig,
    state: Mutex<State>,
    changed: Condvar,
    next_id: AtomicU64,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Immediate completion, unlimited memory.
    pub fn new_default() -> Arc<Self> {
        Self::new(HeadlessConfig::default())
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(state: &State) -> Result<()> {
        if state.device_lost {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Complete the oldest pending submission. Returns false when nothing is pending.
    pub fn complete_next(&self) -> bool {
        let completed = self.state.lock().complete_front();
        self.changed.notify_all();
        completed
    }

    /// Complete every pending submission.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut completed = 0;
        while state.complete_front() {
            completed += 1;
        }
        drop(state);
        self.changed.notify_all();
        completed
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Block until some thread waits on a fence, or `timeout` elapses.
    pub fn wait_for_fence_waiter(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.fence_waiters == 0 {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.fence_waiters > 0;
            }
        }
        true
    }

    /// Fail the next acquire with `error`.
    pub fn inject_acquire_error(&self, error: GpuError) {
        self.state.lock().acquire_errors.push_back(error);
    }

    /// Fail the next submit with `error`.
    pub fn inject_submit_error(&self, error: GpuError) {
        self.state.lock().submit_errors.push_back(error);
    }

    /// Fail the next present with `error`.
    pub fn inject_present_error(&self, error: GpuError) {
        self.state.lock().present_errors.push_back(error);
    }

    pub fn inject_device_lost(&self) {
        self.state.lock().device_lost = true;
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<LoggedEvent> {
        self.state.lock().events.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e.event, HeadlessEvent::Submitted { .. }))
            .count()
    }

    /// Times `fence` was signaled.
    pub fn fence_signal_count(&self, fence: FenceId) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.event == HeadlessEvent::FenceSignaled(fence))
            .count()
    }

    /// Usage-rule violations observed so far, such as re-recording a pending buffer.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn read_region(&self, region: RegionId, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        state
            .regions
            .get(&region)
            .and_then(|r| {
                let start = offset as usize;
                r.bytes.get(start..start + len).map(<[u8]>::to_vec)
            })
            .unwrap_or_default()
    }

    pub fn live_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    pub fn live_regions_of(&self, class: UsageClass) -> usize {
        self.state
            .lock()
            .regions
            .values()
            .filter(|r| r.class == class)
            .count()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.state.lock().descriptor_sets.len()
    }

    /// Resources bound to a live descriptor set.
    pub fn descriptor_writes(&self, set: DescriptorSetId) -> Option<Vec<DescriptorWrite>> {
        self.state.lock().descriptor_sets.get(&set).cloned()
    }

    pub fn pipelines_created(&self) -> usize {
        self.state.lock().pipelines_created
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    /// Last commands encoded into `cmd`.
    pub fn encoded_commands(&self, cmd: CommandBufferId) -> Option<CommandList> {
        self.state
            .lock()
            .command_buffers
            .get(&cmd)
            .map(|c| c.commands.clone())
    }

    /// Commands of every submission in order, as they were when submitted.
    pub fn submitted_commands(&self) -> Vec<(QueueKind, CommandList)> {
        self.state.lock().submitted.clone()
    }
}

impl GpuDevice for HeadlessDevice {
    fn limits(&self) -> DeviceLimits {
        self.config.limits
    }

    fn create_region(&self, desc: &RegionDesc) -> Result<RegionId> {
        let mut state = self.state.lock();
        if let Some(budget) = self.config.memory_budget {
            if state.memory_used + desc.size > budget {
                return Err(GpuError::OutOfDeviceMemory);
            }
        }
        let size = usize::try_from(desc.size).map_err(|_| GpuError::OutOfDeviceMemory)?;
        let region = RegionId(self.next());
        state.memory_used += desc.size;
        state.regions.insert(
            region,
            Region {
                class: desc.class,
                bytes: vec![0; size],
            },
        );
        state.log(HeadlessEvent::RegionCreated {
            region,
            class: desc.class,
            size: desc.size,
        });
        Ok(region)
    }

    fn destroy_region(&self, region: RegionId) {
        let mut state = self.state.lock();
        if let Some(r) = state.regions.remove(&region) {
            state.memory_used -= r.bytes.len() as u64;
            state.log(HeadlessEvent::RegionDestroyed(region));
        }
    }

    fn write_region(&self, region: RegionId, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let r = state
            .regions
            .get_mut(&region)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("{region:?}")))?;
        if !r.class.host_visible() {
            return Err(GpuError::InvalidState(format!(
                "write to {:?} region",
                r.class
            )));
        }
        let start = offset as usize;
        let end = start + data.len();
        let Some(target) = r.bytes.get_mut(start..end) else {
            return Err(GpuError::InvalidState("write out of region bounds".to_string()));
        };
        target.copy_from_slice(data);
        Ok(())
    }

    fn image_requirements(&self, desc: &ImageDesc) -> Result<MemoryRequirements> {
        let size = u64::from(desc.extent.width)
            * u64::from(desc.extent.height)
            * u64::from(desc.format.bytes_per_pixel());
        Ok(MemoryRequirements {
            size: size.max(1),
            alignment: 1024,
        })
    }

    fn create_image(&self, desc: &ImageDesc, region: RegionId, offset: u64) -> Result<ImageId> {
        let requirements = self.image_requirements(desc)?;
        let mut state = self.state.lock();
        let Some(region_size) = state.regions.get(&region).map(|r| r.bytes.len() as u64) else {
            return Err(GpuError::ResourceNotFound(format!("{region:?}")));
        };
        if offset + requirements.size > region_size {
            let message = format!("image bound past the end of {region:?}");
            return Err(state.violation(message));
        }
        let image = ImageId(self.next());
        state.images.insert(image, *desc);
        state.log(HeadlessEvent::ImageCreated(image));
        Ok(image)
    }

    fn destroy_image(&self, image: ImageId) {
        let mut state = self.state.lock();
        if state.images.remove(&image).is_some() {
            state.log(HeadlessEvent::ImageDestroyed(image));
        }
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<SamplerId> {
        let sampler = SamplerId(self.next());
        self.state.lock().samplers.insert(sampler);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        self.state.lock().samplers.remove(&sampler);
    }

    fn create_set_layout(&self, desc: &SetLayoutDesc) -> Result<SetLayoutId> {
        let layout = SetLayoutId(self.next());
        self.state.lock().set_layouts.insert(layout, desc.clone());
        Ok(layout)
    }

    fn destroy_set_layout(&self, layout: SetLayoutId) {
        self.state.lock().set_layouts.remove(&layout);
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[SetLayoutId],
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutId> {
        let mut state = self.state.lock();
        if let Some(missing) = set_layouts.iter().find(|l| !state.set_layouts.contains_key(*l)) {
            return Err(GpuError::ResourceNotFound(format!("{missing:?}")));
        }
        let total: u32 = push_constants.iter().map(|r| r.offset + r.size).max().unwrap_or(0);
        if total > self.config.limits.max_push_constants_size {
            return Err(GpuError::InvalidState(format!(
                "push constants of {total} bytes exceed the device limit"
            )));
        }
        let layout = PipelineLayoutId(self.next());
        state.pipeline_layouts.insert(layout);
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutId) {
        self.state.lock().pipeline_layouts.remove(&layout);
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<RawPipelineId> {
        let mut state = self.state.lock();
        if !state.pipeline_layouts.contains(&desc.layout) {
            return Err(GpuError::ResourceNotFound(format!("{:?}", desc.layout)));
        }
        if desc.stages.iter().any(|s| s.words.first() != Some(&0x0723_0203)) {
            return Err(GpuError::ShaderModule("missing SPIR-V magic".to_string()));
        }
        let pipeline = RawPipelineId(self.next());
        state.pipelines.insert(pipeline);
        state.pipelines_created += 1;
        state.log(HeadlessEvent::PipelineCreated(pipeline));
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: RawPipelineId) {
        self.state.lock().pipelines.remove(&pipeline);
    }

    fn allocate_descriptor_set(&self, layout: SetLayoutId) -> Result<DescriptorSetId> {
        let mut state = self.state.lock();
        if !state.set_layouts.contains_key(&layout) {
            return Err(GpuError::ResourceNotFound(format!("{layout:?}")));
        }
        if let Some(capacity) = self.config.descriptor_capacity {
            if state.descriptor_sets.len() >= capacity {
                return Err(GpuError::DescriptorPoolExhausted);
            }
        }
        let set = DescriptorSetId(self.next());
        state.descriptor_sets.insert(set, Vec::new());
        state.log(HeadlessEvent::DescriptorSetAllocated(set));
        Ok(set)
    }

    fn update_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite]) -> Result<()> {
        let mut state = self.state.lock();
        let bound = state
            .descriptor_sets
            .get_mut(&set)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("{set:?}")))?;
        for write in writes {
            bound.retain(|w| w.binding != write.binding);
            bound.push(*write);
        }
        Ok(())
    }

    fn free_descriptor_set(&self, set: DescriptorSetId) {
        let mut state = self.state.lock();
        if state.descriptor_sets.remove(&set).is_some() {
            state.log(HeadlessEvent::DescriptorSetFreed(set));
        }
    }

    fn create_command_buffer(
        &self,
        _queue: QueueKind,
        _level: CommandBufferLevel,
    ) -> Result<CommandBufferId> {
        let cmd = CommandBufferId(self.next());
        self.state.lock().command_buffers.insert(
            cmd,
            CommandBufferState {
                commands: CommandList::new(),
                pending: false,
            },
        );
        Ok(cmd)
    }

    fn free_command_buffer(&self, cmd: CommandBufferId) {
        let mut state = self.state.lock();
        if state.command_buffers.get(&cmd).is_some_and(|c| c.pending) && !state.device_lost {
            let _ = state.violation(format!("{cmd:?} freed while pending"));
        }
        state.command_buffers.remove(&cmd);
    }

    fn encode(&self, cmd: CommandBufferId, commands: &CommandList) -> Result<()> {
        let mut state = self.state.lock();
        let Some(pending) = state.command_buffers.get(&cmd).map(|b| b.pending) else {
            return Err(GpuError::ResourceNotFound(format!("{cmd:?}")));
        };
        if pending {
            return Err(state.violation(format!("{cmd:?} re-recorded while pending")));
        }
        if let Some(buffer) = state.command_buffers.get_mut(&cmd) {
            buffer.commands = commands.clone();
        }
        state.log(HeadlessEvent::Encoded {
            command_buffer: cmd,
            commands: commands.len(),
        });
        Ok(())
    }

    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }

        let mut draws = 0;
        for cmd in &submission.command_buffers {
            let Some(buffer) = state.command_buffers.get(cmd) else {
                return Err(GpuError::ResourceNotFound(format!("{cmd:?}")));
            };
            let pending = buffer.pending;
            draws += buffer.commands.draw_count();
            if pending {
                return Err(state.violation(format!("{cmd:?} submitted while pending")));
            }
        }
        if let Some(fence) = submission.fence {
            match state.fences.get(&fence).copied() {
                Some(true) => {
                    return Err(state.violation(format!("{fence:?} submitted while signaled")));
                }
                Some(false) => {}
                None => return Err(GpuError::ResourceNotFound(format!("{fence:?}"))),
            }
        }

        let mut snapshot = CommandList::new();
        for cmd in &submission.command_buffers {
            if let Some(buffer) = state.command_buffers.get_mut(cmd) {
                buffer.pending = true;
                snapshot.extend(&buffer.commands);
            }
        }
        for wait in &submission.wait {
            if let Some(signaled) = state.semaphores.get_mut(&wait.semaphore) {
                *signaled = false;
            }
        }
        state.submitted.push((queue, snapshot));
        state.log(HeadlessEvent::Submitted {
            queue,
            command_buffers: submission.command_buffers.clone(),
            fence: submission.fence,
            draws,
        });
        state.pending.push_back(PendingSubmission {
            command_buffers: submission.command_buffers.clone(),
            fence: submission.fence,
        });

        if self.config.completion == CompletionMode::Immediate {
            state.complete_front();
            drop(state);
            self.changed.notify_all();
        }
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceId> {
        let fence = FenceId(self.next());
        self.state.lock().fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(&fence);
    }

    fn wait_fence(&self, fence: FenceId, timeout_ns: u64) -> Result<bool> {
        let deadline = (timeout_ns != u64::MAX)
            .then(|| Instant::now() + Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        state.log(HeadlessEvent::FenceWaitStarted(fence));
        state.fence_waiters += 1;
        self.changed.notify_all();

        let result = loop {
            if state.device_lost {
                break Err(GpuError::DeviceLost);
            }
            match state.fences.get(&fence) {
                Some(true) => break Ok(true),
                Some(false) => {}
                None => break Err(GpuError::ResourceNotFound(format!("{fence:?}"))),
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        break Ok(state.fences.get(&fence).copied().unwrap_or(false));
                    }
                }
                None => self.changed.wait(&mut state),
            }
        };

        state.fence_waiters -= 1;
        state.log(HeadlessEvent::FenceWaitFinished(fence));
        result
    }

    fn reset_fence(&self, fence: FenceId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(signaled) = state.fences.get_mut(&fence) else {
            return Err(GpuError::ResourceNotFound(format!("{fence:?}")));
        };
        *signaled = false;
        state.log(HeadlessEvent::FenceReset(fence));
        Ok(())
    }

    fn create_semaphore(&self) -> Result<SemaphoreId> {
        let semaphore = SemaphoreId(self.next());
        self.state.lock().semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<SwapchainInfo> {
        if desc.extent.is_zero() {
            return Err(GpuError::InvalidState("zero-sized swapchain".to_string()));
        }
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        let id = SwapchainId(self.next());
        let images: Vec<ImageId> = (0..self.config.swapchain_images)
            .map(|_| ImageId(self.next()))
            .collect();
        state.swapchains.insert(
            id,
            Swapchain {
                images: images.clone(),
                next_image: 0,
            },
        );
        state.log(HeadlessEvent::SwapchainCreated {
            swapchain: id,
            extent: desc.extent,
        });
        Ok(SwapchainInfo {
            id,
            format: Format::Bgra8Srgb,
            extent: desc.extent,
            images,
        })
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) {
        let mut state = self.state.lock();
        if state.swapchains.remove(&swapchain).is_some() {
            state.log(HeadlessEvent::SwapchainDestroyed(swapchain));
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainId,
        signal: SemaphoreId,
        _timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        if let Some(error) = state.acquire_errors.pop_front() {
            return Err(error);
        }
        let Some(sc) = state.swapchains.get_mut(&swapchain) else {
            return Err(GpuError::ResourceNotFound(format!("{swapchain:?}")));
        };
        // Images come back in present order.
        let index = (sc.next_image % sc.images.len()) as u32;
        sc.next_image += 1;
        if state.semaphores.get(&signal) == Some(&true) {
            let _ = state.violation(format!("acquire signals {signal:?} which is still signaled"));
        }
        if let Some(signaled) = state.semaphores.get_mut(&signal) {
            *signaled = true;
        }
        state.log(HeadlessEvent::ImageAcquired { swapchain, index });
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(&self, swapchain: SwapchainId, image_index: u32, _wait: &[SemaphoreId]) -> Result<bool> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        if let Some(error) = state.present_errors.pop_front() {
            return Err(error);
        }
        if !state.swapchains.contains_key(&swapchain) {
            return Err(GpuError::ResourceNotFound(format!("{swapchain:?}")));
        }
        state.log(HeadlessEvent::Presented {
            swapchain,
            index: image_index,
        });
        Ok(false)
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_lost(&state)?;
        // An idle wait drains the queue even in manual mode.
        while state.complete_front() {}
        drop(state);
        self.changed.notify_all();
        Ok(())
    }
}

/// Backend producing [`HeadlessDevice`]s.
pub struct HeadlessBackend {
    config: HeadlessConfig,
    adapters: Vec<AdapterInfo>,
    device: Mutex<Option<Arc<HeadlessDevice>>>,
}

impl HeadlessBackend {
    pub fn new(config: HeadlessConfig) -> Self {
        Self::with_adapters(config, vec![Self::default_adapter()])
    }

    pub fn with_adapters(config: HeadlessConfig, adapters: Vec<AdapterInfo>) -> Self {
        Self {
            config,
            adapters,
            device: Mutex::new(None),
        }
    }

    /// A discrete adapter with a graphics+present family and a dedicated transfer family.
    pub fn default_adapter() -> AdapterInfo {
        AdapterInfo {
            index: 0,
            name: "Headless Adapter".to_string(),
            vendor: GpuVendor::Other(0),
            adapter_type: AdapterType::Discrete,
            api_version: (1, 3),
            extensions: vec!["VK_KHR_swapchain".to_string()],
            features: Features::all(),
            device_local_bytes: 8 * 1024 * 1024 * 1024,
            queue_families: vec![
                QueueFamilyInfo {
                    index: 0,
                    graphics: true,
                    compute: true,
                    transfer: true,
                    present: true,
                },
                QueueFamilyInfo {
                    index: 1,
                    graphics: false,
                    compute: false,
                    transfer: true,
                    present: false,
                },
            ],
            limits: DeviceLimits::default(),
        }
    }

    /// The most recently opened device.
    pub fn device(&self) -> Option<Arc<HeadlessDevice>> {
        self.device.lock().clone()
    }
}

impl Backend for HeadlessBackend {
    fn enumerate_adapters(&self, _surface: Option<SurfaceHandle>) -> Result<Vec<AdapterInfo>> {
        Ok(self.adapters.clone())
    }

    fn open_device(
        &self,
        adapter: &AdapterInfo,
        _plan: &QueuePlan,
        _extensions: &[String],
        _features: Features,
    ) -> Result<Arc<dyn GpuDevice>> {
        let config = HeadlessConfig {
            limits: adapter.limits,
            ..self.config.clone()
        };
        let device = HeadlessDevice::new(config);
        *self.device.lock() = Some(device.clone());
        Ok(device)
    }
}

/// A surface whose size tests control.
pub struct HeadlessSurface {
    handle: SurfaceHandle,
    extent: Mutex<Extent2D>,
    callbacks: Mutex<Vec<Box<dyn Fn(Extent2D) + Send + Sync>>>,
}

impl HeadlessSurface {
    pub fn new(extent: Extent2D) -> Arc<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            handle: SurfaceHandle(NEXT.fetch_add(1, Ordering::Relaxed)),
            extent: Mutex::new(extent),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub const fn handle(&self) -> SurfaceHandle {
        self.handle
    }

    /// Change the size and notify registered callbacks.
    pub fn resize(&self, extent: Extent2D) {
        *self.extent.lock() = extent;
        for callback in self.callbacks.lock().iter() {
            callback(extent);
        }
    }
}

impl PresentTarget for HeadlessSurface {
    fn surface(&self) -> SurfaceHandle {
        self.handle
    }

    fn framebuffer_extent(&self) -> Extent2D {
        *self.extent.lock()
    }

    fn register_resize_callback(&self, callback: Box<dyn Fn(Extent2D) + Send + Sync>) {
        self.callbacks.lock().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferSlice;

    #[test]
    fn manual_completion_executes_copies() {
        let device = HeadlessDevice::new(HeadlessConfig {
            completion: CompletionMode::Manual,
            ..Default::default()
        });
        let staging = device
            .create_region(&RegionDesc {
                class: UsageClass::Staging,
                size: 16,
            })
            .unwrap();
        let vertex = device
            .create_region(&RegionDesc {
                class: UsageClass::Vertex,
                size: 16,
            })
            .unwrap();
        device.write_region(staging, 0, &[1, 2, 3, 4]).unwrap();

        let cmd = device
            .create_command_buffer(QueueKind::Transfer, CommandBufferLevel::Primary)
            .unwrap();
        let fence = device.create_fence(false).unwrap();
        let copy: CommandList = [Command::CopyBuffer {
            src: BufferSlice {
                region: staging,
                offset: 0,
                size: 4,
            },
            dst: BufferSlice {
                region: vertex,
                offset: 8,
                size: 4,
            },
        }]
        .into_iter()
        .collect();
        device.encode(cmd, &copy).unwrap();
        device
            .submit(
                QueueKind::Transfer,
                &Submission {
                    command_buffers: vec![cmd],
                    fence: Some(fence),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(!device.wait_fence(fence, 0).unwrap());
        assert!(device.encode(cmd, &copy).is_err());
        assert_eq!(device.violations().len(), 1);

        assert!(device.complete_next());
        assert!(device.wait_fence(fence, 0).unwrap());
        assert_eq!(device.read_region(vertex, 8, 4), vec![1, 2, 3, 4]);
        assert_eq!(device.fence_signal_count(fence), 1);
    }

    #[test]
    fn submitted_commands_outlive_their_command_buffer() {
        let device = HeadlessDevice::new_default();
        let cmd = device
            .create_command_buffer(QueueKind::Graphics, CommandBufferLevel::Primary)
            .unwrap();
        let commands: CommandList = [Command::Draw {
            vertex_count: 3,
            first_vertex: 0,
        }]
        .into_iter()
        .collect();
        device.encode(cmd, &commands).unwrap();
        device
            .submit(
                QueueKind::Graphics,
                &Submission {
                    command_buffers: vec![cmd],
                    ..Default::default()
                },
            )
            .unwrap();
        device.free_command_buffer(cmd);

        let submitted = device.submitted_commands();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, QueueKind::Graphics);
        assert_eq!(submitted[0].1.draw_count(), 1);
    }

    #[test]
    fn memory_budget_refuses_regions() {
        let device = HeadlessDevice::new(HeadlessConfig {
            memory_budget: Some(1024),
            ..Default::default()
        });
        let desc = RegionDesc {
            class: UsageClass::Vertex,
            size: 768,
        };
        let region = device.create_region(&desc).unwrap();
        assert_eq!(device.create_region(&desc), Err(GpuError::OutOfDeviceMemory));
        device.destroy_region(region);
        assert!(device.create_region(&desc).is_ok());
    }

    #[test]
    fn swapchain_images_rotate() {
        let device = HeadlessDevice::new_default();
        let info = device
            .create_swapchain(&SwapchainDesc {
                surface: SurfaceHandle(1),
                extent: Extent2D::new(4, 4),
                vsync: true,
                old: None,
            })
            .unwrap();
        let indices: Vec<u32> = (0..4)
            .map(|_| {
                let semaphore = device.create_semaphore().unwrap();
                device.acquire_next_image(info.id, semaphore, u64::MAX).unwrap().index
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
        assert!(device.violations().is_empty());
    }
}
