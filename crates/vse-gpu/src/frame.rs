//! Frame scheduling with multiple frames in flight.
//!
//! Each of the N frame slots owns a command buffer, a fence and an
//! image-available semaphore. Beginning a frame on a slot that was submitted
//! waits on its fence first, so the CPU runs at most N frames ahead of the GPU
//! and a slot is never re-recorded while the GPU may still execute it.

use crate::command::CommandList;
use crate::context::DeviceContext;
use crate::device::GpuDevice;
use crate::error::GpuError;
use crate::memory::{Allocator, TransientTag};
use crate::types::{
    CommandBufferId, CommandBufferLevel, Extent2D, FenceId, Format, ImageId, PipelineStage,
    QueueKind, SemaphoreId, SemaphoreWait, Submission, SurfaceHandle, SwapchainDesc,
    SwapchainInfo,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Default number of frames in flight.
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 2;

/// The surface collaborator a scheduler presents to.
pub trait PresentTarget: Send + Sync {
    fn surface(&self) -> SurfaceHandle;
    /// Current drawable size in pixels; zero while minimized.
    fn framebuffer_extent(&self) -> Extent2D;
    fn register_resize_callback(&self, callback: Box<dyn Fn(Extent2D) + Send + Sync>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    pub frames_in_flight: u32,
    pub vsync: bool,
    pub fence_timeout_ns: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            vsync: true,
            fence_timeout_ns: u64::MAX,
        }
    }
}

impl FrameConfig {
    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames_in_flight: u32) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    #[must_use]
    pub const fn with_fence_timeout_ns(mut self, timeout: u64) -> Self {
        self.fence_timeout_ns = timeout;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The swapchain had to be rebuilt; retry on the next frame.
    #[error("surface lost or out of date")]
    SurfaceLost,
    /// Terminal: the device context must be re-created.
    #[error("device lost")]
    DeviceLost,
    #[error("timed out waiting for frame fence")]
    Timeout,
    #[error("invalid frame state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Gpu(GpuError),
}

impl From<GpuError> for FrameError {
    fn from(error: GpuError) -> Self {
        match error {
            GpuError::DeviceLost => Self::DeviceLost,
            GpuError::OutOfDate | GpuError::SurfaceLost => Self::SurfaceLost,
            GpuError::Timeout => Self::Timeout,
            other => Self::Gpu(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

struct FrameSlot {
    command_buffer: CommandBufferId,
    fence: FenceId,
    image_available: SemaphoreId,
    state: SlotState,
    generation: u64,
    transient: Option<TransientTag>,
}

/// Exclusive permission to record the frame of one slot.
#[derive(Debug)]
pub struct FrameHandle {
    slot: usize,
    generation: u64,
    image_index: u32,
    image: ImageId,
    extent: Extent2D,
    format: Format,
    transient: TransientTag,
    command_buffer: CommandBufferId,
}

impl FrameHandle {
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Monotonic frame number, starting at 1.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub const fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Swapchain image to render into.
    pub const fn image(&self) -> ImageId {
        self.image
    }

    pub const fn extent(&self) -> Extent2D {
        self.extent
    }

    pub const fn format(&self) -> Format {
        self.format
    }

    /// Ring tag retired when this frame's fence signals.
    pub const fn transient(&self) -> TransientTag {
        self.transient
    }

    pub const fn command_buffer(&self) -> CommandBufferId {
        self.command_buffer
    }
}

/// Manages the swapchain and the rotating frame slots.
pub struct FrameScheduler {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<Allocator>,
    target: Arc<dyn PresentTarget>,
    config: FrameConfig,
    slots: Vec<FrameSlot>,
    current: usize,
    swapchain: Option<SwapchainInfo>,
    /// Signalled by rendering, waited by present; one per swapchain image.
    render_finished: Vec<SemaphoreId>,
    resize_requested: Arc<AtomicBool>,
    next_generation: u64,
    completed_generation: u64,
    last_submitted_generation: u64,
    swapchain_generation: u64,
}

impl FrameScheduler {
    pub fn new(
        ctx: &DeviceContext,
        target: Arc<dyn PresentTarget>,
        config: FrameConfig,
    ) -> Result<Self, FrameError> {
        if config.frames_in_flight < 2 {
            return Err(FrameError::InvalidState(format!(
                "frames_in_flight must be at least 2, got {}",
                config.frames_in_flight
            )));
        }
        let device = ctx.device().clone();

        let mut slots = Vec::with_capacity(config.frames_in_flight as usize);
        for _ in 0..config.frames_in_flight {
            slots.push(FrameSlot {
                command_buffer: device
                    .create_command_buffer(QueueKind::Graphics, CommandBufferLevel::Primary)?,
                // Unsignaled: the first use of a slot does not wait.
                fence: device.create_fence(false)?,
                image_available: device.create_semaphore()?,
                state: SlotState::Idle,
                generation: 0,
                transient: None,
            });
        }

        let resize_requested = Arc::new(AtomicBool::new(false));
        let flag = resize_requested.clone();
        target.register_resize_callback(Box::new(move |_| flag.store(true, Ordering::Release)));

        let mut scheduler = Self {
            device,
            allocator: ctx.allocator().clone(),
            target,
            config,
            slots,
            current: 0,
            swapchain: None,
            render_finished: Vec::new(),
            resize_requested,
            next_generation: 1,
            completed_generation: 0,
            last_submitted_generation: 0,
            swapchain_generation: 0,
        };
        match scheduler.rebuild_swapchain() {
            // Starting minimized; the first frame retries.
            Ok(()) | Err(FrameError::SurfaceLost) => {}
            Err(e) => return Err(e),
        }

        tracing::info!(
            "Frame scheduler initialized with {} frames in flight",
            scheduler.config.frames_in_flight
        );
        Ok(scheduler)
    }

    /// Wait for the current slot, acquire an image and start recording.
    pub fn begin_frame(&mut self) -> Result<FrameHandle, FrameError> {
        if self.resize_requested.swap(false, Ordering::AcqRel) || self.swapchain.is_none() {
            self.rebuild_swapchain()?;
        }
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Err(FrameError::SurfaceLost);
        };
        let swapchain_id = swapchain.id;

        let index = self.current;
        match self.slots[index].state {
            SlotState::Recording => {
                return Err(FrameError::InvalidState(
                    "previous frame on this slot was never ended".to_string(),
                ));
            }
            SlotState::Submitted => self.wait_slot(index)?,
            SlotState::Idle => {}
        }

        let (image_available, fence) = (self.slots[index].image_available, self.slots[index].fence);
        let acquired = match self.device.acquire_next_image(swapchain_id, image_available, u64::MAX)
        {
            Ok(acquired) => acquired,
            Err(e) if e.is_surface_error() => {
                tracing::debug!("Acquire failed with {e}; rebuilding swapchain");
                self.rebuild_swapchain()?;
                return Err(FrameError::SurfaceLost);
            }
            Err(e) => return Err(e.into()),
        };
        if acquired.suboptimal {
            self.resize_requested.store(true, Ordering::Release);
        }

        // Reset only once an image is in hand, so a failed acquire leaves the fence usable.
        self.device.reset_fence(fence)?;

        let (image, extent, format) = match self.swapchain.as_ref() {
            Some(sc) => (
                sc.images[acquired.index as usize],
                sc.extent,
                sc.format,
            ),
            None => return Err(FrameError::SurfaceLost),
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        let transient = self.allocator.begin_transient();

        let slot = &mut self.slots[index];
        slot.state = SlotState::Recording;
        slot.generation = generation;
        slot.transient = Some(transient);

        tracing::trace!(
            "Begin frame {generation} on slot {index}, image {}",
            acquired.index
        );

        Ok(FrameHandle {
            slot: index,
            generation,
            image_index: acquired.index,
            image,
            extent,
            format,
            transient,
            command_buffer: slot.command_buffer,
        })
    }

    /// Encode and submit the frame, then present it.
    pub fn end_frame(&mut self, frame: FrameHandle, commands: &CommandList) -> Result<(), FrameError> {
        let slot = self
            .slots
            .get(frame.slot)
            .ok_or_else(|| FrameError::InvalidState(format!("no frame slot {}", frame.slot)))?;
        if slot.state != SlotState::Recording || slot.generation != frame.generation {
            return Err(FrameError::InvalidState(format!(
                "frame {} is not recording on slot {}",
                frame.generation, frame.slot
            )));
        }
        let Some(swapchain_id) = self.swapchain.as_ref().map(|sc| sc.id) else {
            return Err(FrameError::SurfaceLost);
        };
        let render_finished = self.render_finished[frame.image_index as usize];

        let submission = Submission {
            command_buffers: vec![slot.command_buffer],
            wait: vec![SemaphoreWait {
                semaphore: slot.image_available,
                stage: PipelineStage::ColorAttachmentOutput,
            }],
            signal: vec![render_finished],
            fence: Some(slot.fence),
        };
        let submitted = self
            .device
            .encode(slot.command_buffer, commands)
            .and_then(|()| self.device.submit(QueueKind::Graphics, &submission));
        if let Err(e) = submitted {
            tracing::error!("Frame {} submission failed: {e}", frame.generation);
            self.abandon_frame(frame.slot, frame.generation);
            return Err(e.into());
        }

        self.slots[frame.slot].state = SlotState::Submitted;
        self.last_submitted_generation = frame.generation;
        self.current = (self.current + 1) % self.slots.len();

        match self
            .device
            .present(swapchain_id, frame.image_index, &[render_finished])
        {
            Ok(suboptimal) => {
                if suboptimal {
                    self.resize_requested.store(true, Ordering::Release);
                }
                Ok(())
            }
            Err(e) if e.is_surface_error() => {
                self.resize_requested.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unwind a frame whose submission failed. The acquired image was never
    /// rendered: an empty submission consumes its semaphore, and the swapchain
    /// is rebuilt to hand the image back.
    fn abandon_frame(&mut self, index: usize, generation: u64) {
        let slot = &mut self.slots[index];
        let drain = Submission {
            command_buffers: Vec::new(),
            wait: vec![SemaphoreWait {
                semaphore: slot.image_available,
                stage: PipelineStage::ColorAttachmentOutput,
            }],
            signal: Vec::new(),
            fence: Some(slot.fence),
        };
        if self.device.submit(QueueKind::Graphics, &drain).is_ok() {
            // The transient tag retires with the fence
            slot.state = SlotState::Submitted;
            self.last_submitted_generation = generation;
        } else {
            // Nothing will wait on the signaled semaphore now; replace it.
            match self.device.create_semaphore() {
                Ok(fresh) => {
                    self.device.destroy_semaphore(slot.image_available);
                    slot.image_available = fresh;
                }
                Err(e) => tracing::warn!("Could not replace image semaphore of slot {index}: {e}"),
            }
            slot.state = SlotState::Idle;
            if let Some(tag) = slot.transient.take() {
                self.allocator.retire_transient(tag);
            }
        }
        self.resize_requested.store(true, Ordering::Release);
    }

    /// Wait for every submitted frame to complete.
    pub fn wait_all(&mut self) -> Result<(), FrameError> {
        for index in 0..self.slots.len() {
            if self.slots[index].state == SlotState::Submitted {
                self.wait_slot(index)?;
            }
        }
        Ok(())
    }

    fn wait_slot(&mut self, index: usize) -> Result<(), FrameError> {
        let fence = self.slots[index].fence;
        if !self.device.wait_fence(fence, self.config.fence_timeout_ns)? {
            return Err(FrameError::Timeout);
        }
        let slot = &mut self.slots[index];
        slot.state = SlotState::Idle;
        self.completed_generation = self.completed_generation.max(slot.generation);
        if let Some(tag) = slot.transient.take() {
            self.allocator.retire_transient(tag);
        }
        Ok(())
    }

    /// Recreate the swapchain for the current framebuffer size.
    fn rebuild_swapchain(&mut self) -> Result<(), FrameError> {
        let extent = self.target.framebuffer_extent();
        if extent.is_zero() {
            // Minimized; try again on a later frame.
            self.resize_requested.store(true, Ordering::Release);
            return Err(FrameError::SurfaceLost);
        }

        self.wait_all()?;

        let old = self.swapchain.take();
        let created = self.device.create_swapchain(&SwapchainDesc {
            surface: self.target.surface(),
            extent,
            vsync: self.config.vsync,
            old: old.as_ref().map(|sc| sc.id),
        });
        if let Some(old) = &old {
            self.device.destroy_swapchain(old.id);
        }
        for semaphore in self.render_finished.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
        let swapchain = created?;

        for _ in 0..swapchain.images.len() {
            self.render_finished.push(self.device.create_semaphore()?);
        }
        self.swapchain_generation += 1;

        tracing::info!(
            "Swapchain created: {}x{}, {} images, {:?}",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.images.len(),
            swapchain.format
        );
        self.swapchain = Some(swapchain);
        Ok(())
    }

    /// Highest generation whose fence has been observed signaled.
    pub const fn completed_generation(&self) -> u64 {
        self.completed_generation
    }

    /// Generation of the most recently begun frame.
    pub const fn current_generation(&self) -> u64 {
        self.next_generation - 1
    }

    pub const fn last_submitted_generation(&self) -> u64 {
        self.last_submitted_generation
    }

    /// Incremented on every swapchain rebuild.
    pub const fn swapchain_generation(&self) -> u64 {
        self.swapchain_generation
    }

    pub fn extent(&self) -> Extent2D {
        self.swapchain
            .as_ref()
            .map_or_else(|| self.target.framebuffer_extent(), |sc| sc.extent)
    }

    pub fn color_format(&self) -> Option<Format> {
        self.swapchain.as_ref().map(|sc| sc.format)
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, |sc| sc.images.len())
    }

    pub const fn frames_in_flight(&self) -> u32 {
        self.config.frames_in_flight
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle: {e}");
        }
        for slot in self.slots.drain(..) {
            if let Some(tag) = slot.transient {
                self.allocator.retire_transient(tag);
            }
            self.device.free_command_buffer(slot.command_buffer);
            self.device.destroy_fence(slot.fence);
            self.device.destroy_semaphore(slot.image_available);
        }
        for semaphore in self.render_finished.drain(..) {
            self.device.destroy_semaphore(semaphore);
        }
        if let Some(swapchain) = self.swapchain.take() {
            self.device.destroy_swapchain(swapchain.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::context::DeviceConfig;
    use crate::headless::{
        CompletionMode, HeadlessBackend, HeadlessConfig, HeadlessDevice, HeadlessEvent,
        HeadlessSurface,
    };
    use std::time::Duration;

    fn setup(
        config: HeadlessConfig,
    ) -> (DeviceContext, Arc<HeadlessDevice>, Arc<HeadlessSurface>) {
        let backend = Arc::new(HeadlessBackend::new(config));
        let surface = HeadlessSurface::new(Extent2D::new(320, 240));
        let ctx = DeviceContext::initialize(backend.clone(), &DeviceConfig::default(), Some(surface.handle()))
            .unwrap();
        let device = backend.device().unwrap();
        (ctx, device, surface)
    }

    fn present_commands(frame: &FrameHandle) -> CommandList {
        [Command::PrepareForPresent(frame.image())].into_iter().collect()
    }

    #[test]
    fn rejects_a_single_frame_in_flight() {
        let (ctx, _, surface) = setup(HeadlessConfig::default());
        let result = FrameScheduler::new(&ctx, surface, FrameConfig::default().with_frames_in_flight(1));
        assert!(matches!(result, Err(FrameError::InvalidState(_))));
    }

    #[test]
    fn generations_advance_and_complete() {
        let (ctx, device, surface) = setup(HeadlessConfig::default());
        let mut scheduler = FrameScheduler::new(&ctx, surface, FrameConfig::default()).unwrap();

        for expected in 1..=4 {
            let frame = scheduler.begin_frame().unwrap();
            assert_eq!(frame.generation(), expected);
            let commands = present_commands(&frame);
            scheduler.end_frame(frame, &commands).unwrap();
        }
        assert_eq!(scheduler.last_submitted_generation(), 4);
        // Slots 0 and 1 were each reused once.
        assert_eq!(scheduler.completed_generation(), 2);
        assert_eq!(device.submission_count(), 4);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (ctx, _, surface) = setup(HeadlessConfig::default());
        let mut scheduler = FrameScheduler::new(&ctx, surface, FrameConfig::default()).unwrap();

        let frame = scheduler.begin_frame().unwrap();
        assert!(matches!(
            scheduler.begin_frame(),
            Err(FrameError::InvalidState(_))
        ));
        assert_eq!(scheduler.slot_state(0), Some(SlotState::Recording));
        scheduler.end_frame(frame, &CommandList::new()).unwrap();

        let forged = FrameHandle {
            slot: 0,
            generation: 1,
            image_index: 0,
            image: ImageId(0),
            extent: Extent2D::new(1, 1),
            format: Format::Bgra8Srgb,
            transient: scheduler.allocator.begin_transient(),
            command_buffer: CommandBufferId(0),
        };
        assert!(matches!(
            scheduler.end_frame(forged, &CommandList::new()),
            Err(FrameError::InvalidState(_))
        ));
    }

    #[test]
    fn third_frame_waits_for_the_first_fence() {
        let (ctx, device, surface) = setup(HeadlessConfig {
            completion: CompletionMode::Manual,
            ..Default::default()
        });
        let mut scheduler = FrameScheduler::new(&ctx, surface, FrameConfig::default()).unwrap();

        for _ in 0..2 {
            let frame = scheduler.begin_frame().unwrap();
            let commands = present_commands(&frame);
            scheduler.end_frame(frame, &commands).unwrap();
        }

        let gpu = device.clone();
        let completer = std::thread::spawn(move || {
            assert!(gpu.wait_for_fence_waiter(Duration::from_secs(5)));
            gpu.complete_next()
        });

        let frame = scheduler.begin_frame().unwrap();
        assert!(completer.join().unwrap());
        assert_eq!(frame.generation(), 3);
        assert_eq!(scheduler.completed_generation(), 1);

        let events = device.events();
        let wait_started = events
            .iter()
            .position(|e| matches!(e.event, HeadlessEvent::FenceWaitStarted(_)))
            .unwrap();
        let signaled = events
            .iter()
            .position(|e| matches!(e.event, HeadlessEvent::FenceSignaled(_)))
            .unwrap();
        let acquired_third = events
            .iter()
            .filter(|e| matches!(e.event, HeadlessEvent::ImageAcquired { .. }))
            .nth(2)
            .map(|e| e.seq)
            .unwrap();
        assert!(wait_started < signaled);
        assert!(events[signaled].seq < acquired_third);

        let commands = present_commands(&frame);
        scheduler.end_frame(frame, &commands).unwrap();
        device.complete_all();
    }

    #[test]
    fn resize_rebuilds_the_swapchain() {
        let (ctx, _, surface) = setup(HeadlessConfig::default());
        let mut scheduler = FrameScheduler::new(&ctx, surface.clone(), FrameConfig::default()).unwrap();
        assert_eq!(scheduler.swapchain_generation(), 1);

        surface.resize(Extent2D::new(800, 600));
        let frame = scheduler.begin_frame().unwrap();
        assert_eq!(frame.extent(), Extent2D::new(800, 600));
        assert_eq!(scheduler.swapchain_generation(), 2);
        scheduler.end_frame(frame, &CommandList::new()).unwrap();
    }

    #[test]
    fn minimized_surface_reports_surface_lost() {
        let (ctx, _, surface) = setup(HeadlessConfig::default());
        let mut scheduler = FrameScheduler::new(&ctx, surface.clone(), FrameConfig::default()).unwrap();

        surface.resize(Extent2D::new(0, 0));
        assert_eq!(scheduler.begin_frame().unwrap_err(), FrameError::SurfaceLost);
        assert_eq!(scheduler.begin_frame().unwrap_err(), FrameError::SurfaceLost);

        surface.resize(Extent2D::new(100, 100));
        let frame = scheduler.begin_frame().unwrap();
        scheduler.end_frame(frame, &CommandList::new()).unwrap();
    }

    #[test]
    fn out_of_date_acquire_rebuilds_and_retries() {
        let (ctx, device, surface) = setup(HeadlessConfig::default());
        let mut scheduler = FrameScheduler::new(&ctx, surface, FrameConfig::default()).unwrap();

        device.inject_acquire_error(GpuError::OutOfDate);
        assert_eq!(scheduler.begin_frame().unwrap_err(), FrameError::SurfaceLost);
        assert_eq!(scheduler.swapchain_generation(), 2);

        let frame = scheduler.begin_frame().unwrap();
        assert_eq!(frame.generation(), 1);
        scheduler.end_frame(frame, &CommandList::new()).unwrap();
    }

    #[test]
    fn failed_submission_consumes_the_image_semaphore() {
        let (ctx, device, surface) = setup(HeadlessConfig::default());
        let mut scheduler = FrameScheduler::new(&ctx, surface, FrameConfig::default()).unwrap();

        let frame = scheduler.begin_frame().unwrap();
        let slot = frame.slot();
        device.inject_submit_error(GpuError::OutOfDeviceMemory);
        let commands = present_commands(&frame);
        assert!(matches!(
            scheduler.end_frame(frame, &commands),
            Err(FrameError::Gpu(GpuError::OutOfDeviceMemory))
        ));
        assert_eq!(scheduler.slot_state(slot), Some(SlotState::Submitted));

        // The same slot acquires again after the swapchain is rebuilt
        for _ in 0..3 {
            let frame = scheduler.begin_frame().unwrap();
            let commands = present_commands(&frame);
            scheduler.end_frame(frame, &commands).unwrap();
        }
        assert_eq!(scheduler.swapchain_generation(), 2);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn device_loss_is_terminal() {
        let (ctx, device, surface) = setup(HeadlessConfig::default());
        let mut scheduler = FrameScheduler::new(&ctx, surface, FrameConfig::default()).unwrap();

        let frame = scheduler.begin_frame().unwrap();
        device.inject_device_lost();
        assert_eq!(
            scheduler.end_frame(frame, &CommandList::new()).unwrap_err(),
            FrameError::DeviceLost
        );
    }
}
