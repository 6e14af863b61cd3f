//! Headless engine harness.
//!
//! Wires the headless device into the same device context, scheduler, renderer
//! and registry the windowed application uses, so tests drive whole frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use glam::Vec3;
use vse_asset::{
    attach, load_scene_from_slice, AttachedScene, CancelToken, LoaderConfig, RegistryStats,
    ResourceRegistry, SceneDescription, Uploader,
};
use vse_gpu::headless::{
    CompletionMode, HeadlessBackend, HeadlessConfig, HeadlessDevice, HeadlessSurface,
};
use vse_gpu::{
    DeviceConfig, DeviceContext, Extent2D, FrameConfig, FrameScheduler, SamplerCache, UsageClass,
};
use vse_render::{FrameOutcome, RecordStats, Renderer, RendererConfig};
use vse_scene::{Camera, SceneGraph};

use crate::{Result, TestError};

/// Completes headless GPU work on a background thread while it lives.
///
/// Needed in [`CompletionMode::Manual`] around calls that wait on their own
/// submissions, like uploads.
pub struct GpuPump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl GpuPump {
    pub fn start(device: Arc<HeadlessDevice>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                if device.wait_for_fence_waiter(Duration::from_millis(5)) {
                    device.complete_all();
                }
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for GpuPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Counts of everything the device and registry hold, for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Residency {
    /// Live stable allocations across every usage class.
    pub allocations: usize,
    pub allocated_bytes: u64,
    pub images: usize,
    pub descriptor_sets: usize,
    pub registry: RegistryStats,
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub device: HeadlessConfig,
    pub extent: Extent2D,
    pub frame: FrameConfig,
    pub renderer: RendererConfig,
    pub loader: LoaderConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            device: HeadlessConfig::default(),
            extent: Extent2D::new(320, 240),
            frame: FrameConfig::default(),
            renderer: RendererConfig::default(),
            loader: LoaderConfig::default().with_worker_threads(2),
        }
    }
}

impl HarnessConfig {
    /// GPU work completes only when the test says so.
    #[must_use]
    pub fn manual(mut self) -> Self {
        self.device.completion = CompletionMode::Manual;
        self
    }

    #[must_use]
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }
}

/// The engine on a headless device.
pub struct Harness {
    pub renderer: Renderer,
    pub scheduler: FrameScheduler,
    uploader: Uploader,
    pub registry: ResourceRegistry,
    pub graph: SceneGraph,
    pub camera: Camera,
    pub ctx: DeviceContext,
    pub device: Arc<HeadlessDevice>,
    pub surface: Arc<HeadlessSurface>,
    manual: bool,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_config(HarnessConfig::default())
    }

    pub fn with_config(config: HarnessConfig) -> Result<Self> {
        let manual = config.device.completion == CompletionMode::Manual;
        let backend = Arc::new(HeadlessBackend::new(config.device.clone()));
        let surface = HeadlessSurface::new(config.extent);
        let ctx = DeviceContext::initialize(
            backend.clone(),
            &DeviceConfig::default().with_app_name("vse-test"),
            Some(surface.handle()),
        )?;
        let device = backend
            .device()
            .ok_or_else(|| TestError::Setup("backend opened no device".to_string()))?;

        // The registry uploads its default texture and waits for it
        let pump = manual.then(|| GpuPump::start(device.clone()));
        let scheduler = FrameScheduler::new(&ctx, surface.clone(), config.frame)?;
        let renderer = Renderer::new(&ctx, scheduler.frames_in_flight(), config.renderer)?;
        let samplers = Arc::new(SamplerCache::new(ctx.device().clone()));
        let registry =
            ResourceRegistry::new(ctx.device().clone(), ctx.allocator().clone(), samplers)?;
        let uploader = Uploader::new(
            ctx.device().clone(),
            ctx.allocator().clone(),
            registry.samplers().clone(),
            &config.loader,
        )?;
        drop(pump);

        let mut camera = Camera {
            position: Vec3::new(0.0, 0.0, 5.0),
            ..Camera::default()
        };
        camera.set_aspect(config.extent.width as f32 / config.extent.height.max(1) as f32);
        tracing::debug!(
            "Harness ready: {}x{}, manual completion {manual}",
            config.extent.width,
            config.extent.height
        );

        Ok(Self {
            renderer,
            scheduler,
            uploader,
            registry,
            graph: SceneGraph::new(),
            camera,
            ctx,
            device,
            surface,
            manual,
        })
    }

    /// Parse, upload and attach GLB or glTF bytes, framing the result with the camera.
    pub fn load(&mut self, bytes: &[u8]) -> Result<AttachedScene> {
        let scene = load_scene_from_slice(bytes, None)?;
        self.publish(&scene, &CancelToken::new())
    }

    /// Upload and attach an already parsed scene.
    pub fn publish(
        &mut self,
        scene: &SceneDescription,
        cancel: &CancelToken,
    ) -> Result<AttachedScene> {
        let pump = self.manual.then(|| GpuPump::start(self.device.clone()));
        let uploaded = self.uploader.upload(scene, cancel);
        drop(pump);

        let attached = attach(&mut self.graph, &mut self.registry, uploaded?)?;
        if let Some(bounds) = &attached.bounds {
            self.camera.frame_bounds(bounds);
        }
        Ok(attached)
    }

    pub fn render_frame(&mut self) -> vse_render::Result<FrameOutcome> {
        self.renderer.render_frame(
            &mut self.scheduler,
            &mut self.graph,
            &mut self.registry,
            &self.camera,
            None,
        )
    }

    /// Render a frame that must be presented.
    pub fn present(&mut self) -> Result<RecordStats> {
        match self.render_frame()? {
            FrameOutcome::Presented(stats) => Ok(stats),
            FrameOutcome::Skipped => Err(TestError::Setup("frame was skipped".to_string())),
        }
    }

    /// Remove every entity.
    pub fn clear(&mut self) -> Result<()> {
        for id in self.graph.traverse().into_iter().rev() {
            self.graph.remove_entity(id)?;
        }
        Ok(())
    }

    pub fn residency(&self) -> Residency {
        let stats = self.ctx.allocator().stats();
        Residency {
            allocations: UsageClass::ALL
                .iter()
                .map(|&class| stats.class(class).live_allocations)
                .sum(),
            allocated_bytes: UsageClass::ALL
                .iter()
                .map(|&class| stats.class(class).allocated)
                .sum(),
            images: self.device.live_images(),
            descriptor_sets: self.device.live_descriptor_sets(),
            registry: self.registry.stats(),
        }
    }
}
