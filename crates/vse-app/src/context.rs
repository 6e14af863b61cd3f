//! Application context.

use crate::config::AppConfig;
use crate::surface::WinitSurface;
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use vse_asset::{
    attach, AssetLoader, AttachedScene, CancelToken, LoadHandle, ResourceRegistry,
    SceneDescription, Uploader,
};
use vse_core::TracingSink;
use vse_gpu::{Backend, DeviceContext, FrameScheduler, PresentTarget, SamplerCache, VulkanBackend};
use vse_render::Renderer;
use vse_scene::{Camera, SceneGraph};
use winit::window::Window;

/// Everything an application touches between frames.
///
/// Fields are dropped in declaration order: GPU users go before the device
/// context, and the surface outlives the scheduler's swapchain.
pub struct AppContext {
    pub renderer: Renderer,
    pub scheduler: FrameScheduler,
    uploader: Uploader,
    pub registry: ResourceRegistry,
    pub graph: SceneGraph,
    pub camera: Camera,
    loader: AssetLoader,
    pending: Option<(PathBuf, LoadHandle)>,
    pub device: DeviceContext,
    pub surface: Arc<WinitSurface>,
    pub window: Arc<Window>,
    /// Total frames presented.
    pub frame_count: u64,
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    pub(crate) fn new(window: Arc<Window>, config: &AppConfig) -> anyhow::Result<Self> {
        let device_config = config.device_config();
        let backend = Arc::new(VulkanBackend::new(&device_config, Arc::new(TracingSink))?);

        // SAFETY: the context keeps the window alive and drops the scheduler,
        // which owns the swapchain, before the surface and window.
        let surface = Arc::new(unsafe { WinitSurface::new(&backend, window.clone()) }?);

        let backend: Arc<dyn Backend> = backend;
        let device = DeviceContext::initialize(backend, &device_config, Some(surface.surface()))?;
        info!("GPU: {}", device.adapter().summary());

        let target: Arc<dyn PresentTarget> = surface.clone();
        let scheduler = FrameScheduler::new(&device, target, config.frame_config())?;
        info!(
            "Frame scheduler ready: {}x{} ({} frames in flight)",
            scheduler.extent().width,
            scheduler.extent().height,
            scheduler.frames_in_flight()
        );

        let renderer = Renderer::new(&device, scheduler.frames_in_flight(), config.renderer.clone())?;
        let samplers = Arc::new(SamplerCache::new(device.device().clone()));
        let registry =
            ResourceRegistry::new(device.device().clone(), device.allocator().clone(), samplers)?;
        let uploader = Uploader::new(
            device.device().clone(),
            device.allocator().clone(),
            registry.samplers().clone(),
            &config.loader,
        )?;

        let mut camera = Camera::default();
        let size = window.inner_size();
        if size.height > 0 {
            camera.set_aspect(size.width as f32 / size.height as f32);
        }

        Ok(Self {
            renderer,
            scheduler,
            uploader,
            registry,
            graph: SceneGraph::new(),
            camera,
            loader: AssetLoader::new(config.loader.clone()),
            pending: None,
            device,
            surface,
            window,
            frame_count: 0,
            last_frame_time: Instant::now(),
        })
    }

    /// Parse, upload and attach the scene at `path`, then frame it with the camera.
    ///
    /// On error nothing is attached and no GPU memory stays allocated.
    pub fn load_scene(&mut self, path: impl AsRef<Path>) -> anyhow::Result<AttachedScene> {
        let path = path.as_ref();
        let scene = vse_asset::load_scene(path)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        self.publish(path, &scene, &CancelToken::new())
    }

    /// Start parsing `path` in the background. A load already in progress is cancelled.
    pub fn begin_load(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if let Some((previous, handle)) = self.pending.take() {
            info!("Cancelling load of {}", previous.display());
            handle.cancel();
        }
        info!("Loading {} in the background", path.display());
        let handle = self.loader.load_async(path.clone());
        self.pending = Some((path, handle));
    }

    pub const fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// Finish a background load once its parse completed.
    ///
    /// Returns `None` while nothing is pending or parsing is still running.
    pub fn poll_load(&mut self) -> Option<anyhow::Result<AttachedScene>> {
        let parsed = self.pending.as_ref()?.1.try_recv()?;
        let (path, handle) = self.pending.take()?;
        Some(
            parsed
                .with_context(|| format!("failed to parse {}", path.display()))
                .and_then(|scene| self.publish(&path, &scene, handle.token())),
        )
    }

    /// Remove every entity. Their resources are destroyed once in-flight frames finish.
    pub fn clear_scene(&mut self) {
        for id in self.graph.traverse().into_iter().rev() {
            // Reparenting keeps the remaining ids valid
            if let Err(e) = self.graph.remove_entity(id) {
                tracing::warn!("Failed to remove entity {id:?}: {e}");
            }
        }
    }

    /// Block until the GPU has finished every submitted frame.
    pub fn wait_idle(&mut self) -> anyhow::Result<()> {
        self.scheduler.wait_all()?;
        self.device.wait_idle()?;
        Ok(())
    }

    fn publish(
        &mut self,
        path: &Path,
        scene: &SceneDescription,
        cancel: &CancelToken,
    ) -> anyhow::Result<AttachedScene> {
        let uploaded = self
            .uploader
            .upload(scene, cancel)
            .with_context(|| format!("failed to upload {}", path.display()))?;
        let attached = attach(&mut self.graph, &mut self.registry, uploaded)
            .with_context(|| format!("failed to attach {}", path.display()))?;

        if let Some(bounds) = &attached.bounds {
            self.camera.frame_bounds(bounds);
        }
        info!(
            "Loaded {}: {} entities, {} materials, {} textures",
            path.display(),
            attached.entities.len(),
            attached.materials.len(),
            attached.textures.len()
        );
        Ok(attached)
    }
}
