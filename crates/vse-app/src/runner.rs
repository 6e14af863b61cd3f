//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use vse_render::FrameOutcome;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::SceneApp;
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::logging::init_logging;

/// Run a [`SceneApp`] with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the
/// event loop until the window closes or the device is lost.
pub fn run_app<A: SceneApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct AppRunner<A: SceneApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: SceneApp> {
    // Dropped before the context
    app: A,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    skipped_frames: u64,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: SceneApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");
        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&mut state.ctx, &event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.render_frame() {
                    error!("Device lost, shutting down: {e:#}");
                    if let Some(mut state) = self.state.take() {
                        state.cleanup();
                    }
                    self.failure = Some(e);
                    event_loop.exit();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.handle_resize(size) {
                        error!("Resize error: {e:#}");
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: SceneApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let mut ctx = AppContext::new(window, &self.config)?;
        let app = A::init(&mut ctx)?;

        let target_frame_time = self
            .config
            .target_fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)));

        Ok(AppState {
            app,
            ctx,
            target_frame_time,
            skipped_frames: 0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

impl<A: SceneApp> AppState<A> {
    /// Render one frame. Only device loss is returned; other failures are logged.
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;

        self.app.update(&mut self.ctx, dt);

        if let Some(result) = self.ctx.poll_load() {
            self.app.on_scene_loaded(&mut self.ctx, result);
        }

        let ctx = &mut self.ctx;
        let outcome = ctx.renderer.render_frame(
            &mut ctx.scheduler,
            &mut ctx.graph,
            &mut ctx.registry,
            &ctx.camera,
            self.app.overlay(),
        );
        match outcome {
            Ok(FrameOutcome::Presented(stats)) => {
                ctx.frame_count += 1;
                if dt > 0.0 {
                    let fps = 1.0 / f64::from(dt);
                    self.min_fps = self.min_fps.min(fps);
                    self.max_fps = self.max_fps.max(fps);
                    self.fps_sum += fps;
                }
                tracing::trace!(
                    frame = ctx.frame_count,
                    draws = stats.draws,
                    skipped = stats.skipped,
                    "Frame presented"
                );
            }
            Ok(FrameOutcome::Skipped) => self.skipped_frames += 1,
            Err(e) if e.is_terminal() => return Err(e.into()),
            Err(e) => warn!("Frame failed: {e}"),
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }
        Ok(())
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        // The scheduler rebuilds the swapchain on its next begin_frame
        self.ctx.surface.notify_resized(size);
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }

        self.ctx
            .camera
            .set_aspect(size.width as f32 / size.height as f32);
        self.app.on_resize(&mut self.ctx, size.width, size.height)?;

        info!("Resized to {}x{}", size.width, size.height);
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }
        if self.skipped_frames > 0 {
            info!("  Skipped frames: {}", self.skipped_frames);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.wait_idle() {
            error!("Failed to wait idle: {e:#}");
        }
        self.app.cleanup(&mut self.ctx);
        info!("Cleanup complete");
    }
}
