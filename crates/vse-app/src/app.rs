//! `SceneApp` trait definition.

use crate::context::AppContext;
use vse_asset::AttachedScene;
use vse_render::OverlaySource;
use winit::event::WindowEvent;

/// Trait for VSE applications.
///
/// The framework owns the window, device, scheduler, renderer and scene; an
/// application fills the scene and reacts to input. Every frame it calls
/// [`update`](Self::update) and then renders `ctx.graph` through `ctx.camera`.
pub trait SceneApp: Sized {
    /// Called once after the window and GPU context are ready.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Called every frame before rendering with the delta time in seconds.
    #[allow(unused_variables)]
    fn update(&mut self, ctx: &mut AppContext, dt: f32) {}

    /// Called when a load started with [`AppContext::begin_load`] finished.
    fn on_scene_loaded(&mut self, ctx: &mut AppContext, result: anyhow::Result<AttachedScene>) {
        let _ = ctx;
        if let Err(e) = result {
            tracing::error!("Scene load failed: {e:#}");
        }
    }

    /// UI drawn on top of the scene this frame.
    fn overlay(&mut self) -> Option<&mut dyn OverlaySource> {
        None
    }

    /// Called after the window size changed. The camera aspect is already updated.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Return `true` if the event was handled and should not be processed further.
    #[allow(unused_variables)]
    fn on_event(&mut self, ctx: &mut AppContext, event: &WindowEvent) -> bool {
        false
    }

    /// Called before shutdown with the GPU idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
