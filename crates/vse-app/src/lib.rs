//! Application framework for the VSE engine.
//!
//! This crate handles the boilerplate around the engine:
//! - Logging setup
//! - Window creation and the winit surface collaborator
//! - Device context, frame scheduler, renderer and registry setup
//! - Scene loading into the attached scene graph
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use vse_app::{run_app, AppConfig, AppContext, SceneApp};
//!
//! struct Viewer;
//!
//! impl SceneApp for Viewer {
//!     fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         ctx.load_scene("scene.glb")?;
//!         Ok(Viewer)
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<Viewer>(AppConfig::default())
//! }
//! ```

mod app;
mod config;
mod context;
mod logging;
mod runner;
mod surface;

pub use app::SceneApp;
pub use config::AppConfig;
pub use context::AppContext;
pub use logging::{init_logging, init_logging_with};
pub use runner::run_app;
pub use surface::WinitSurface;

pub use vse_asset::AttachedScene;
pub use vse_render::{OverlayOutput, OverlaySource, RendererConfig};
pub use vse_scene::Camera;
pub use winit::event::WindowEvent;
