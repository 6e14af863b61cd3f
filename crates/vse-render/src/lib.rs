//! Rendering for the VSE engine.
//!
//! This crate provides:
//! - The [`CommandRecorder`] turning a sorted scene view into a frame's command list
//! - The [`Renderer`] tying scheduler, caches, registry and scene together each frame
//! - Light selection and packing for the frame uniform
//! - The [`OverlaySource`] extension point for UI overlays

pub mod error;
pub mod lights;
pub mod recorder;
pub mod renderer;

pub use error::{RecordError, RenderError, Result};
pub use lights::{GpuLight, MAX_LIGHTS};
pub use recorder::{
    CommandRecorder, DrawResources, MaterialBinding, MeshBinding, OverlayOutput, OverlaySource,
    RecordStats,
};
pub use renderer::{FrameGlobals, FrameOutcome, Renderer, RendererConfig};
