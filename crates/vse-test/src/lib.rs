//! Test support for the VSE engine.
//!
//! Provides glTF fixture builders and a headless harness that runs the
//! renderer, scheduler and asset pipeline against the in-process device.

pub mod gltf;
pub mod harness;

pub use gltf::{GltfBuilder, LightSpec, MaterialSpec, NodeSpec, PrimitiveSpec};
pub use harness::{GpuPump, Harness, HarnessConfig, Residency};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("Harness setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Init(#[from] vse_gpu::InitError),
    #[error(transparent)]
    Frame(#[from] vse_gpu::FrameError),
    #[error(transparent)]
    Render(#[from] vse_render::RenderError),
    #[error(transparent)]
    Asset(#[from] vse_asset::AssetError),
    #[error(transparent)]
    Scene(#[from] vse_scene::SceneError),
    #[error("Fixture encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TestError>;
