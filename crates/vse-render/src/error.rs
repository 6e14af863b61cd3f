//! Error types for rendering.

use thiserror::Error;
use vse_gpu::{FrameError, GpuError, PipelineError};
use vse_shaders::ShaderError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("no frame globals descriptor set for slot {0}")]
    MissingFrameGlobals(usize),
    #[error("render target has zero extent")]
    EmptyTarget,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Record(#[from] RecordError),
}

impl RenderError {
    /// Device loss; the device context has to be re-created.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Frame(FrameError::DeviceLost)
                | Self::Gpu(GpuError::DeviceLost)
                | Self::Pipeline(PipelineError::Gpu(GpuError::DeviceLost))
        )
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
