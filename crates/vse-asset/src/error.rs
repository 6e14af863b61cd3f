//! Error types for asset loading.

use std::path::PathBuf;
use thiserror::Error;
use vse_gpu::GpuError;
use vse_scene::SceneError;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid glTF: {0}")]
    Parse(String),

    #[error("mesh {mesh} primitive {primitive}: {reason}")]
    MalformedGeometry {
        mesh: usize,
        primitive: usize,
        reason: String,
    },

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("texture {texture}: {reason}")]
    Texture { texture: usize, reason: String },

    #[error("load cancelled")]
    Cancelled,

    #[error("loader worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Scene(#[from] SceneError),
}

impl AssetError {
    pub(crate) fn malformed(mesh: usize, primitive: usize, reason: impl Into<String>) -> Self {
        Self::MalformedGeometry {
            mesh,
            primitive,
            reason: reason.into(),
        }
    }
}

impl From<gltf::Error> for AssetError {
    fn from(error: gltf::Error) -> Self {
        Self::Parse(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AssetError>;
