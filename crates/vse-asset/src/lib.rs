//! Asset ingestion for the VSE engine.
//!
//! This crate provides:
//! - glTF 2.0 and GLB parsing into a validated [`SceneDescription`]
//! - Parallel staging and upload of geometry and textures with all-or-nothing rollback
//! - The [`ResourceRegistry`] of resident meshes, materials and textures
//! - Attaching uploaded batches to a [`vse_scene::SceneGraph`]

pub mod attach;
pub mod description;
pub mod error;
pub mod gltf_loader;
pub mod loader;
pub mod registry;
pub mod upload;

pub use attach::{attach, AttachedScene};
pub use description::{
    AlphaMode, ImageSource, MaterialDesc, MeshDesc, NodeDesc, PrimitiveDesc, SceneDescription,
    TextureDesc, Vertex,
};
pub use error::{AssetError, Result};
pub use gltf_loader::{load_scene, load_scene_from_slice};
pub use loader::{AssetLoader, CancelToken, LoadHandle, LoaderConfig};
pub use registry::{GpuMaterial, GpuMesh, GpuTexture, RegistryStats, ResourceRegistry};
pub use upload::{MaterialUniform, UploadedScene, Uploader};
