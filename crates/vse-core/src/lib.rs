//! Core types shared by every VSE crate.
//!
//! This crate provides:
//! - Transforms, bounding boxes and frustum culling math
//! - Generational handles for index-based resource relations
//! - The structured diagnostics sink used by validation callbacks and asset loading

pub mod diagnostics;
pub mod handle;
pub mod math;

pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticSink, Severity, TracingSink};
pub use handle::{Handle, HandleMap, Material, MaterialId, Mesh, MeshId, Texture, TextureId};
pub use math::{Aabb, Frustum, Transform};
