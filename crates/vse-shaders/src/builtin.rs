//! Shaders shipped with the engine.

use crate::compiler::{defines, ShaderSource};
use crate::library::ProgramRequest;
use std::sync::OnceLock;
use vse_gpu::ShaderStage;

/// Enables alpha-cutoff discard in the mesh fragment shader.
pub const ALPHA_MASK: &str = "ALPHA_MASK";

static MESH_VERT: OnceLock<ShaderSource> = OnceLock::new();
static MESH_FRAG: OnceLock<ShaderSource> = OnceLock::new();

/// Lit mesh vertex shader. Inputs: position, normal, uv; push constant: model matrix.
pub fn mesh_vertex() -> ShaderSource {
    MESH_VERT
        .get_or_init(|| ShaderSource::new("mesh.vert", include_str!("../shaders/mesh.vert")))
        .clone()
}

/// Lit mesh fragment shader. Set 1 holds the material parameters, base colour texture and sampler.
pub fn mesh_fragment() -> ShaderSource {
    MESH_FRAG
        .get_or_init(|| ShaderSource::new("mesh.frag", include_str!("../shaders/mesh.frag")))
        .clone()
}

pub fn mesh_program(alpha_mask: bool) -> ProgramRequest {
    ProgramRequest {
        stages: vec![
            (mesh_vertex(), ShaderStage::Vertex),
            (mesh_fragment(), ShaderStage::Fragment),
        ],
        defines: if alpha_mask {
            defines([(ALPHA_MASK, "1")])
        } else {
            crate::Defines::new()
        },
    }
}
