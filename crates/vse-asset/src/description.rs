//! CPU-side scene description produced by parsing.

use bytemuck::{Pod, Zeroable};
use std::sync::Arc;
use vse_core::{Aabb, Transform};
use vse_gpu::{SamplerDesc, VertexFormat, VertexLayout};
use vse_scene::Light;

/// Interleaved vertex consumed by the built-in mesh shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const FORMATS: [(u32, VertexFormat); 3] = [
        (0, VertexFormat::Float32x3),
        (1, VertexFormat::Float32x3),
        (2, VertexFormat::Float32x2),
    ];

    pub fn layout() -> VertexLayout {
        VertexLayout::packed(&Self::FORMATS)
    }

    pub fn is_finite(&self) -> bool {
        self.position
            .iter()
            .chain(&self.normal)
            .chain(&self.uv)
            .all(|v| v.is_finite())
    }
}

/// One triangle list with its material reference.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimitiveDesc {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub bounds: Aabb,
    /// Index into [`SceneDescription::materials`].
    pub material: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshDesc {
    pub name: Option<String>,
    pub primitives: Vec<PrimitiveDesc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AlphaMode {
    #[default]
    Opaque,
    Mask,
    Blend,
}

/// PBR metallic-roughness material.
#[derive(Clone, Debug, PartialEq)]
pub struct MaterialDesc {
    pub name: Option<String>,
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub emissive: [f32; 3],
    pub alpha_mode: AlphaMode,
    pub alpha_cutoff: f32,
    pub double_sided: bool,
    /// Index into [`SceneDescription::textures`].
    pub base_color_texture: Option<usize>,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            name: None,
            base_color: [1.0; 4],
            metallic: 1.0,
            roughness: 1.0,
            emissive: [0.0; 3],
            alpha_mode: AlphaMode::Opaque,
            alpha_cutoff: 0.5,
            double_sided: false,
            base_color_texture: None,
        }
    }
}

/// Undecoded or raw image data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    /// PNG, JPEG or another container the `image` crate recognizes.
    Encoded {
        bytes: Arc<[u8]>,
        mime_type: Option<String>,
    },
    /// Tightly packed RGBA8 pixels.
    Rgba8 {
        width: u32,
        height: u32,
        pixels: Arc<[u8]>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextureDesc {
    pub name: Option<String>,
    pub source: ImageSource,
    pub sampler: SamplerDesc,
    /// Colour data (base colour, emissive) is stored in sRGB.
    pub srgb: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeDesc {
    pub name: Option<String>,
    pub local: Transform,
    /// Index into [`SceneDescription::meshes`].
    pub mesh: Option<usize>,
    /// From `KHR_lights_punctual`.
    pub light: Option<Light>,
    pub children: Vec<usize>,
}

/// Everything parsed from one glTF asset, ready for upload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SceneDescription {
    pub nodes: Vec<NodeDesc>,
    /// Top-level nodes of the displayed scene.
    pub roots: Vec<usize>,
    pub meshes: Vec<MeshDesc>,
    pub materials: Vec<MaterialDesc>,
    pub textures: Vec<TextureDesc>,
    pub warnings: Vec<String>,
}

impl SceneDescription {
    pub fn primitive_count(&self) -> usize {
        self.meshes.iter().map(|m| m.primitives.len()).sum()
    }

    /// Node indices in depth-first pre-order from the roots.
    pub fn node_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            let Some(node) = self.nodes.get(index) else {
                continue;
            };
            order.push(index);
            stack.extend(node.children.iter().rev());
        }
        order
    }
}
