//! Programmatic glTF 2.0 fixtures.
//!
//! [`GltfBuilder`] assembles a document and its binary buffer in memory and
//! writes it as GLB bytes or as a `.gltf` + `.bin` pair on disk.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{ImageFormat, Rgba, RgbaImage};
use serde_json::{json, Value};

use crate::Result;

const GLB_MAGIC: u32 = 0x4654_6C67;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

const FLOAT: u32 = 5126;
const UNSIGNED_INT: u32 = 5125;
const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;

/// One primitive's geometry.
#[derive(Debug, Clone, Default)]
pub struct PrimitiveSpec {
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub uvs: Option<Vec<[f32; 2]>>,
    pub indices: Option<Vec<u32>>,
    pub material: Option<usize>,
}

impl PrimitiveSpec {
    /// A unit triangle in the XY plane facing +Z.
    pub fn triangle() -> Self {
        Self {
            positions: vec![[-0.5, -0.5, 0.0], [0.5, -0.5, 0.0], [0.0, 0.5, 0.0]],
            uvs: Some(vec![[0.0, 1.0], [1.0, 1.0], [0.5, 0.0]]),
            indices: Some(vec![0, 1, 2]),
            ..Default::default()
        }
    }

    /// A unit quad in the XY plane facing +Z.
    pub fn quad() -> Self {
        Self {
            positions: vec![
                [-0.5, -0.5, 0.0],
                [0.5, -0.5, 0.0],
                [0.5, 0.5, 0.0],
                [-0.5, 0.5, 0.0],
            ],
            normals: Some(vec![[0.0, 0.0, 1.0]; 4]),
            uvs: Some(vec![[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]),
            indices: Some(vec![0, 1, 2, 0, 2, 3]),
            material: None,
        }
    }

    #[must_use]
    pub const fn with_material(mut self, material: usize) -> Self {
        self.material = Some(material);
        self
    }

    #[must_use]
    pub fn with_indices(mut self, indices: Vec<u32>) -> Self {
        self.indices = Some(indices);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MaterialSpec {
    pub name: Option<String>,
    pub base_color: [f32; 4],
    pub texture: Option<usize>,
    /// `"OPAQUE"`, `"MASK"` or `"BLEND"`.
    pub alpha_mode: &'static str,
    pub double_sided: bool,
}

impl Default for MaterialSpec {
    fn default() -> Self {
        Self {
            name: None,
            base_color: [1.0; 4],
            texture: None,
            alpha_mode: "OPAQUE",
            double_sided: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub name: Option<String>,
    pub mesh: Option<usize>,
    /// Index returned by [`GltfBuilder::light`].
    pub light: Option<usize>,
    pub translation: Option<[f32; 3]>,
    /// Quaternion `[x, y, z, w]`.
    pub rotation: Option<[f32; 4]>,
    pub children: Vec<usize>,
}

/// A `KHR_lights_punctual` light.
#[derive(Debug, Clone)]
pub enum LightSpec {
    Directional { color: [f32; 3], intensity: f32 },
    Point { color: [f32; 3], intensity: f32, range: Option<f32> },
    Spot { color: [f32; 3], intensity: f32, inner: f32, outer: f32 },
}

impl NodeSpec {
    pub fn mesh(mesh: usize) -> Self {
        Self {
            mesh: Some(mesh),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn at(mut self, translation: [f32; 3]) -> Self {
        self.translation = Some(translation);
        self
    }

    pub fn light(light: usize) -> Self {
        Self {
            light: Some(light),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn rotated(mut self, rotation: [f32; 4]) -> Self {
        self.rotation = Some(rotation);
        self
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<usize>) -> Self {
        self.children = children;
        self
    }
}

/// Builds glTF documents with one binary buffer.
#[derive(Debug, Default)]
pub struct GltfBuilder {
    bin: Vec<u8>,
    views: Vec<Value>,
    accessors: Vec<Value>,
    meshes: Vec<Value>,
    materials: Vec<Value>,
    images: Vec<Value>,
    textures: Vec<Value>,
    nodes: Vec<Value>,
    lights: Vec<Value>,
    roots: Option<Vec<usize>>,
    extensions_required: Vec<String>,
}

impl GltfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mesh and return its index.
    pub fn mesh(&mut self, primitives: &[PrimitiveSpec]) -> usize {
        let primitives: Vec<Value> = primitives.iter().map(|p| self.primitive(p)).collect();
        self.meshes.push(json!({ "primitives": primitives }));
        self.meshes.len() - 1
    }

    pub fn material(&mut self, spec: &MaterialSpec) -> usize {
        let mut pbr = json!({ "baseColorFactor": spec.base_color });
        if let Some(texture) = spec.texture {
            pbr["baseColorTexture"] = json!({ "index": texture });
        }
        let mut material = json!({
            "pbrMetallicRoughness": pbr,
            "alphaMode": spec.alpha_mode,
            "doubleSided": spec.double_sided,
        });
        if let Some(name) = &spec.name {
            material["name"] = json!(name);
        }
        self.materials.push(material);
        self.materials.len() - 1
    }

    /// Add a solid-colour PNG texture embedded in the binary buffer.
    pub fn solid_texture(&mut self, width: u32, height: u32, rgba: [u8; 4]) -> Result<usize> {
        let image = RgbaImage::from_pixel(width, height, Rgba(rgba));
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;
        Ok(self.encoded_texture(&png.into_inner(), "image/png"))
    }

    /// Add a texture from already encoded bytes, which need not be a valid image.
    pub fn encoded_texture(&mut self, bytes: &[u8], mime_type: &str) -> usize {
        let view = self.view(bytes, None);
        self.images
            .push(json!({ "bufferView": view, "mimeType": mime_type }));
        self.textures.push(json!({ "source": self.images.len() - 1 }));
        self.textures.len() - 1
    }

    /// Add a punctual light and return its index.
    pub fn light(&mut self, spec: &LightSpec) -> usize {
        let light = match *spec {
            LightSpec::Directional { color, intensity } => {
                json!({ "type": "directional", "color": color, "intensity": intensity })
            }
            LightSpec::Point { color, intensity, range } => {
                let mut light = json!({ "type": "point", "color": color, "intensity": intensity });
                if let Some(range) = range {
                    light["range"] = json!(range);
                }
                light
            }
            LightSpec::Spot { color, intensity, inner, outer } => json!({
                "type": "spot",
                "color": color,
                "intensity": intensity,
                "spot": { "innerConeAngle": inner, "outerConeAngle": outer },
            }),
        };
        self.lights.push(light);
        self.lights.len() - 1
    }

    pub fn node(&mut self, spec: &NodeSpec) -> usize {
        let mut node = json!({});
        if let Some(name) = &spec.name {
            node["name"] = json!(name);
        }
        if let Some(mesh) = spec.mesh {
            node["mesh"] = json!(mesh);
        }
        if let Some(light) = spec.light {
            node["extensions"] = json!({ "KHR_lights_punctual": { "light": light } });
        }
        if let Some(translation) = spec.translation {
            node["translation"] = json!(translation);
        }
        if let Some(rotation) = spec.rotation {
            node["rotation"] = json!(rotation);
        }
        if !spec.children.is_empty() {
            node["children"] = json!(spec.children);
        }
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Scene roots. Without this, every node that is no other node's child is a root.
    #[must_use]
    pub fn with_roots(mut self, roots: Vec<usize>) -> Self {
        self.roots = Some(roots);
        self
    }

    #[must_use]
    pub fn require_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions_required.push(name.into());
        self
    }

    /// The document as JSON. `uri` names the buffer file; GLB buffers have none.
    pub fn document(&self, uri: Option<&str>) -> Value {
        let mut buffer = json!({ "byteLength": self.bin.len() });
        if let Some(uri) = uri {
            buffer["uri"] = json!(uri);
        }
        let roots = self.roots.clone().unwrap_or_else(|| self.parentless_nodes());

        let mut root = json!({
            "asset": { "version": "2.0", "generator": "vse-test" },
            "scene": 0,
            "scenes": [{ "nodes": roots }],
            "nodes": self.nodes,
            "meshes": self.meshes,
            "accessors": self.accessors,
            "bufferViews": self.views,
            "buffers": [buffer],
        });
        if !self.materials.is_empty() {
            root["materials"] = json!(self.materials);
        }
        if !self.textures.is_empty() {
            root["images"] = json!(self.images);
            root["textures"] = json!(self.textures);
        }
        let mut used = self.extensions_required.clone();
        if !self.lights.is_empty() {
            root["extensions"] = json!({ "KHR_lights_punctual": { "lights": self.lights } });
            used.push("KHR_lights_punctual".to_string());
        }
        if !used.is_empty() {
            root["extensionsUsed"] = json!(used);
        }
        if !self.extensions_required.is_empty() {
            root["extensionsRequired"] = json!(self.extensions_required);
        }
        root
    }

    /// Binary glTF: a 12-byte header, the JSON chunk and the BIN chunk.
    pub fn to_glb(&self) -> Result<Vec<u8>> {
        let mut json = serde_json::to_vec(&self.document(None))?;
        pad(&mut json, b' ');
        let mut bin = self.bin.clone();
        pad(&mut bin, 0);

        let total = 12 + 8 + json.len() + 8 + bin.len();
        let mut out = Vec::with_capacity(total);
        push_u32(&mut out, GLB_MAGIC);
        push_u32(&mut out, 2);
        push_u32(&mut out, len_u32(total));
        push_u32(&mut out, len_u32(json.len()));
        push_u32(&mut out, CHUNK_JSON);
        out.extend_from_slice(&json);
        push_u32(&mut out, len_u32(bin.len()));
        push_u32(&mut out, CHUNK_BIN);
        out.extend_from_slice(&bin);
        Ok(out)
    }

    /// Write `<name>.gltf` with an external `<name>.bin` into `dir`.
    pub fn write_gltf(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        let bin_name = format!("{name}.bin");
        std::fs::write(dir.join(&bin_name), &self.bin)?;
        let path = dir.join(format!("{name}.gltf"));
        std::fs::write(&path, serde_json::to_vec_pretty(&self.document(Some(&bin_name)))?)?;
        Ok(path)
    }

    pub fn write_glb(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_glb()?)?;
        Ok(())
    }

    fn primitive(&mut self, spec: &PrimitiveSpec) -> Value {
        let (min, max) = bounds(&spec.positions);
        let position = self.float_accessor(&spec.positions, "VEC3", Some((min, max)));
        let mut attributes = json!({ "POSITION": position });
        if let Some(normals) = &spec.normals {
            attributes["NORMAL"] = json!(self.float_accessor(normals, "VEC3", None));
        }
        if let Some(uvs) = &spec.uvs {
            attributes["TEXCOORD_0"] = json!(self.float_accessor(uvs, "VEC2", None));
        }

        let mut primitive = json!({ "attributes": attributes });
        if let Some(indices) = &spec.indices {
            let bytes: Vec<u8> = indices.iter().flat_map(|i| i.to_le_bytes()).collect();
            let view = self.view(&bytes, Some(ELEMENT_ARRAY_BUFFER));
            self.accessors.push(json!({
                "bufferView": view,
                "componentType": UNSIGNED_INT,
                "count": indices.len(),
                "type": "SCALAR",
            }));
            primitive["indices"] = json!(self.accessors.len() - 1);
        }
        if let Some(material) = spec.material {
            primitive["material"] = json!(material);
        }
        primitive
    }

    fn float_accessor<const N: usize>(
        &mut self,
        data: &[[f32; N]],
        kind: &str,
        bounds: Option<([f32; 3], [f32; 3])>,
    ) -> usize {
        let bytes: Vec<u8> = data
            .iter()
            .flatten()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let view = self.view(&bytes, Some(ARRAY_BUFFER));
        let mut accessor = json!({
            "bufferView": view,
            "componentType": FLOAT,
            "count": data.len(),
            "type": kind,
        });
        if let Some((min, max)) = bounds {
            accessor["min"] = json!(min);
            accessor["max"] = json!(max);
        }
        self.accessors.push(accessor);
        self.accessors.len() - 1
    }

    fn view(&mut self, bytes: &[u8], target: Option<u32>) -> usize {
        pad(&mut self.bin, 0);
        let mut view = json!({
            "buffer": 0,
            "byteOffset": self.bin.len(),
            "byteLength": bytes.len(),
        });
        if let Some(target) = target {
            view["target"] = json!(target);
        }
        self.bin.extend_from_slice(bytes);
        self.views.push(view);
        self.views.len() - 1
    }

    fn parentless_nodes(&self) -> Vec<usize> {
        let children: Vec<u64> = self
            .nodes
            .iter()
            .filter_map(|n| n.get("children").and_then(Value::as_array))
            .flatten()
            .filter_map(Value::as_u64)
            .collect();
        (0..self.nodes.len())
            .filter(|&i| !children.contains(&(i as u64)))
            .collect()
    }
}

fn bounds(positions: &[[f32; 3]]) -> ([f32; 3], [f32; 3]) {
    if positions.is_empty() {
        return ([0.0; 3], [0.0; 3]);
    }
    let mut min = [f32::MAX; 3];
    let mut max = [f32::MIN; 3];
    for p in positions {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }
    (min, max)
}

fn pad(bytes: &mut Vec<u8>, fill: u8) {
    while bytes.len() % 4 != 0 {
        bytes.push(fill);
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
