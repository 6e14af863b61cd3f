//! Packing scene lights into the frame uniform.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use vse_scene::{LightKind, WorldLight};

/// Lights shaded per frame; must match `MAX_LIGHTS` in the mesh shaders.
pub const MAX_LIGHTS: usize = 16;

pub const KIND_DIRECTIONAL: f32 = 0.0;
pub const KIND_POINT: f32 = 1.0;
pub const KIND_SPOT: f32 = 2.0;

/// One light as read by the mesh fragment shader (std140, 64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    /// xyz position, w range (0 = unbounded)
    pub position_range: [f32; 4],
    /// xyz linear colour, w intensity
    pub color_intensity: [f32; 4],
    /// xyz direction of travel, w kind
    pub direction_kind: [f32; 4],
    /// x cos(inner), y cos(outer)
    pub cone: [f32; 4],
}

impl GpuLight {
    pub fn new(light: &WorldLight) -> Self {
        let color = light.light.color;
        let (kind, range, cone) = match light.light.kind {
            LightKind::Directional => (KIND_DIRECTIONAL, 0.0, [0.0; 4]),
            LightKind::Point { range } => (KIND_POINT, range, [0.0; 4]),
            LightKind::Spot {
                range,
                inner_angle,
                outer_angle,
            } => (
                KIND_SPOT,
                range,
                [inner_angle.cos(), outer_angle.cos(), 0.0, 0.0],
            ),
        };
        Self {
            position_range: light.position.extend(range).to_array(),
            color_intensity: color.extend(light.light.intensity).to_array(),
            direction_kind: light.direction.extend(kind).to_array(),
            cone,
        }
    }

    /// A directional light travelling along `direction`.
    pub fn sun(direction: Vec3, color: Vec3) -> Self {
        let direction = direction.try_normalize().unwrap_or(Vec3::NEG_Y);
        Self {
            color_intensity: color.extend(1.0).to_array(),
            direction_kind: direction.extend(KIND_DIRECTIONAL).to_array(),
            ..Self::default()
        }
    }
}

/// Choose the lights shaded this frame: directional lights first, then
/// positional lights nearest to `eye`. Ties keep scene order.
pub fn select_lights(lights: &[WorldLight], eye: Vec3) -> Vec<GpuLight> {
    let mut ranked: Vec<(bool, f32, usize)> = lights
        .iter()
        .enumerate()
        .map(|(index, light)| match light.light.kind {
            LightKind::Directional => (false, 0.0, index),
            _ => (true, light.position.distance_squared(eye), index),
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)).then(a.2.cmp(&b.2)));
    if ranked.len() > MAX_LIGHTS {
        tracing::trace!(
            "Shading {MAX_LIGHTS} of {} lights this frame",
            ranked.len()
        );
        ranked.truncate(MAX_LIGHTS);
    }
    ranked
        .into_iter()
        .map(|(_, _, index)| GpuLight::new(&lights[index]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Mat4;
    use vse_scene::Light;

    fn point_at(x: f32) -> WorldLight {
        Light::point(Vec3::ONE, 1.0, 4.0).placed(&Mat4::from_translation(Vec3::new(x, 0.0, 0.0)))
    }

    #[test]
    fn gpu_light_is_four_vec4() {
        assert_eq!(std::mem::size_of::<GpuLight>(), 64);
    }

    #[test]
    fn spot_cones_are_stored_as_cosines() {
        let spot = Light::spot(Vec3::X, 2.0, 9.0, 0.0, std::f32::consts::FRAC_PI_3)
            .placed(&Mat4::IDENTITY);
        let gpu = GpuLight::new(&spot);
        assert_eq!(gpu.direction_kind, [0.0, 0.0, -1.0, KIND_SPOT]);
        assert_eq!(gpu.position_range[3], 9.0);
        assert_eq!(gpu.color_intensity, [1.0, 0.0, 0.0, 2.0]);
        assert_relative_eq!(gpu.cone[0], 1.0);
        assert_relative_eq!(gpu.cone[1], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn directional_lights_come_first_then_nearest() {
        let sun = Light::directional(Vec3::ONE, 1.0).placed(&Mat4::IDENTITY);
        let lights = [point_at(8.0), point_at(-2.0), sun, point_at(3.0)];
        let selected = select_lights(&lights, Vec3::ZERO);
        let xs: Vec<f32> = selected.iter().map(|l| l.position_range[0]).collect();
        assert_eq!(selected[0].direction_kind[3], KIND_DIRECTIONAL);
        assert_eq!(xs[1..], [-2.0, 3.0, 8.0]);
    }

    #[test]
    fn selection_is_capped() {
        let lights: Vec<WorldLight> = (0..40).map(|i| point_at(i as f32)).collect();
        let selected = select_lights(&lights, Vec3::new(100.0, 0.0, 0.0));
        assert_eq!(selected.len(), MAX_LIGHTS);
        // The farthest lights are the ones dropped
        assert_eq!(selected[0].position_range[0], 39.0);
        assert!(selected.iter().all(|l| l.position_range[0] >= 24.0));
    }

    #[test]
    fn sun_normalizes_its_direction() {
        let sun = GpuLight::sun(Vec3::new(0.0, -2.0, 0.0), Vec3::ONE);
        assert_eq!(sun.direction_kind, [0.0, -1.0, 0.0, KIND_DIRECTIONAL]);
    }
}
