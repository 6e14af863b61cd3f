//! Punctual lights attached to scene entities.
//!
//! A light takes its position from the entity's world translation and, for
//! directional and spot lights, its direction from the entity's forward axis
//! (`-Z` in local space).

use glam::{Mat4, Vec3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Directional,
    /// `range` of zero means unbounded.
    Point { range: f32 },
    /// Cone angles in radians from the light's axis.
    Spot {
        range: f32,
        inner_angle: f32,
        outer_angle: f32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    /// Linear RGB.
    pub color: Vec3,
    pub intensity: f32,
}

impl Light {
    pub const fn directional(color: Vec3, intensity: f32) -> Self {
        Self {
            kind: LightKind::Directional,
            color,
            intensity,
        }
    }

    pub const fn point(color: Vec3, intensity: f32, range: f32) -> Self {
        Self {
            kind: LightKind::Point { range },
            color,
            intensity,
        }
    }

    pub const fn spot(
        color: Vec3,
        intensity: f32,
        range: f32,
        inner_angle: f32,
        outer_angle: f32,
    ) -> Self {
        Self {
            kind: LightKind::Spot {
                range,
                inner_angle,
                outer_angle,
            },
            color,
            intensity,
        }
    }

    /// Finite, non-negative parameters and a cone that opens outwards.
    pub fn is_valid(&self) -> bool {
        let base = self.color.is_finite()
            && self.color.min_element() >= 0.0
            && self.intensity.is_finite()
            && self.intensity >= 0.0;
        let range_ok = |range: f32| range.is_finite() && range >= 0.0;
        base && match self.kind {
            LightKind::Directional => true,
            LightKind::Point { range } => range_ok(range),
            LightKind::Spot {
                range,
                inner_angle,
                outer_angle,
            } => {
                range_ok(range)
                    && inner_angle >= 0.0
                    && inner_angle <= outer_angle
                    && outer_angle <= std::f32::consts::FRAC_PI_2
            }
        }
    }

    /// Place the light with an entity's world matrix.
    pub fn placed(&self, world: &Mat4) -> WorldLight {
        let direction = world
            .transform_vector3(Vec3::NEG_Z)
            .try_normalize()
            .unwrap_or(Vec3::NEG_Z);
        WorldLight {
            light: *self,
            position: world.transform_point3(Vec3::ZERO),
            direction,
        }
    }
}

/// A light resolved to world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldLight {
    pub light: Light,
    pub position: Vec3,
    /// Unit direction the light travels.
    pub direction: Vec3,
}
