//! Camera and view management.

use glam::{Mat4, Vec3};
use vse_core::{Aabb, Frustum};

/// Perspective camera with a `[0, 1]` depth range.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    pub fn look_at(&mut self, target: Vec3) {
        let direction = target - self.position;
        if direction.length_squared() > f32::EPSILON {
            self.direction = direction.normalize();
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        if aspect.is_finite() && aspect > 0.0 {
            self.aspect = aspect;
        }
    }

    /// Place the camera so `bounds` fills the view, looking along the current direction.
    pub fn frame_bounds(&mut self, bounds: &Aabb) {
        let radius = (bounds.size().length() * 0.5).max(0.01);
        let distance = radius / (self.fov * 0.5).sin();
        let center = bounds.center();
        self.position = center - self.direction * distance;
        self.near = (distance - radius).max(distance * 0.001);
        self.far = distance + radius * 2.0;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Extract frustum planes from the current camera state.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection_matrix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frustum_contains_what_the_camera_faces() {
        let camera = Camera::default();
        let frustum = camera.frustum();
        assert!(frustum.test_aabb(&Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))));
        let behind = Aabb::new(Vec3::new(-0.5, -0.5, 9.0), Vec3::new(0.5, 0.5, 10.0));
        assert!(!frustum.test_aabb(&behind));
    }

    #[test]
    fn framed_bounds_are_visible() {
        let mut camera = Camera::default();
        let bounds = Aabb::new(Vec3::new(100.0, 0.0, 0.0), Vec3::new(140.0, 20.0, 10.0));
        camera.frame_bounds(&bounds);
        assert!(camera.frustum().test_aabb(&bounds));
        assert!(camera.near > 0.0 && camera.near < camera.far);
    }
}
