//! Math utilities and helpers.

use glam::{Mat4, Quat, Vec3, Vec4};

/// Local transform of a scene node (translation, rotation, scale).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    /// Create a pure translation.
    #[inline]
    pub const fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }

    /// Decompose an affine matrix.
    #[inline]
    pub fn from_matrix(matrix: Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self {
            translation,
            rotation,
            scale,
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Compose into a column-major matrix (scale, then rotate, then translate).
    #[inline]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.translation.is_finite() && self.rotation.is_finite() && self.scale.is_finite()
    }
}

/// Axis-Aligned Bounding Box.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// An inverted box that any `expand_to_include` call replaces.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Create a new AABB from min and max corners
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing every point, `None` for an empty iterator.
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut aabb = Self::EMPTY;
        let mut any = false;
        for point in points {
            aabb.expand_to_include(point);
            any = true;
        }
        any.then_some(aabb)
    }

    /// Get the center of the AABB
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the size of the AABB
    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Check if a point is inside the AABB
    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Check if this AABB intersects another
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min.cmple(other.max).all() && self.max.cmpge(other.min).all()
    }

    /// Expand AABB to include a point
    #[inline]
    pub fn expand_to_include(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Merge two AABBs
    #[inline]
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Bounds of this box after an affine transform.
    #[must_use]
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        // Arvo's method: project each axis extent through the matrix.
        let center = matrix.transform_point3(self.center());
        let half = self.size() * 0.5;
        let abs = Mat4::from_cols(
            matrix.x_axis.abs(),
            matrix.y_axis.abs(),
            matrix.z_axis.abs(),
            Vec4::W,
        );
        let extent = abs.transform_vector3(half);
        Self {
            min: center - extent,
            max: center + extent,
        }
    }
}

/// Frustum for culling operations.
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
    /// Six frustum planes (left, right, bottom, top, near, far)
    /// Each plane is (nx, ny, nz, d) where n is normal and d is distance
    pub planes: [Vec4; 6],
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix with a `[0, 1]` depth range.
    pub fn from_view_projection(vp: Mat4) -> Self {
        let row0 = vp.row(0);
        let row1 = vp.row(1);
        let row2 = vp.row(2);
        let row3 = vp.row(3);

        let planes = [
            row3 + row0, // Left
            row3 - row0, // Right
            row3 + row1, // Bottom
            row3 - row1, // Top
            row2,        // Near
            row3 - row2, // Far
        ]
        .map(|plane| plane / plane.truncate().length());

        Self { planes }
    }

    /// Test if an AABB is inside or intersects the frustum
    pub fn test_aabb(&self, aabb: &Aabb) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();
            // Positive vertex: the corner furthest along the plane normal.
            let p = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            normal.dot(p) + plane.w >= 0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn transform_round_trips_through_matrix() {
        let t = Transform::from_translation(Vec3::new(1.0, 2.0, 3.0))
            .with_rotation(Quat::from_rotation_y(0.5))
            .with_scale(Vec3::splat(2.0));
        let back = Transform::from_matrix(t.to_matrix());
        assert_relative_eq!(back.translation.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(back.scale.y, 2.0, epsilon = 1e-5);
        assert_relative_eq!(back.rotation.dot(t.rotation).abs(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn aabb_contains_point() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.contains_point(Vec3::splat(0.5)));
        assert!(aabb.contains_point(Vec3::ZERO));
        assert!(aabb.contains_point(Vec3::ONE));
        assert!(!aabb.contains_point(Vec3::new(2.0, 0.5, 0.5)));
    }

    #[test]
    fn aabb_from_points_and_transform() {
        assert!(Aabb::from_points(std::iter::empty()).is_none());

        let aabb = Aabb::from_points([Vec3::splat(-1.0), Vec3::splat(1.0)]).unwrap();
        let moved = aabb.transformed(&Mat4::from_translation(Vec3::X * 10.0));
        assert_relative_eq!(moved.min.x, 9.0);
        assert_relative_eq!(moved.max.x, 11.0);

        let rotated = aabb.transformed(&Mat4::from_rotation_z(std::f32::consts::FRAC_PI_4));
        assert_relative_eq!(rotated.max.x, std::f32::consts::SQRT_2, epsilon = 1e-5);
    }

    #[test]
    fn frustum_culls_boxes_behind_camera() {
        let view = Mat4::look_to_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_view_projection(proj * view);

        let ahead = Aabb::new(Vec3::new(-1.0, -1.0, -11.0), Vec3::new(1.0, 1.0, -9.0));
        let behind = Aabb::new(Vec3::new(-1.0, -1.0, 9.0), Vec3::new(1.0, 1.0, 11.0));
        let too_far = Aabb::new(Vec3::new(-1.0, -1.0, -300.0), Vec3::new(1.0, 1.0, -200.0));

        assert!(frustum.test_aabb(&ahead));
        assert!(!frustum.test_aabb(&behind));
        assert!(!frustum.test_aabb(&too_far));
    }
}
