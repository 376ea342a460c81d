use nalgebra::{vector, Matrix4, Point3, Translation3, UnitQuaternion, Vector3};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Transform {
    pub translation: Translation3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Transform {
    pub fn to(point: Point3<f32>) -> Self {
        Self {
            translation: Translation3::from(point),
            ..Default::default()
        }
    }

    pub fn with_rotation(mut self, rotation: UnitQuaternion<f32>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_scale(mut self, scale: Vector3<f32>) -> Self {
        self.scale = scale;
        self
    }

    pub fn pos(&self) -> Point3<f32> {
        self.translation.vector.into()
    }

    pub fn to_matrix(&self) -> Matrix4<f32> {
        self.rotation
            .to_homogeneous()
            .append_translation(&self.translation.vector)
            .prepend_nonuniform_scaling(&self.scale)
    }

    /// Component-wise interpolation: lerped translation and scale, slerped
    /// rotation.
    pub fn interpolate(&self, other: &Transform, t: f32) -> Transform {
        Transform {
            translation: Translation3::from(
                self.translation.vector.lerp(&other.translation.vector, t),
            ),
            rotation: self.rotation.slerp(&other.rotation, t),
            scale: self.scale.lerp(&other.scale, t),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform {
            translation: Translation3::from(vector!(0.0, 0.0, 0.0)),
            rotation: UnitQuaternion::identity(),
            scale: vector!(1.0, 1.0, 1.0),
        }
    }
}

impl From<Point3<f32>> for Transform {
    fn from(point: Point3<f32>) -> Self {
        Transform::to(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::point;

    #[test]
    fn interpolation_endpoints() {
        let a = Transform::to(point![0.0, 0.0, 0.0]);
        let b = Transform::to(point![2.0, 4.0, 6.0]).with_scale(vector![2.0, 2.0, 2.0]);
        assert_relative_eq!(a.interpolate(&b, 0.0).pos(), a.pos());
        assert_relative_eq!(a.interpolate(&b, 1.0).pos(), b.pos());
        assert_relative_eq!(a.interpolate(&b, 0.5).pos(), point![1.0, 2.0, 3.0]);
    }

    #[test]
    fn matrix_applies_scale_then_rotation_then_translation() {
        let transform = Transform::to(point![1.0, 0.0, 0.0])
            .with_rotation(UnitQuaternion::from_euler_angles(
                0.0,
                0.0,
                std::f32::consts::FRAC_PI_2,
            ))
            .with_scale(vector![2.0, 2.0, 2.0]);
        let out = transform.to_matrix().transform_point(&point![1.0, 0.0, 0.0]);
        assert_relative_eq!(out, point![1.0, 2.0, 0.0], epsilon = 1e-5);
    }
}
