use crate::util;
use nalgebra::{point, vector, Point3, Vector3};

#[rustfmt::skip]
fn spans_overlap(amin: f32, amax: f32, bmin: f32, bmax: f32) -> bool {
    util::is_between(bmin, amin, amax) || util::is_between(amin, bmin, bmax) ||
    util::is_between(bmax, amin, amax) || util::is_between(amax, bmin, bmax)
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Point3<f32>,
    pub max: Point3<f32>,
}

impl Aabb {
    pub fn new(min: Point3<f32>, max: Point3<f32>) -> Self {
        Aabb { min, max }
    }

    pub fn with_dimensions(dims: Vector3<f32>) -> Self {
        let half_dims = dims / 2.0;
        Aabb {
            min: Point3::from(-half_dims),
            max: Point3::from(half_dims),
        }
    }

    #[rustfmt::skip]
    pub fn contains(&self, point: &Point3<f32>) -> bool {
        util::is_within(point.x, self.min.x, self.max.x) &&
        util::is_within(point.y, self.min.y, self.max.y) &&
        util::is_within(point.z, self.min.z, self.max.z)
    }

    #[rustfmt::skip]
    pub fn intersects(&self, other: &Aabb) -> bool {
        spans_overlap(self.min.x, self.max.x, other.min.x, other.max.x) &&
        spans_overlap(self.min.y, self.max.y, other.min.y, other.max.y) &&
        spans_overlap(self.min.z, self.max.z, other.min.z, other.max.z)
    }

    pub fn dimensions(&self) -> Vector3<f32> {
        vector![
            self.max.x - self.min.x,
            self.max.y - self.min.y,
            self.max.z - self.min.z
        ]
    }

    pub fn center(&self) -> Point3<f32> {
        self.min + self.dimensions() / 2.0
    }

    pub fn translated(&self, translation: Vector3<f32>) -> Aabb {
        Aabb {
            min: self.min + translation,
            max: self.max + translation,
        }
    }

    pub fn inflate(&self, distance: f32) -> Aabb {
        Aabb {
            min: self.min - vector![distance, distance, distance],
            max: self.max + vector![distance, distance, distance],
        }
    }

    pub fn union_point(&self, point: &Point3<f32>) -> Aabb {
        Aabb {
            min: point![
                util::min(self.min.x, point.x),
                util::min(self.min.y, point.y),
                util::min(self.min.z, point.z)
            ],
            max: point![
                util::max(self.max.x, point.x),
                util::max(self.max.y, point.y),
                util::max(self.max.z, point.z)
            ],
        }
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        self.union_point(&other.min).union_point(&other.max)
    }

    /// Slab-method ray intersection; returns the entry distance along the
    /// ray, or `None` when the ray misses the box entirely.
    pub fn intersect_ray(&self, origin: Point3<f32>, direction: Vector3<f32>) -> Option<f32> {
        let mut t_enter = f32::NEG_INFINITY;
        let mut t_exit = f32::INFINITY;

        for axis in 0..3 {
            if direction[axis] == 0.0 {
                if origin[axis] < self.min[axis] || origin[axis] > self.max[axis] {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / direction[axis];
            let t0 = (self.min[axis] - origin[axis]) * inv;
            let t1 = (self.max[axis] - origin[axis]) * inv;
            let (near, far) = if t0 < t1 { (t0, t1) } else { (t1, t0) };
            t_enter = util::max(t_enter, near);
            t_exit = util::min(t_exit, far);
            if t_enter > t_exit {
                return None;
            }
        }

        if t_exit < 0.0 {
            return None;
        }
        Some(util::max(t_enter, 0.0))
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sphere {
    pub center: Point3<f32>,
    pub radius: f32,
}

impl Sphere {
    pub fn enclosing(aabb: &Aabb) -> Self {
        let center = aabb.center();
        Sphere {
            center,
            radius: (aabb.max - center).norm(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_box() -> Aabb {
        Aabb::new(point![0.0, 0.0, 0.0], point![1.0, 1.0, 1.0])
    }

    #[test]
    fn union_grows_bounds() {
        let grown = unit_box().union_point(&point![2.0, -1.0, 0.5]);
        assert_eq!(grown.min, point![0.0, -1.0, 0.0]);
        assert_eq!(grown.max, point![2.0, 1.0, 1.0]);
    }

    #[test]
    fn ray_hits_front_face() {
        let t = unit_box()
            .intersect_ray(point![0.5, -2.0, 0.5], vector![0.0, 1.0, 0.0])
            .unwrap();
        assert_relative_eq!(t, 2.0);
    }

    #[test]
    fn ray_starting_inside_reports_zero() {
        let t = unit_box()
            .intersect_ray(point![0.5, 0.5, 0.5], vector![0.0, 0.0, 1.0])
            .unwrap();
        assert_relative_eq!(t, 0.0);
    }

    #[test]
    fn ray_parallel_outside_misses() {
        assert!(unit_box()
            .intersect_ray(point![2.0, -2.0, 0.5], vector![0.0, 1.0, 0.0])
            .is_none());
    }

    #[test]
    fn enclosing_sphere_touches_corners() {
        let sphere = Sphere::enclosing(&unit_box());
        assert_eq!(sphere.center, point![0.5, 0.5, 0.5]);
        assert_relative_eq!(sphere.radius, (0.75f32).sqrt());
    }
}
