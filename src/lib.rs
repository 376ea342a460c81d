use nalgebra::{vector, Vector3};
use num_traits::{One, Zero};
use serde_derive::{Deserialize, Serialize};
use std::ops::Neg;

pub mod aabb;
pub mod codec;
pub mod collision;
pub mod config;
pub mod mesher;
pub mod render;
pub mod transform;
pub mod util;
pub mod world;

pub mod math {
    pub use nalgebra::{Matrix3, Matrix4, Point1, Point2, Point3, Vector2, Vector3, Vector4};
}

pub mod prelude {
    pub use super::util;

    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
    pub use anyhow::{anyhow, bail};

    pub use nalgebra::{point, vector};
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

/// Six faces of a cube. The world is Z-up: `Top` faces +Z, `Back` faces +Y.
///
/// The discriminant order is load-bearing: face masks store one bit per face
/// at `1 << side.index()`, and collision part ids reuse the same numbering.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Side {
    /// Positive X.
    Right = 0,
    /// Negative X.
    Left = 1,
    /// Positive Y.
    Back = 2,
    /// Negative Y.
    Front = 3,
    /// Positive Z.
    Top = 4,
    /// Negative Z.
    Bottom = 5,
}

pub const SIDE_COUNT: usize = 6;

impl Side {
    pub const ALL: [Side; SIDE_COUNT] = [
        Side::Right,
        Side::Left,
        Side::Back,
        Side::Front,
        Side::Top,
        Side::Bottom,
    ];

    #[inline(always)]
    pub fn index(&self) -> usize {
        *self as usize
    }

    #[inline(always)]
    pub fn bit(&self) -> u8 {
        1 << self.index()
    }

    pub fn facing_positive(&self) -> bool {
        matches!(self, Side::Right | Side::Back | Side::Top)
    }

    pub fn normal<S: nalgebra::Scalar + One + Zero + Neg<Output = S>>(&self) -> Vector3<S> {
        match *self {
            Side::Right => vector!(S::one(), S::zero(), S::zero()),
            Side::Left => vector!(-S::one(), S::zero(), S::zero()),
            Side::Back => vector!(S::zero(), S::one(), S::zero()),
            Side::Front => vector!(S::zero(), -S::one(), S::zero()),
            Side::Top => vector!(S::zero(), S::zero(), S::one()),
            Side::Bottom => vector!(S::zero(), S::zero(), -S::one()),
        }
    }

    pub fn axis(&self) -> Axis {
        match self {
            Side::Left | Side::Right => Axis::X,
            Side::Front | Side::Back => Axis::Y,
            Side::Top | Side::Bottom => Axis::Z,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Right => Side::Left,
            Side::Left => Side::Right,
            Side::Back => Side::Front,
            Side::Front => Side::Back,
            Side::Top => Side::Bottom,
            Side::Bottom => Side::Top,
        }
    }

    pub fn enumerate<F>(mut func: F)
    where
        F: FnMut(Side),
    {
        for side in Side::ALL {
            func(side);
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Faces<T> {
    pub top: T,
    pub bottom: T,
    pub right: T,
    pub left: T,
    pub front: T,
    pub back: T,
}

impl<T> Faces<T> {
    pub fn uniform(value: T) -> Self
    where
        T: Clone,
    {
        Faces {
            top: value.clone(),
            bottom: value.clone(),
            right: value.clone(),
            left: value.clone(),
            front: value.clone(),
            back: value,
        }
    }

    pub fn map<U, F>(self, mut func: F) -> Faces<U>
    where
        F: FnMut(T) -> U,
    {
        Faces {
            top: func(self.top),
            bottom: func(self.bottom),
            left: func(self.left),
            right: func(self.right),
            front: func(self.front),
            back: func(self.back),
        }
    }

    pub fn all<F>(&self, mut func: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        func(&self.top)
            && func(&self.bottom)
            && func(&self.left)
            && func(&self.right)
            && func(&self.front)
            && func(&self.back)
    }

    pub fn any<F>(&self, mut func: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        func(&self.top)
            || func(&self.bottom)
            || func(&self.left)
            || func(&self.right)
            || func(&self.front)
            || func(&self.back)
    }
}

impl<T> std::ops::Index<Side> for Faces<T> {
    type Output = T;

    fn index(&self, index: Side) -> &Self::Output {
        match index {
            Side::Top => &self.top,
            Side::Bottom => &self.bottom,
            Side::Right => &self.right,
            Side::Left => &self.left,
            Side::Front => &self.front,
            Side::Back => &self.back,
        }
    }
}

impl<T> std::ops::IndexMut<Side> for Faces<T> {
    fn index_mut(&mut self, index: Side) -> &mut Self::Output {
        match index {
            Side::Top => &mut self.top,
            Side::Bottom => &mut self.bottom,
            Side::Right => &mut self.right,
            Side::Left => &mut self.left,
            Side::Front => &mut self.front,
            Side::Back => &mut self.back,
        }
    }
}
