//! Short-lived cosmetic block transforms.
//!
//! Two kinds of track share one record: a spawn animation eases a block
//! proxy from a start transform to its target cell and writes the block on
//! expiry, and a physics-driven despawn follows a host-owned rigid body
//! until its lifetime runs out. Animations never mutate the world before
//! they expire.

use crate::{
    render::BlockRenderProxy,
    transform::Transform,
    world::{
        block::{BlockValue, Rotation},
        BlockPos,
    },
};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum Easing {
    #[default]
    Linear,
    QuadraticIn,
    QuadraticOut,
    QuadraticInOut,
}

impl Easing {
    pub fn apply(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::QuadraticIn => t * t,
            Easing::QuadraticOut => t * (2.0 - t),
            Easing::QuadraticInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    let t = 2.0 * t - 1.0;
                    0.5 * (1.0 - (1.0 - t) * (1.0 - t)) + 0.5
                }
            }
        }
    }
}

/// Opaque handle into the host's physics engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PhysicsBodyHandle(pub u64);

pub enum AnimationDriver {
    /// Interpolates between two transforms over the lifetime.
    Eased {
        start: Transform,
        end: Transform,
        easing: Easing,
    },
    /// Follows a host-owned rigid body; the host pushes transforms each
    /// frame via [`BlockAnimation::set_body_transform`] lookups on the world.
    Physics { body: PhysicsBodyHandle },
}

pub struct BlockAnimation {
    pub value: BlockValue,
    pub rotation: Rotation,
    pub target: BlockPos,
    pub proxy: Arc<BlockRenderProxy>,
    pub lifetime: f32,
    pub remaining: f32,
    pub driver: AnimationDriver,
    /// Write the block into the world when the animation expires (spawn
    /// animations); explosion debris just disappears.
    pub set_on_expiry: bool,
    pub current: Transform,
}

impl BlockAnimation {
    /// Progress in [0, 1], where 1 is expiry.
    pub fn progress(&self) -> f32 {
        if self.lifetime <= 0.0 {
            return 1.0;
        }
        (1.0 - self.remaining / self.lifetime).clamp(0.0, 1.0)
    }

    /// Advances the clock and refreshes the current transform. Returns true
    /// once the animation has expired.
    pub fn advance(&mut self, dt: f32) -> bool {
        self.remaining -= dt;
        match &self.driver {
            AnimationDriver::Eased { start, end, easing } => {
                self.current = start.interpolate(end, easing.apply(self.progress()));
            }
            AnimationDriver::Physics { .. } => {
                // the host pushes body transforms separately
            }
        }
        self.proxy.set_transform(self.current.to_matrix());
        self.remaining <= 0.0
    }

    pub fn set_body_transform(&mut self, body: PhysicsBodyHandle, transform: Transform) -> bool {
        match self.driver {
            AnimationDriver::Physics { body: own } if own == body => {
                self.current = transform;
                true
            }
            _ => false,
        }
    }
}
