//! Physics engine seam
//!
//! The core never talks to a physics library directly. Everything that mutates
//! the simulation goes through [`PhysicsEngine`], and every call is made from
//! the simulation thread (see [`crate::simulation`]). Engine handles are opaque
//! integers to the rest of the crate.

mod rapier;

pub use rapier::RapierEngine;

use crate::constraint::ConstraintSettings;
use glam::Vec3;
use rapier3d::geometry::SharedShape;
use std::fmt;
use thiserror::Error;

/// Opaque engine body identifier
///
/// `BodyHandle::UNUSED` marks "no body" in atomic storage.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct BodyHandle(pub u64);

impl BodyHandle {
    pub const UNUSED: Self = Self(0);

    /// Pack an arena index and generation. The generation is offset by one so a
    /// packed handle is never zero.
    pub fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self(((generation as u64 + 1) << 32) | index as u64)
    }

    /// Inverse of [`BodyHandle::from_raw_parts`], `None` for `UNUSED`
    pub fn into_raw_parts(self) -> Option<(u32, u32)> {
        if self.is_unused() {
            return None;
        }
        let generation = ((self.0 >> 32) as u32).wrapping_sub(1);
        Some((self.0 as u32, generation))
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BodyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body#{:x}", self.0)
    }
}

/// Opaque engine constraint identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConstraintHandle(pub u64);

impl ConstraintHandle {
    pub fn from_raw_parts(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    pub fn into_raw_parts(self) -> (u32, u32) {
        (self.0 as u32, (self.0 >> 32) as u32)
    }
}

/// Description of a dynamic box body
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BodyDesc {
    pub position: Vec3,
    pub half_extents: Vec3,
    pub density: f32,
}

impl BodyDesc {
    pub fn cuboid(position: Vec3, half_extents: Vec3) -> Self {
        Self {
            position,
            half_extents,
            density: 1.0,
        }
    }
}

/// Engine refused to create or modify something
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown body {0}")]
    UnknownBody(BodyHandle),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error("invalid constraint settings: {0}")]
    InvalidSettings(String),
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

/// Operations the core needs from a physics engine
///
/// Implementations are owned by the simulation thread and never shared, so
/// methods take `&mut self` freely.
pub trait PhysicsEngine: Send {
    /// Create a static body at `origin` with a compiled terrain shape
    fn create_static_body(
        &mut self,
        origin: Vec3,
        shape: &SharedShape,
    ) -> Result<BodyHandle, EngineError>;

    /// Replace the collision shape of an existing body
    fn set_body_shape(&mut self, body: BodyHandle, shape: &SharedShape)
        -> Result<(), EngineError>;

    /// Create a dynamic box body
    fn create_dynamic_body(&mut self, desc: &BodyDesc) -> Result<BodyHandle, EngineError>;

    /// Remove a body and everything attached to it. Unknown handles are ignored.
    fn remove_body(&mut self, body: BodyHandle);

    /// Current world-space position of a body
    fn body_position(&self, body: BodyHandle) -> Option<Vec3>;

    /// Realize a constraint between two bodies
    ///
    /// `None` anchors that side to the static world.
    fn create_constraint(
        &mut self,
        settings: &ConstraintSettings,
        body_a: Option<BodyHandle>,
        body_b: Option<BodyHandle>,
    ) -> Result<ConstraintHandle, EngineError>;

    /// Settings of a live constraint as the engine stores them (body-local)
    fn constraint_settings(&self, constraint: ConstraintHandle) -> Option<ConstraintSettings>;

    /// Remove a live constraint. Unknown handles are ignored.
    fn remove_constraint(&mut self, constraint: ConstraintHandle);

    /// Dynamic bodies whose center lies within `radius` of `center`, as of the
    /// last step
    fn bodies_in_sphere(&self, center: Vec3, radius: f32) -> Vec<(BodyHandle, Vec3)>;

    /// Apply an instantaneous impulse at a body's center of mass
    fn apply_impulse(&mut self, body: BodyHandle, impulse: Vec3);

    /// Advance the simulation by `dt` seconds
    fn step(&mut self, dt: f32);
}
