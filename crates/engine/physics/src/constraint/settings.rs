//! Constraint settings and their tagged byte encoding
//!
//! Persisted constraints carry a [`ConstraintKind`] discriminant next to an
//! opaque payload. The payload is the bincode encoding of the per-kind settings
//! struct, so it can only be decoded together with its tag. That keeps the
//! store ignorant of engine details while still letting a constraint be rebuilt
//! without a live instance.

use super::ConstraintError;
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Discriminant of a constraint type
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConstraintKind {
    Fixed = 0,
    Hinge = 1,
    Slider = 2,
    Point = 3,
    Distance = 4,
}

/// Coordinate space the anchor points and axes are expressed in
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ConstraintSpace {
    /// Anchors are world-space positions; the engine converts them on creation
    WorldSpace,
    /// Anchors are relative to each body's frame
    LocalToBody,
}

#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct FixedSettings {
    pub space: ConstraintSpace,
    pub point1: Vec3,
    pub point2: Vec3,
}

#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct HingeSettings {
    pub space: ConstraintSpace,
    pub point1: Vec3,
    pub point2: Vec3,
    pub axis1: Vec3,
    pub axis2: Vec3,
    /// Angular limits in radians
    pub limits: Option<[f32; 2]>,
}

#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct SliderSettings {
    pub space: ConstraintSpace,
    pub point1: Vec3,
    pub point2: Vec3,
    pub axis1: Vec3,
    pub axis2: Vec3,
    /// Translation limits along the axis
    pub limits: Option<[f32; 2]>,
}

#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct PointSettings {
    pub space: ConstraintSpace,
    pub point1: Vec3,
    pub point2: Vec3,
}

#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct DistanceSettings {
    pub space: ConstraintSpace,
    pub point1: Vec3,
    pub point2: Vec3,
    pub max_distance: f32,
}

/// Settings for any supported constraint kind
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum ConstraintSettings {
    Fixed(FixedSettings),
    Hinge(HingeSettings),
    Slider(SliderSettings),
    Point(PointSettings),
    Distance(DistanceSettings),
}

impl ConstraintSettings {
    pub fn kind(&self) -> ConstraintKind {
        match self {
            Self::Fixed(_) => ConstraintKind::Fixed,
            Self::Hinge(_) => ConstraintKind::Hinge,
            Self::Slider(_) => ConstraintKind::Slider,
            Self::Point(_) => ConstraintKind::Point,
            Self::Distance(_) => ConstraintKind::Distance,
        }
    }

    pub fn space(&self) -> ConstraintSpace {
        match self {
            Self::Fixed(s) => s.space,
            Self::Hinge(s) => s.space,
            Self::Slider(s) => s.space,
            Self::Point(s) => s.space,
            Self::Distance(s) => s.space,
        }
    }

    /// Anchor points for both sides
    pub fn anchors(&self) -> (Vec3, Vec3) {
        match self {
            Self::Fixed(s) => (s.point1, s.point2),
            Self::Hinge(s) => (s.point1, s.point2),
            Self::Slider(s) => (s.point1, s.point2),
            Self::Point(s) => (s.point1, s.point2),
            Self::Distance(s) => (s.point1, s.point2),
        }
    }

    /// Encode the per-kind payload. The kind is stored separately.
    pub fn encode(&self) -> Result<Vec<u8>, ConstraintError> {
        let bytes = match self {
            Self::Fixed(s) => bincode::serialize(s),
            Self::Hinge(s) => bincode::serialize(s),
            Self::Slider(s) => bincode::serialize(s),
            Self::Point(s) => bincode::serialize(s),
            Self::Distance(s) => bincode::serialize(s),
        };
        bytes.map_err(|e| ConstraintError::Serialization(e.to_string()))
    }

    /// Decode a payload previously produced by [`ConstraintSettings::encode`]
    pub fn decode(kind: ConstraintKind, data: &[u8]) -> Result<Self, ConstraintError> {
        let settings = match kind {
            ConstraintKind::Fixed => bincode::deserialize(data).map(Self::Fixed),
            ConstraintKind::Hinge => bincode::deserialize(data).map(Self::Hinge),
            ConstraintKind::Slider => bincode::deserialize(data).map(Self::Slider),
            ConstraintKind::Point => bincode::deserialize(data).map(Self::Point),
            ConstraintKind::Distance => bincode::deserialize(data).map(Self::Distance),
        };
        settings.map_err(|e| ConstraintError::Serialization(format!("{kind:?}: {e}")))
    }
}
