//! Constraints between bodies that may not be simulated yet
//!
//! A constraint is created pending, activated once on the simulation thread
//! when both endpoints are live, and removed either for good or into storage
//! when its chunk unloads.

mod dependency;
mod manager;
mod settings;
mod storage;

pub use dependency::DependencySystem;
pub use manager::{ActivationOutcome, ConstraintManager};
pub use settings::{
    ConstraintKind, ConstraintSettings, ConstraintSpace, DistanceSettings, FixedSettings,
    HingeSettings, PointSettings, SliderSettings,
};
pub use storage::{
    ConstraintStorage, FileStorage, FlushReport, FlushTicket, MemoryStorage, StorageBackend,
    StorageError,
};

use crate::body::BodyId;
use crate::coord::ChunkCoord;
use crate::engine::ConstraintHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("a constraint needs at least one non-world body")]
    WorldToWorld,
    #[error("constraint settings serialization failed: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstraintId(pub u128);

impl ConstraintId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// A constraint record
///
/// `settings_data` is the encoded per-kind settings and only decodes together
/// with `kind`. `handle` is set while the constraint is realized in the engine
/// and never persisted.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Constraint {
    pub id: ConstraintId,
    pub body_a: BodyId,
    pub body_b: BodyId,
    pub kind: ConstraintKind,
    pub settings_data: Vec<u8>,
    /// Chunk the constraint was last persisted under
    pub home_chunk: Option<ChunkCoord>,
    #[serde(skip)]
    pub handle: Option<ConstraintHandle>,
}

impl Constraint {
    /// New constraint with a random id; settings are encoded immediately
    pub fn new(
        settings: &ConstraintSettings,
        body_a: BodyId,
        body_b: BodyId,
    ) -> Result<Self, ConstraintError> {
        if body_a.is_world() && body_b.is_world() {
            return Err(ConstraintError::WorldToWorld);
        }
        Ok(Self {
            id: ConstraintId::random(),
            body_a,
            body_b,
            kind: settings.kind(),
            settings_data: settings.encode()?,
            home_chunk: None,
            handle: None,
        })
    }

    pub fn settings(&self) -> Result<ConstraintSettings, ConstraintError> {
        ConstraintSettings::decode(self.kind, &self.settings_data)
    }

    /// Replace the stored settings, e.g. with the engine's body-local form
    pub fn update_settings(&mut self, settings: &ConstraintSettings) -> Result<(), ConstraintError> {
        self.settings_data = settings.encode()?;
        self.kind = settings.kind();
        Ok(())
    }

    pub fn references(&self, body: BodyId) -> bool {
        self.body_a == body || self.body_b == body
    }

    /// The first endpoint that is a real body
    pub fn primary_body(&self) -> Option<BodyId> {
        [self.body_a, self.body_b].into_iter().find(|b| !b.is_world())
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }
}
