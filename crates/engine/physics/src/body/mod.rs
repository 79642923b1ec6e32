//! Persistent body identity and spatial grouping

mod chunk_manager;
mod registry;

pub use chunk_manager::{ChunkManager, MovementListener};
pub use registry::BodyRegistry;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a simulated body
///
/// Survives engine handle churn and persistence. `BodyId::WORLD` is the
/// sentinel for "anchored to the static world" in constraints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BodyId(pub u128);

impl BodyId {
    pub const WORLD: Self = Self(0);

    /// Fresh random identifier, never `WORLD`
    pub fn random() -> Self {
        loop {
            let id = rand::random::<u128>();
            if id != 0 {
                return Self(id);
            }
        }
    }

    #[inline]
    pub fn is_world(&self) -> bool {
        *self == Self::WORLD
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_world() {
            write!(f, "world")
        } else {
            write!(f, "{:032x}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_not_world() {
        for _ in 0..64 {
            assert!(!BodyId::random().is_world());
        }
        assert_ne!(BodyId::random(), BodyId::random());
    }

    #[test]
    fn test_display() {
        assert_eq!(BodyId::WORLD.to_string(), "world");
        assert_eq!(BodyId(0xab).to_string().len(), 32);
    }
}
