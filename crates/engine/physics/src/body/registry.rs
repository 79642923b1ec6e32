use super::BodyId;
use crate::engine::BodyHandle;
use dashmap::DashMap;

/// Live bodies, by persistent id
///
/// A body is "live" while it has an engine handle registered here. Constraint
/// activation resolves its endpoints through this table.
#[derive(Default)]
pub struct BodyRegistry {
    bodies: DashMap<BodyId, BodyHandle>,
}

impl BodyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous handle if the id was already live
    pub fn register(&self, id: BodyId, handle: BodyHandle) -> Option<BodyHandle> {
        self.bodies.insert(id, handle)
    }

    pub fn unregister(&self, id: BodyId) -> Option<BodyHandle> {
        self.bodies.remove(&id).map(|(_, handle)| handle)
    }

    pub fn resolve(&self, id: BodyId) -> Option<BodyHandle> {
        self.bodies.get(&id).map(|entry| *entry)
    }

    /// The world sentinel is always live
    pub fn is_live(&self, id: BodyId) -> bool {
        id.is_world() || self.bodies.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<BodyId> {
        self.bodies.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn clear(&self) {
        self.bodies.clear();
    }
}
