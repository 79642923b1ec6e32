use super::{Constraint, ConstraintId};
use crate::body::{BodyId, BodyRegistry};
use dashmap::DashMap;

/// Constraints waiting for their endpoints to become live
///
/// Taking a constraint out is a map removal, so a constraint handed out by
/// [`DependencySystem::take_ready`] is never handed out twice.
#[derive(Default)]
pub struct DependencySystem {
    pending: DashMap<ConstraintId, Constraint>,
}

impl DependencySystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&self, constraint: Constraint) {
        tracing::trace!(id = %constraint.id, "constraint pending");
        self.pending.insert(constraint.id, constraint);
    }

    /// Remove and return every constraint whose endpoints are all live
    pub fn take_ready(&self, registry: &BodyRegistry) -> Vec<Constraint> {
        let ready: Vec<ConstraintId> = self
            .pending
            .iter()
            .filter(|entry| {
                let c = entry.value();
                registry.is_live(c.body_a) && registry.is_live(c.body_b)
            })
            .map(|entry| *entry.key())
            .collect();

        ready
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|(_, c)| c))
            .collect()
    }

    pub fn remove(&self, id: ConstraintId) -> Option<Constraint> {
        self.pending.remove(&id).map(|(_, c)| c)
    }

    /// Remove every pending constraint that references `body`
    pub fn remove_for_body(&self, body: BodyId) -> Vec<Constraint> {
        let ids: Vec<ConstraintId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().references(body))
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn contains(&self, id: ConstraintId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Copy of every pending constraint
    pub fn snapshot(&self) -> Vec<Constraint> {
        self.pending.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn clear(&self) {
        self.pending.clear();
    }
}
