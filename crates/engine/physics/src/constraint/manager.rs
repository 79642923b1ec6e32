use super::dependency::DependencySystem;
use super::storage::{ConstraintStorage, FlushReport, FlushTicket};
use super::{Constraint, ConstraintError, ConstraintId, ConstraintSettings, ConstraintSpace};
use crate::body::{BodyId, BodyRegistry, ChunkManager};
use crate::coord::ChunkCoord;
use crate::engine::{BodyHandle, ConstraintHandle, PhysicsEngine};
use crate::simulation::SimulationHandle;
use dashmap::DashMap;
use std::sync::Arc;

/// What happened to one activation attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationOutcome {
    Activated(ConstraintHandle),
    /// Already realized; nothing created
    AlreadyActive,
    /// An endpoint is not live; the constraint went back to pending
    Pending,
    /// Stored settings did not decode; the constraint was dropped
    SerializationFailed,
    /// The engine refused the constraint; it was dropped
    Rejected,
}

struct Inner {
    sim: SimulationHandle,
    registry: Arc<BodyRegistry>,
    chunks: Arc<ChunkManager>,
    storage: ConstraintStorage,
    dependencies: DependencySystem,
    /// Taken off the pending set, activation job queued but not yet run
    in_flight: DashMap<ConstraintId, Constraint>,
    active: DashMap<ConstraintId, Constraint>,
}

/// Public constraint lifecycle
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConstraintManager {
    inner: Arc<Inner>,
}

impl ConstraintManager {
    pub fn new(
        sim: SimulationHandle,
        registry: Arc<BodyRegistry>,
        chunks: Arc<ChunkManager>,
        storage: ConstraintStorage,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sim,
                registry,
                chunks,
                storage,
                dependencies: DependencySystem::new(),
                in_flight: DashMap::new(),
                active: DashMap::new(),
            }),
        }
    }

    pub fn storage(&self) -> &ConstraintStorage {
        &self.inner.storage
    }

    /// Create a constraint and queue it for activation
    pub fn create(
        &self,
        settings: &ConstraintSettings,
        body_a: BodyId,
        body_b: BodyId,
    ) -> Result<Constraint, ConstraintError> {
        let mut constraint = Constraint::new(settings, body_a, body_b)?;
        constraint.home_chunk = self.inner.home_chunk_of(&constraint);
        tracing::debug!(id = %constraint.id, kind = ?constraint.kind, %body_a, %body_b, "constraint created");
        self.inner.dependencies.add_pending(constraint.clone());
        Ok(constraint)
    }

    /// Queue a constraint read from storage
    ///
    /// Returns false if it is already active or pending.
    pub fn add_from_storage(&self, constraint: Constraint) -> bool {
        if self.inner.active.contains_key(&constraint.id) || self.is_pending(constraint.id) {
            return false;
        }
        self.inner.dependencies.add_pending(constraint);
        true
    }

    /// Activate on the simulation thread
    ///
    /// Until the job runs the constraint counts as pending, and removal,
    /// deactivation or shutdown withdraw it from the queue.
    pub fn activate(&self, constraint: Constraint) -> bool {
        let id = constraint.id;
        self.inner.in_flight.insert(id, constraint);
        let inner = self.inner.clone();
        let queued = self.inner.sim.execute(move |engine| {
            match inner.in_flight.remove(&id) {
                Some((_, constraint)) => {
                    inner.activate_now(engine, constraint);
                }
                None => tracing::trace!(%id, "queued activation withdrawn"),
            }
        });
        if !queued {
            self.inner.in_flight.remove(&id);
        }
        queued
    }

    /// Activation body; must run on the simulation thread
    pub fn activate_now(
        &self,
        engine: &mut dyn PhysicsEngine,
        constraint: Constraint,
    ) -> ActivationOutcome {
        self.inner.activate_now(engine, constraint)
    }

    /// Submit every pending constraint whose endpoints are now live
    pub fn process_pending(&self) -> usize {
        let ready = self.inner.dependencies.take_ready(&self.inner.registry);
        let count = ready.len();
        for constraint in ready {
            if !self.activate(constraint.clone()) {
                // Simulation is gone; keep it for the shutdown save
                self.inner.dependencies.add_pending(constraint);
            }
        }
        count
    }

    /// Remove an active or pending constraint
    pub fn remove(&self, id: ConstraintId, discard_data: bool) -> bool {
        self.inner.remove(id, discard_data)
    }

    /// Remove every constraint that references `body`
    ///
    /// Returns the number removed right away. Activations the simulation
    /// thread is already running are swept by a follow-up job.
    pub fn remove_for_endpoint(&self, body: BodyId, discard_data: bool) -> usize {
        let inner = &self.inner;
        let mut removed = 0;
        for id in inner.active_referencing(body) {
            if inner.remove(id, discard_data) {
                removed += 1;
            }
        }
        let withdrawn = inner
            .dependencies
            .remove_for_body(body)
            .into_iter()
            .chain(inner.take_in_flight(body));
        for constraint in withdrawn {
            if discard_data {
                inner.storage.remove_data(constraint.id);
            }
            removed += 1;
        }

        let sweep = inner.clone();
        inner.sim.execute(move |engine| {
            for id in sweep.active_referencing(body) {
                if let Some((_, late)) = sweep.active.remove(&id) {
                    if let Some(handle) = late.handle {
                        engine.remove_constraint(handle);
                    }
                    if discard_data {
                        sweep.storage.remove_data(id);
                    }
                }
            }
            if discard_data {
                // Re-pended by an activation that found the body gone
                let stranded = sweep
                    .dependencies
                    .remove_for_body(body)
                    .into_iter()
                    .chain(sweep.take_in_flight(body));
                for constraint in stranded {
                    sweep.storage.remove_data(constraint.id);
                }
            }
        });
        removed
    }

    /// Send constraints that reference `body` back to pending
    ///
    /// Used when the body leaves the simulation without being destroyed; the
    /// constraints reactivate once it is live again. Unregister the body first
    /// so activations already running on the simulation thread are caught by
    /// the follow-up sweep.
    pub fn deactivate_for_endpoint(&self, body: BodyId) -> usize {
        let inner = &self.inner;
        let mut handles = Vec::new();
        let mut parked = 0;
        for id in inner.active_referencing(body) {
            if let Some(handle) = inner.park(id) {
                handles.extend(handle);
                parked += 1;
            }
        }
        for constraint in inner.take_in_flight(body) {
            inner.dependencies.add_pending(constraint);
            parked += 1;
        }

        let sweep = inner.clone();
        inner.sim.execute(move |engine| {
            for handle in handles {
                engine.remove_constraint(handle);
            }
            if sweep.registry.is_live(body) {
                return;
            }
            for id in sweep.active_referencing(body) {
                if let Some(Some(handle)) = sweep.park(id) {
                    engine.remove_constraint(handle);
                }
            }
        });
        parked
    }

    /// Persist the active constraints whose primary body is in `coord`
    pub fn save_constraints_in_chunk(&self, coord: ChunkCoord) -> Result<usize, ConstraintError> {
        let selected = self.inner.select_in_chunk(coord);
        if selected.is_empty() {
            return Ok(0);
        }
        Ok(self.inner.storage.store_constraints(&selected)?)
    }

    /// Persist, then deactivate, the constraints of an unloading chunk
    ///
    /// Nothing is removed if the store fails.
    pub fn on_chunk_unload(&self, coord: ChunkCoord) -> Result<usize, ConstraintError> {
        let selected = self.inner.select_in_chunk(coord);
        if selected.is_empty() {
            return Ok(0);
        }
        if let Err(err) = self.inner.storage.store_constraints(&selected) {
            tracing::warn!(%coord, error = %err, "constraints kept active, store failed");
            return Err(err.into());
        }
        for constraint in &selected {
            self.inner.remove(constraint.id, false);
        }
        tracing::debug!(%coord, count = selected.len(), "constraints unloaded");
        Ok(selected.len())
    }

    /// Queue the persisted constraints of a loading chunk
    pub fn load_chunk(&self, coord: ChunkCoord) -> Result<usize, ConstraintError> {
        let stored = self.inner.storage.constraints_in_chunk(coord)?;
        Ok(stored
            .into_iter()
            .filter(|c| self.add_from_storage(c.clone()))
            .count())
    }

    /// Start writing dirty regions and save the index
    pub fn flush_persistence(&self) -> FlushTicket {
        let ticket = self.inner.storage.save_dirty_regions();
        if let Err(err) = self.inner.storage.save_index() {
            tracing::error!(error = %err, "constraint index save failed");
        }
        ticket
    }

    /// Flush and wait; must not be called from an async context
    pub fn flush_persistence_blocking(&self) -> FlushReport {
        self.flush_persistence().wait()
    }

    /// Persist everything, release engine handles and forget in-memory state
    ///
    /// Waits for the simulation thread to drain; must not be called from it.
    pub fn shutdown(&self) -> FlushReport {
        // Queued activations turn into no-ops and are saved as pending
        let queued: Vec<ConstraintId> =
            self.inner.in_flight.iter().map(|entry| *entry.key()).collect();
        for id in queued {
            if let Some((_, constraint)) = self.inner.in_flight.remove(&id) {
                self.inner.dependencies.add_pending(constraint);
            }
        }
        // An activation already running lands in `active` before this returns
        self.inner.sim.flush_blocking();

        let mut all: Vec<Constraint> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.extend(self.inner.dependencies.snapshot());
        for constraint in &mut all {
            if let Some(chunk) = self.inner.home_chunk_of(constraint) {
                constraint.home_chunk = Some(chunk);
            }
        }

        if let Err(err) = self.inner.storage.store_constraints(&all) {
            tracing::error!(error = %err, "constraint store failed during shutdown");
        }
        let report = self.flush_persistence_blocking();
        if report.failed > 0 {
            tracing::error!(failed = report.failed, "constraint regions lost at shutdown");
        }

        let handles: Vec<ConstraintHandle> = self
            .inner
            .active
            .iter()
            .filter_map(|entry| entry.value().handle)
            .collect();
        self.inner.active.clear();
        self.inner.dependencies.clear();
        self.inner.in_flight.clear();
        self.inner.sim.execute(move |engine| {
            for handle in handles {
                engine.remove_constraint(handle);
            }
        });

        tracing::info!(saved = all.len(), "constraint manager shut down");
        report
    }

    pub fn has_active_constraint(&self, id: ConstraintId) -> bool {
        self.inner.active.contains_key(&id)
    }

    /// Waiting for endpoints or for a queued activation to run
    pub fn is_pending(&self, id: ConstraintId) -> bool {
        self.inner.dependencies.contains(id) || self.inner.in_flight.contains_key(&id)
    }

    pub fn active_constraint(&self, id: ConstraintId) -> Option<Constraint> {
        self.inner.active.get(&id).map(|entry| entry.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.dependencies.len() + self.inner.in_flight.len()
    }
}

impl Inner {
    fn home_chunk_of(&self, constraint: &Constraint) -> Option<ChunkCoord> {
        constraint
            .primary_body()
            .and_then(|body| self.chunks.chunk_of(body))
            .or(constraint.home_chunk)
    }

    fn active_referencing(&self, body: BodyId) -> Vec<ConstraintId> {
        self.active
            .iter()
            .filter(|entry| entry.value().references(body))
            .map(|entry| *entry.key())
            .collect()
    }

    fn take_in_flight(&self, body: BodyId) -> Vec<Constraint> {
        let ids: Vec<ConstraintId> = self
            .in_flight
            .iter()
            .filter(|entry| entry.value().references(body))
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.in_flight.remove(&id).map(|(_, c)| c))
            .collect()
    }

    /// Move an active constraint back to pending
    ///
    /// `None` if it was no longer active; otherwise its engine handle, if any.
    fn park(&self, id: ConstraintId) -> Option<Option<ConstraintHandle>> {
        let (_, mut constraint) = self.active.remove(&id)?;
        let handle = constraint.handle.take();
        constraint.home_chunk = self.home_chunk_of(&constraint);
        self.dependencies.add_pending(constraint);
        Some(handle)
    }

    /// Active constraints whose primary body is tracked in `coord`
    fn select_in_chunk(&self, coord: ChunkCoord) -> Vec<Constraint> {
        self.active
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .primary_body()
                    .and_then(|body| self.chunks.chunk_of(body))
                    == Some(coord)
            })
            .map(|entry| {
                let mut constraint = entry.value().clone();
                constraint.home_chunk = Some(coord);
                constraint
            })
            .collect()
    }

    /// `Some(None)` for the world side, `None` when a body is not live
    fn resolve(&self, body: BodyId) -> Option<Option<BodyHandle>> {
        if body.is_world() {
            return Some(None);
        }
        self.registry.resolve(body).map(Some)
    }

    fn activate_now(
        self: &Arc<Self>,
        engine: &mut dyn PhysicsEngine,
        mut constraint: Constraint,
    ) -> ActivationOutcome {
        let id = constraint.id;
        if self.active.contains_key(&id) {
            return ActivationOutcome::AlreadyActive;
        }

        let (Some(body_a), Some(body_b)) =
            (self.resolve(constraint.body_a), self.resolve(constraint.body_b))
        else {
            tracing::trace!(%id, "endpoint not live, constraint back to pending");
            self.dependencies.add_pending(constraint);
            return ActivationOutcome::Pending;
        };

        let settings = match constraint.settings() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!(%id, error = %err, "dropping constraint with unreadable settings");
                return ActivationOutcome::SerializationFailed;
            }
        };

        let handle = match engine.create_constraint(&settings, body_a, body_b) {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(%id, error = %err, "engine rejected constraint");
                return ActivationOutcome::Rejected;
            }
        };

        if settings.space() == ConstraintSpace::WorldSpace {
            if let Some(canonical) = engine.constraint_settings(handle) {
                if let Err(err) = constraint.update_settings(&canonical) {
                    tracing::warn!(%id, error = %err, "keeping world-space settings");
                }
            }
        }

        constraint.handle = Some(handle);
        self.active.insert(id, constraint);
        tracing::debug!(%id, "constraint activated");
        ActivationOutcome::Activated(handle)
    }

    fn remove(self: &Arc<Self>, id: ConstraintId, discard_data: bool) -> bool {
        let active = self.active.remove(&id).map(|(_, c)| c);
        let pending = self.dependencies.remove(id);
        let queued = self.in_flight.remove(&id);
        let found = active.is_some() || pending.is_some() || queued.is_some();

        // Activations queued before this call may still realize the constraint
        let inner = self.clone();
        let handle = active.and_then(|c| c.handle);
        self.sim.execute(move |engine| {
            if let Some(handle) = handle {
                engine.remove_constraint(handle);
            }
            if let Some((_, late)) = inner.active.remove(&id) {
                if let Some(handle) = late.handle {
                    engine.remove_constraint(handle);
                }
            }
        });

        if discard_data {
            self.storage.remove_data(id);
        }
        found
    }
}
