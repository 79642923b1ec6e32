//! Host-facing facade
//!
//! [`VoxelPhysicsWorld`] owns the simulation thread, the worker pool and every
//! registry, and wires chunk streaming events into terrain and constraint
//! handling. None of its methods block on the simulation thread except the
//! explicit flush and shutdown paths.

use crate::body::{BodyId, BodyRegistry, ChunkManager, MovementListener};
use crate::config::PhysicsConfig;
use crate::constraint::{
    Constraint, ConstraintError, ConstraintManager, ConstraintSettings, ConstraintStorage,
    FileStorage, FlushReport, FlushTicket, StorageError,
};
use crate::coord::ChunkCoord;
use crate::engine::{BodyDesc, BodyHandle, EngineError, PhysicsEngine, RapierEngine};
use crate::explosion;
use crate::simulation::{SimulationHandle, SimulationThread};
use crate::terrain::{
    ChunkLifecycleManager, ChunkSnapshot, ChunkStateStore, LifecycleStats, ScheduleOutcome,
    ShapeCache, ShapeGenerator, StoreError,
};
use glam::Vec3;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("invalid configuration: {0}")]
    Config(#[from] anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk store error: {0}")]
    Store(#[from] StoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("constraint error: {0}")]
    Constraint(#[from] ConstraintError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("worker pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("simulation thread is not running")]
    SimulationStopped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorldStats {
    pub ticks: u64,
    pub terrain: LifecycleStats,
    pub live_bodies: usize,
    pub active_constraints: usize,
    pub pending_constraints: usize,
}

/// Physics state synchronized with a streamed voxel world
pub struct VoxelPhysicsWorld {
    config: PhysicsConfig,
    sim: SimulationThread,
    handle: SimulationHandle,
    registry: Arc<BodyRegistry>,
    chunks: Arc<ChunkManager>,
    lifecycle: ChunkLifecycleManager,
    constraints: ConstraintManager,
    ticks: AtomicU64,
}

impl VoxelPhysicsWorld {
    /// Rapier engine and file-backed constraint storage under `config.data_dir`
    pub fn open(config: PhysicsConfig) -> Result<Self, WorldError> {
        let backend = FileStorage::new(config.constraint_dir())?;
        let storage = ConstraintStorage::open(Arc::new(backend))?;
        let engine = RapierEngine::new(Vec3::new(0.0, config.gravity, 0.0));
        Self::new(config, Box::new(engine), storage, None)
    }

    pub fn new(
        config: PhysicsConfig,
        engine: Box<dyn PhysicsEngine>,
        storage: ConstraintStorage,
        listener: Option<Arc<dyn MovementListener>>,
    ) -> Result<Self, WorldError> {
        config.validate()?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("chunk-shape-{i}"))
            .panic_handler(|_| tracing::error!("chunk worker panicked"))
            .build()?;

        let sim = SimulationThread::spawn(engine)?;
        let handle = sim.handle();
        let registry = Arc::new(BodyRegistry::new());
        let chunks = Arc::new(match listener {
            Some(listener) => ChunkManager::with_listener(listener),
            None => ChunkManager::new(),
        });

        let lifecycle = ChunkLifecycleManager::new(
            Arc::new(ChunkStateStore::new(config.initial_chunk_capacity)),
            ShapeGenerator::new(Arc::new(ShapeCache::new(config.shape_cache_capacity))),
            handle.clone(),
            Arc::new(pool),
            config.placeholder_shapes,
        );
        let constraints =
            ConstraintManager::new(handle.clone(), registry.clone(), chunks.clone(), storage);

        tracing::info!(
            chunk_capacity = config.initial_chunk_capacity,
            shape_cache = config.shape_cache_capacity,
            placeholders = config.placeholder_shapes,
            "physics world started"
        );

        Ok(Self {
            config,
            sim,
            handle,
            registry,
            chunks,
            lifecycle,
            constraints,
            ticks: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn simulation(&self) -> &SimulationHandle {
        &self.handle
    }

    pub fn registry(&self) -> &Arc<BodyRegistry> {
        &self.registry
    }

    pub fn chunks(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    pub fn lifecycle(&self) -> &ChunkLifecycleManager {
        &self.lifecycle
    }

    pub fn constraints(&self) -> &ConstraintManager {
        &self.constraints
    }

    /// A chunk became available or its blocks changed
    pub fn on_chunk_loaded(&self, snapshot: ChunkSnapshot) -> Result<ScheduleOutcome, WorldError> {
        let coord = snapshot.coord;
        let outcome = self.lifecycle.on_chunk_loaded(snapshot)?;
        match self.constraints.load_chunk(coord) {
            Ok(0) => {}
            Ok(count) => tracing::debug!(%coord, count, "persisted constraints queued"),
            Err(err) => tracing::warn!(%coord, error = %err, "persisted constraints not loaded"),
        }
        Ok(outcome)
    }

    /// A chunk left the simulated area
    ///
    /// Constraints homed in the chunk are persisted and deactivated, bodies in
    /// it leave the simulation, and its terrain body is retired.
    pub fn on_chunk_unloaded(&self, coord: ChunkCoord) {
        if let Err(err) = self.constraints.on_chunk_unload(coord) {
            tracing::warn!(%coord, error = %err, "chunk constraints stay active");
        }

        let bodies = self.chunks.remove_all_in_chunk(coord);
        let mut handles = Vec::with_capacity(bodies.len());
        for body in &bodies {
            if let Some(handle) = self.registry.unregister(*body) {
                handles.push(handle);
            }
            // Constraints homed elsewhere wait for this body to come back
            self.constraints.deactivate_for_endpoint(*body);
        }
        if !handles.is_empty() {
            self.handle.execute(move |engine| {
                for handle in handles {
                    engine.remove_body(handle);
                }
            });
        }

        self.lifecycle.on_chunk_unloaded(coord);
        tracing::debug!(%coord, bodies = bodies.len(), "chunk unloaded");
    }

    /// Add a dynamic body with a fresh id
    pub fn spawn_body(&self, desc: BodyDesc) -> Result<BodyId, WorldError> {
        let id = BodyId::random();
        self.spawn_body_with_id(id, desc)?;
        Ok(id)
    }

    /// Add a dynamic body under a known id, e.g. one restored by the host
    ///
    /// The body is tracked immediately and becomes live once the simulation
    /// thread has created it.
    pub fn spawn_body_with_id(&self, id: BodyId, desc: BodyDesc) -> Result<(), WorldError> {
        self.chunks
            .start_tracking(id, ChunkCoord::containing(desc.position));

        let registry = self.registry.clone();
        let chunks = self.chunks.clone();
        let queued = self.handle.execute(move |engine| {
            match engine.create_dynamic_body(&desc) {
                Ok(handle) => {
                    registry.register(id, handle);
                }
                Err(err) => {
                    tracing::warn!(%id, error = %err, "body rejected");
                    chunks.stop_tracking(id);
                }
            }
        });
        if !queued {
            self.chunks.stop_tracking(id);
            return Err(WorldError::SimulationStopped);
        }
        Ok(())
    }

    /// Remove a body and discard every constraint that references it
    pub fn destroy_body(&self, id: BodyId) -> bool {
        let tracked = self.chunks.stop_tracking(id).is_some();
        let handle = self.registry.unregister(id);
        self.constraints.remove_for_endpoint(id, true);
        if let Some(handle) = handle {
            self.handle.execute(move |engine| engine.remove_body(handle));
        }
        tracked || handle.is_some()
    }

    pub fn create_constraint(
        &self,
        settings: &ConstraintSettings,
        body_a: BodyId,
        body_b: BodyId,
    ) -> Result<Constraint, WorldError> {
        Ok(self.constraints.create(settings, body_a, body_b)?)
    }

    pub fn explode(&self, center: Vec3, radius: f32, strength: f32) -> bool {
        explosion::apply_explosion(&self.handle, center, radius, strength)
    }

    /// Advance one simulation step
    ///
    /// Pending constraints are retried first; after stepping, bodies that
    /// crossed a chunk border are re-bucketed.
    pub fn tick(&self, dt: f32) -> Result<(), WorldError> {
        self.constraints.process_pending();

        let registry = self.registry.clone();
        let chunks = self.chunks.clone();
        let queued = self.handle.execute(move |engine| {
            engine.step(dt);
            rebucket(engine, &registry, &chunks);
        });
        if !queued {
            return Err(WorldError::SimulationStopped);
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resolves once every job queued so far has run
    pub fn flush(&self) -> oneshot::Receiver<()> {
        self.handle.flush()
    }

    pub fn flush_persistence(&self) -> FlushTicket {
        self.constraints.flush_persistence()
    }

    pub fn stats(&self) -> WorldStats {
        WorldStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            terrain: self.lifecycle.stats(),
            live_bodies: self.registry.len(),
            active_constraints: self.constraints.active_count(),
            pending_constraints: self.constraints.pending_count(),
        }
    }

    /// Persist constraints, tear down terrain and stop the simulation thread
    ///
    /// Blocks; call from a blocking context.
    pub fn shutdown(self) -> FlushReport {
        let report = self.constraints.shutdown();

        let lifecycle = self.lifecycle.clone();
        self.handle.execute(move |engine| lifecycle.clear(engine));
        self.handle.flush_blocking();

        self.chunks.clear();
        self.registry.clear();
        if self.sim.shutdown().is_none() {
            tracing::warn!("simulation thread did not stop cleanly");
        }
        tracing::info!(
            written = report.written,
            failed = report.failed,
            "physics world shut down"
        );
        report
    }
}

fn rebucket(engine: &mut dyn PhysicsEngine, registry: &BodyRegistry, chunks: &ChunkManager) {
    for (id, from) in chunks.tracked() {
        let Some(position) = registry
            .resolve(id)
            .and_then(|handle: BodyHandle| engine.body_position(handle))
        else {
            continue;
        };
        let to = ChunkCoord::containing(position);
        if to != from {
            chunks.move_body(id, from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{ConstraintSpace, PointSettings};
    use crate::terrain::BlockCollision;

    fn world() -> VoxelPhysicsWorld {
        let config = PhysicsConfig {
            initial_chunk_capacity: 16,
            worker_threads: 2,
            ..PhysicsConfig::default()
        };
        let engine = RapierEngine::new(Vec3::new(0.0, -9.81, 0.0));
        VoxelPhysicsWorld::new(config, Box::new(engine), ConstraintStorage::in_memory(), None)
            .unwrap()
    }

    fn settle(world: &VoxelPhysicsWorld) {
        assert!(world.simulation().flush_blocking());
    }

    #[test]
    fn test_spawn_and_destroy_body() {
        let world = world();
        let id = world
            .spawn_body(BodyDesc::cuboid(Vec3::new(1.0, 40.0, 1.0), Vec3::splat(0.5)))
            .unwrap();
        settle(&world);

        assert!(world.registry().is_live(id));
        assert_eq!(world.chunks().chunk_of(id), Some(ChunkCoord::new(0, 2, 0)));

        assert!(world.destroy_body(id));
        assert!(!world.registry().is_live(id));
        assert!(world.chunks().chunk_of(id).is_none());
    }

    #[test]
    fn test_falling_body_is_rebucketed() {
        let world = world();
        let id = world
            .spawn_body(BodyDesc::cuboid(Vec3::new(1.0, 16.5, 1.0), Vec3::splat(0.5)))
            .unwrap();
        for _ in 0..60 {
            world.tick(1.0 / 60.0).unwrap();
        }
        settle(&world);

        assert_eq!(world.chunks().chunk_of(id), Some(ChunkCoord::new(0, 0, 0)));
        assert_eq!(world.stats().ticks, 60);
    }

    #[test]
    fn test_constraint_activates_on_tick() {
        let world = world();
        let id = world
            .spawn_body(BodyDesc::cuboid(Vec3::new(1.0, 5.0, 1.0), Vec3::splat(0.5)))
            .unwrap();
        let settings = ConstraintSettings::Point(PointSettings {
            space: ConstraintSpace::WorldSpace,
            point1: Vec3::new(1.0, 6.0, 1.0),
            point2: Vec3::new(1.0, 6.0, 1.0),
        });
        let constraint = world.create_constraint(&settings, id, BodyId::WORLD).unwrap();
        assert!(world.constraints().is_pending(constraint.id));

        settle(&world);
        world.tick(1.0 / 60.0).unwrap();
        settle(&world);

        assert!(world.constraints().has_active_constraint(constraint.id));
        let active = world.constraints().active_constraint(constraint.id).unwrap();
        assert_eq!(
            active.settings().unwrap().space(),
            ConstraintSpace::LocalToBody
        );
    }

    #[test]
    fn test_chunk_unload_parks_constraints_and_bodies() {
        let world = world();
        let coord = ChunkCoord::ZERO;
        world
            .on_chunk_loaded(ChunkSnapshot::new(coord, vec![BlockCollision::full([0, 0, 0])]))
            .unwrap();
        let id = world
            .spawn_body(BodyDesc::cuboid(Vec3::new(4.0, 4.0, 4.0), Vec3::splat(0.5)))
            .unwrap();
        let settings = ConstraintSettings::Point(PointSettings {
            space: ConstraintSpace::LocalToBody,
            point1: Vec3::ZERO,
            point2: Vec3::new(4.0, 5.0, 4.0),
        });
        let constraint = world.create_constraint(&settings, id, BodyId::WORLD).unwrap();
        settle(&world);
        world.constraints().process_pending();
        settle(&world);
        assert!(world.constraints().has_active_constraint(constraint.id));

        world.on_chunk_unloaded(coord);
        settle(&world);

        assert!(!world.constraints().has_active_constraint(constraint.id));
        assert!(world.constraints().storage().contains(constraint.id));
        assert!(!world.registry().is_live(id));
        assert!(world.chunks().bodies_in_chunk(coord).is_empty());
    }

    #[test]
    fn test_destroy_body_withdraws_queued_activation() {
        let world = world();
        let id = world
            .spawn_body(BodyDesc::cuboid(Vec3::new(4.0, 4.0, 4.0), Vec3::splat(0.5)))
            .unwrap();
        let settings = ConstraintSettings::Point(PointSettings {
            space: ConstraintSpace::LocalToBody,
            point1: Vec3::ZERO,
            point2: Vec3::new(4.0, 5.0, 4.0),
        });
        let constraint = world.create_constraint(&settings, id, BodyId::WORLD).unwrap();
        settle(&world);

        let (gate, wait) = std::sync::mpsc::channel::<()>();
        world.simulation().execute(move |_| {
            let _ = wait.recv();
        });
        // Takes the constraint off the pending set and queues its activation
        world.tick(1.0 / 60.0).unwrap();
        assert!(world.destroy_body(id));
        drop(gate);
        settle(&world);

        assert!(!world.constraints().has_active_constraint(constraint.id));
        assert!(!world.constraints().is_pending(constraint.id));
        assert_eq!(world.stats().pending_constraints, 0);
    }

    #[test]
    fn test_shutdown_reports_flush() {
        let world = world();
        let id = world
            .spawn_body(BodyDesc::cuboid(Vec3::new(4.0, 4.0, 4.0), Vec3::splat(0.5)))
            .unwrap();
        let settings = ConstraintSettings::Point(PointSettings {
            space: ConstraintSpace::LocalToBody,
            point1: Vec3::ZERO,
            point2: Vec3::ZERO,
        });
        world.create_constraint(&settings, id, BodyId::WORLD).unwrap();
        settle(&world);

        let report = world.shutdown();
        assert_eq!(report.failed, 0);
        assert_eq!(report.written, 1);
    }
}
