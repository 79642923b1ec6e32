//! Chunk shape lifecycle
//!
//! ```text
//! Unloaded --schedule--> LoadingScheduled --advance--> GeneratingShape --complete--> Ready
//! LoadingScheduled --unload--> Unloaded
//! any --unload--> Removing --release--> slot recycled
//! ```
//!
//! Shapes are compiled on the worker pool and installed on the simulation
//! thread. Every task carries the version ticket it was scheduled with; a task
//! whose ticket went stale drops its result without touching the slot.

use super::generator::ShapeGenerator;
use super::shape_cache::{ShapeCacheStats, TerrainShape};
use super::snapshot::ChunkSnapshot;
use super::store::{ChunkState, ChunkStateStore, SlotIndex, StoreError};
use crate::coord::{ChunkCoord, CHUNK_SIZE};
use crate::engine::{BodyHandle, PhysicsEngine};
use crate::simulation::SimulationHandle;
use dashmap::DashMap;
use rapier3d::math::Isometry;
use rapier3d::geometry::SharedShape;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Result of handing a snapshot to the lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A generation task was spawned with this ticket
    Scheduled { index: SlotIndex, ticket: u32 },
    /// The slot was busy; the snapshot replaces any earlier pending rebuild
    Coalesced,
}

/// What became of one generation task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Shape computed and queued for installation on the simulation thread
    Submitted,
    /// Shape installed and slot moved to `Ready`
    Installed,
    /// No collidable geometry; any body was removed and the slot is `Ready`
    Empty,
    /// A newer ticket superseded this task; result discarded
    Stale,
    /// The task lost the race to start generating
    Cancelled,
    /// Generation or the engine failed; slot reset to `Unloaded`
    Rejected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    pub managed_chunks: usize,
    pub ready_chunks: usize,
    pub pending_rebuilds: usize,
    pub shape_cache: ShapeCacheStats,
}

struct Inner {
    store: Arc<ChunkStateStore>,
    generator: ShapeGenerator,
    sim: SimulationHandle,
    pool: Arc<rayon::ThreadPool>,
    /// Newest snapshot for chunks whose slot was busy when it arrived
    pending_rebuilds: DashMap<ChunkCoord, ChunkSnapshot>,
    placeholder: Option<SharedShape>,
}

/// Drives chunk slots through their lifecycle
#[derive(Clone)]
pub struct ChunkLifecycleManager {
    inner: Arc<Inner>,
}

fn placeholder_shape() -> SharedShape {
    let half = CHUNK_SIZE as f32 * 0.5;
    SharedShape::compound(vec![(
        Isometry::translation(half, half, half),
        SharedShape::cuboid(half, half, half),
    )])
}

impl ChunkLifecycleManager {
    pub fn new(
        store: Arc<ChunkStateStore>,
        generator: ShapeGenerator,
        sim: SimulationHandle,
        pool: Arc<rayon::ThreadPool>,
        placeholder_shapes: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                generator,
                sim,
                pool,
                pending_rebuilds: DashMap::new(),
                placeholder: placeholder_shapes.then(placeholder_shape),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ChunkStateStore> {
        &self.inner.store
    }

    /// A chunk was loaded or its collision layout changed
    pub fn on_chunk_loaded(&self, snapshot: ChunkSnapshot) -> Result<ScheduleOutcome, StoreError> {
        self.inner.load(snapshot)
    }

    /// A chunk left the simulated area
    ///
    /// Returns false if the coordinate was not managed.
    pub fn on_chunk_unloaded(&self, coord: ChunkCoord) -> bool {
        self.inner.unload(coord)
    }

    /// Worker-side half of a generation task
    pub fn run_generation(
        &self,
        index: SlotIndex,
        ticket: u32,
        snapshot: ChunkSnapshot,
    ) -> GenerationOutcome {
        self.inner.run_generation(index, ticket, snapshot)
    }

    /// Simulation-side half of a generation task
    pub fn complete_generation(
        &self,
        engine: &mut dyn PhysicsEngine,
        index: SlotIndex,
        coord: ChunkCoord,
        ticket: u32,
        shape: Option<Arc<TerrainShape>>,
    ) -> GenerationOutcome {
        self.inner
            .complete_generation(engine, index, coord, ticket, shape)
    }

    pub fn pending_rebuilds(&self) -> usize {
        self.inner.pending_rebuilds.len()
    }

    pub fn stats(&self) -> LifecycleStats {
        let store = &self.inner.store;
        LifecycleStats {
            managed_chunks: store.len(),
            ready_chunks: store.active_indices().len(),
            pending_rebuilds: self.inner.pending_rebuilds.len(),
            shape_cache: self.inner.generator.cache().stats(),
        }
    }

    /// Remove every terrain body and forget all chunks
    ///
    /// Runs on the simulation thread.
    pub fn clear(&self, engine: &mut dyn PhysicsEngine) {
        self.inner.pending_rebuilds.clear();
        for (_, body) in self.inner.store.body_handles() {
            engine.remove_body(body);
        }
        self.inner.store.clear();
        self.inner.generator.cache().clear();
    }
}

impl Inner {
    fn load(self: &Arc<Self>, snapshot: ChunkSnapshot) -> Result<ScheduleOutcome, StoreError> {
        let index = self.store.reserve(snapshot.coord)?;
        Ok(self.submit(index, snapshot))
    }

    fn submit(self: &Arc<Self>, index: SlotIndex, mut snapshot: ChunkSnapshot) -> ScheduleOutcome {
        let coord = snapshot.coord;
        loop {
            if let Some(ticket) = self.store.try_schedule_generation(index) {
                self.spawn_generation(index, ticket, snapshot);
                return ScheduleOutcome::Scheduled { index, ticket };
            }

            self.pending_rebuilds.insert(coord, snapshot);
            if self.store.state(index).is_busy() {
                tracing::trace!(%coord, "slot busy, rebuild coalesced");
                return ScheduleOutcome::Coalesced;
            }
            // The owning task finished between the failed schedule and the insert
            match self.pending_rebuilds.remove(&coord) {
                Some((_, newest)) => snapshot = newest,
                None => return ScheduleOutcome::Coalesced,
            }
        }
    }

    fn spawn_generation(self: &Arc<Self>, index: SlotIndex, ticket: u32, snapshot: ChunkSnapshot) {
        let coord = snapshot.coord;
        if let Some(shape) = &self.placeholder {
            let inner = self.clone();
            let shape = shape.clone();
            self.sim.execute(move |engine| {
                inner.install_placeholder(engine, index, coord, ticket, &shape)
            });
        }

        self.store.acquire(index);
        let inner = self.clone();
        self.pool.spawn(move || {
            let outcome = inner.run_generation(index, ticket, snapshot);
            tracing::trace!(%coord, ticket, ?outcome, "generation task finished");
        });
    }

    fn install_placeholder(
        &self,
        engine: &mut dyn PhysicsEngine,
        index: SlotIndex,
        coord: ChunkCoord,
        ticket: u32,
        shape: &SharedShape,
    ) {
        if self.store.is_version_stale(index, ticket) || !self.store.body_handle(index).is_unused() {
            return;
        }
        match engine.create_static_body(coord.origin(), shape) {
            Ok(body) => {
                self.store.set_body_handle(index, body);
                self.store.set_placeholder(index, true);
            }
            Err(err) => tracing::warn!(%coord, error = %err, "placeholder body rejected"),
        }
    }

    /// Expects the caller to hold a slot reference, which this releases
    fn run_generation(
        self: &Arc<Self>,
        index: SlotIndex,
        ticket: u32,
        snapshot: ChunkSnapshot,
    ) -> GenerationOutcome {
        let coord = snapshot.coord;
        if self.store.is_version_stale(index, ticket)
            || !self.store.try_advance_to_generating(index, ticket)
        {
            tracing::trace!(%coord, ticket, "generation cancelled before start");
            self.store.release_ref(index);
            return GenerationOutcome::Cancelled;
        }

        let generated =
            panic::catch_unwind(AssertUnwindSafe(|| self.generator.generate(&snapshot)));
        let shape = match generated {
            Ok(shape) => shape,
            Err(_) => {
                tracing::error!(%coord, ticket, "shape generation panicked");
                self.store.try_fail(index, ticket);
                self.store.release_ref(index);
                self.replay_pending(coord);
                return GenerationOutcome::Rejected;
            }
        };

        if self.store.is_version_stale(index, ticket) {
            tracing::trace!(%coord, ticket, "generated shape is stale");
            drop(shape);
            self.store.release_ref(index);
            return GenerationOutcome::Stale;
        }

        let inner = self.clone();
        let queued = self.sim.execute(move |engine| {
            inner.complete_generation(engine, index, coord, ticket, shape);
        });
        if !queued {
            tracing::warn!(%coord, "simulation thread gone, dropping generated shape");
            self.store.try_fail(index, ticket);
            self.store.release_ref(index);
            return GenerationOutcome::Rejected;
        }
        GenerationOutcome::Submitted
    }

    /// Releases the slot reference taken when the task was spawned
    fn complete_generation(
        self: &Arc<Self>,
        engine: &mut dyn PhysicsEngine,
        index: SlotIndex,
        coord: ChunkCoord,
        ticket: u32,
        shape: Option<Arc<TerrainShape>>,
    ) -> GenerationOutcome {
        let outcome = self.install(engine, index, coord, ticket, shape);
        self.store.release_ref(index);
        if outcome != GenerationOutcome::Stale {
            self.replay_pending(coord);
        }
        outcome
    }

    fn install(
        &self,
        engine: &mut dyn PhysicsEngine,
        index: SlotIndex,
        coord: ChunkCoord,
        ticket: u32,
        shape: Option<Arc<TerrainShape>>,
    ) -> GenerationOutcome {
        let store = &self.store;
        if store.is_version_stale(index, ticket) || store.state(index) != ChunkState::GeneratingShape
        {
            tracing::trace!(%coord, ticket, "discarding stale shape");
            return GenerationOutcome::Stale;
        }

        let body = store.body_handle(index);
        let Some(shape) = shape else {
            if !body.is_unused() {
                engine.remove_body(body);
                store.set_body_handle(index, BodyHandle::UNUSED);
            }
            store.install_shape(index, None);
            store.set_placeholder(index, false);
            return if store.try_complete(index, ticket) {
                GenerationOutcome::Empty
            } else {
                GenerationOutcome::Stale
            };
        };

        let result = if body.is_unused() {
            engine
                .create_static_body(coord.origin(), &shape.shape)
                .map(|body| store.set_body_handle(index, body))
        } else {
            engine.set_body_shape(body, &shape.shape)
        };
        if let Err(err) = result {
            tracing::error!(%coord, error = %err, "engine rejected terrain body");
            store.try_fail(index, ticket);
            return GenerationOutcome::Rejected;
        }

        let boxes = shape.box_count;
        store.install_shape(index, Some(shape));
        store.set_placeholder(index, false);
        if store.try_complete(index, ticket) {
            tracing::debug!(%coord, ticket, boxes, "terrain shape installed");
            GenerationOutcome::Installed
        } else {
            // Removal started after the stale check; the removal job owns the body now
            GenerationOutcome::Stale
        }
    }

    fn unload(self: &Arc<Self>, coord: ChunkCoord) -> bool {
        self.pending_rebuilds.remove(&coord);
        let Some(index) = self.store.index_of(coord) else {
            return false;
        };

        self.store.try_reset_from_scheduled(index);
        let Some(removal) = self.store.mark_removing(index) else {
            return false;
        };

        let inner = self.clone();
        let queued = self
            .sim
            .execute(move |engine| inner.finish_unload(engine, index, coord, removal));
        if !queued {
            tracing::warn!(%coord, "simulation thread gone, releasing slot directly");
            self.store.release(coord);
        }
        true
    }

    fn finish_unload(
        self: &Arc<Self>,
        engine: &mut dyn PhysicsEngine,
        index: SlotIndex,
        coord: ChunkCoord,
        removal: u32,
    ) {
        // A later unload of the same chunk superseded this one
        if self.store.index_of(coord) != Some(index)
            || self.store.state(index) != ChunkState::Removing
            || self.store.version(index) != removal
        {
            return;
        }

        let body = self.store.body_handle(index);
        if !body.is_unused() {
            engine.remove_body(body);
        }
        self.store.release(coord);
        tracing::debug!(%coord, "chunk released");

        self.replay_pending(coord);
    }

    fn replay_pending(self: &Arc<Self>, coord: ChunkCoord) {
        let Some((_, snapshot)) = self.pending_rebuilds.remove(&coord) else {
            return;
        };
        if let Err(err) = self.load(snapshot) {
            tracing::warn!(%coord, error = %err, "pending rebuild dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RapierEngine;
    use crate::simulation::SimulationThread;
    use crate::terrain::shape_cache::ShapeCache;
    use crate::terrain::snapshot::BlockCollision;
    use glam::Vec3;

    struct Fixture {
        sim: SimulationThread,
        lifecycle: ChunkLifecycleManager,
    }

    impl Fixture {
        fn new(placeholders: bool) -> Self {
            let sim = SimulationThread::spawn(Box::new(RapierEngine::new(Vec3::ZERO))).unwrap();
            let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
            let lifecycle = ChunkLifecycleManager::new(
                Arc::new(ChunkStateStore::new(16)),
                ShapeGenerator::new(Arc::new(ShapeCache::new(16))),
                sim.handle(),
                Arc::new(pool),
                placeholders,
            );
            Self { sim, lifecycle }
        }

        /// Wait until every task has reached the simulation thread and run
        fn settle(&self) {
            for _ in 0..100 {
                assert!(self.sim.handle().flush_blocking());
                let store = self.lifecycle.store();
                let busy = store.managed_coords().into_iter().any(|c| {
                    store
                        .index_of(c)
                        .is_some_and(|i| store.state(i).is_busy())
                });
                if !busy && self.lifecycle.pending_rebuilds() == 0 {
                    return;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            panic!("lifecycle did not settle");
        }
    }

    fn solid(coord: ChunkCoord, count: u8) -> ChunkSnapshot {
        ChunkSnapshot::new(
            coord,
            (0..count).map(|x| BlockCollision::full([x, 0, 0])).collect(),
        )
    }

    #[test]
    fn test_load_installs_shape() {
        let fx = Fixture::new(false);
        let coord = ChunkCoord::new(1, 0, 0);
        fx.lifecycle.on_chunk_loaded(solid(coord, 3)).unwrap();
        fx.settle();

        let store = fx.lifecycle.store();
        let index = store.index_of(coord).unwrap();
        assert_eq!(store.state(index), ChunkState::Ready);
        assert_eq!(store.shape(index).unwrap().box_count, 3);
        assert!(!store.body_handle(index).is_unused());
        assert_eq!(store.ref_count(index), 0);
    }

    #[test]
    fn test_empty_chunk_has_no_body() {
        let fx = Fixture::new(false);
        fx.lifecycle
            .on_chunk_loaded(ChunkSnapshot::empty(ChunkCoord::ZERO))
            .unwrap();
        fx.settle();

        let store = fx.lifecycle.store();
        let index = store.index_of(ChunkCoord::ZERO).unwrap();
        assert_eq!(store.state(index), ChunkState::Ready);
        assert!(store.shape(index).is_none());
        assert!(store.body_handle(index).is_unused());
    }

    #[test]
    fn test_unload_releases_slot() {
        let fx = Fixture::new(false);
        fx.lifecycle.on_chunk_loaded(solid(ChunkCoord::ZERO, 1)).unwrap();
        fx.settle();

        assert!(fx.lifecycle.on_chunk_unloaded(ChunkCoord::ZERO));
        fx.settle();

        assert!(fx.lifecycle.store().is_empty());
        assert!(!fx.lifecycle.on_chunk_unloaded(ChunkCoord::ZERO));
        let bodies = fx.sim.handle().call(|engine| engine.bodies_in_sphere(Vec3::ZERO, 100.0));
        assert_eq!(bodies.map(|b| b.len()), Some(0));
    }

    #[test]
    fn test_stale_completion_is_discarded() {
        let fx = Fixture::new(false);
        let store = fx.lifecycle.store().clone();
        let index = store.reserve(ChunkCoord::ZERO).unwrap();

        let v1 = store.try_schedule_generation(index).unwrap();
        assert!(store.try_reset_from_scheduled(index));
        let v2 = store.try_schedule_generation(index).unwrap();
        assert!(store.try_advance_to_generating(index, v2));

        let generator = ShapeGenerator::new(Arc::new(ShapeCache::new(0)));
        let shape_v1 = generator.generate(&solid(ChunkCoord::ZERO, 1));
        let shape_v2 = generator.generate(&solid(ChunkCoord::ZERO, 2));

        let lifecycle = fx.lifecycle.clone();
        let outcomes = fx
            .sim
            .handle()
            .call(move |engine| {
                store.acquire(index);
                store.acquire(index);
                let first = lifecycle.complete_generation(engine, index, ChunkCoord::ZERO, v1, shape_v1);
                let second = lifecycle.complete_generation(engine, index, ChunkCoord::ZERO, v2, shape_v2);
                (first, second)
            })
            .unwrap();

        assert_eq!(outcomes, (GenerationOutcome::Stale, GenerationOutcome::Installed));
        let store = fx.lifecycle.store();
        assert_eq!(store.shape(index).unwrap().box_count, 2);
        assert_eq!(store.ref_count(index), 0);
    }

    #[test]
    fn test_cancelled_task_releases_ref() {
        let fx = Fixture::new(false);
        let store = fx.lifecycle.store();
        let index = store.reserve(ChunkCoord::ZERO).unwrap();
        let ticket = store.try_schedule_generation(index).unwrap();
        store.try_reset_from_scheduled(index);
        store.acquire(index);

        let outcome = fx
            .lifecycle
            .run_generation(index, ticket, solid(ChunkCoord::ZERO, 1));

        assert_eq!(outcome, GenerationOutcome::Cancelled);
        assert_eq!(store.ref_count(index), 0);
        assert_eq!(store.state(index), ChunkState::Unloaded);
    }

    #[test]
    fn test_busy_load_is_coalesced_and_replayed() {
        let fx = Fixture::new(false);
        let store = fx.lifecycle.store();
        let index = store.reserve(ChunkCoord::ZERO).unwrap();
        // Hold the slot as if a task were generating
        let ticket = store.try_schedule_generation(index).unwrap();
        store.try_advance_to_generating(index, ticket);
        store.acquire(index);

        let outcome = fx.lifecycle.on_chunk_loaded(solid(ChunkCoord::ZERO, 4)).unwrap();
        assert_eq!(outcome, ScheduleOutcome::Coalesced);
        assert_eq!(fx.lifecycle.pending_rebuilds(), 1);

        let lifecycle = fx.lifecycle.clone();
        let first = fx
            .sim
            .handle()
            .call(move |engine| {
                lifecycle.complete_generation(engine, index, ChunkCoord::ZERO, ticket, None)
            })
            .unwrap();
        assert_eq!(first, GenerationOutcome::Empty);

        fx.settle();
        assert_eq!(store.state(index), ChunkState::Ready);
        assert_eq!(store.shape(index).unwrap().box_count, 4);
    }

    #[test]
    fn test_reload_while_removing() {
        let fx = Fixture::new(false);
        let coord = ChunkCoord::new(0, 2, 0);
        fx.lifecycle.on_chunk_loaded(solid(coord, 1)).unwrap();
        fx.settle();

        fx.lifecycle.on_chunk_unloaded(coord);
        fx.lifecycle.on_chunk_loaded(solid(coord, 2)).unwrap();
        fx.settle();

        let store = fx.lifecycle.store();
        let index = store.index_of(coord).unwrap();
        assert_eq!(store.state(index), ChunkState::Ready);
        assert_eq!(store.shape(index).unwrap().box_count, 2);
    }

    #[test]
    fn test_placeholder_replaced_by_real_shape() {
        let fx = Fixture::new(true);
        let coord = ChunkCoord::ZERO;
        let store = fx.lifecycle.store().clone();
        let index = store.reserve(coord).unwrap();
        let ticket = store.try_schedule_generation(index).unwrap();

        let inner = fx.lifecycle.inner.clone();
        let placeholder = placeholder_shape();
        let body = fx
            .sim
            .handle()
            .call(move |engine| {
                inner.install_placeholder(engine, index, coord, ticket, &placeholder);
            })
            .map(|_| store.body_handle(index))
            .unwrap();
        assert!(!body.is_unused());
        assert!(store.is_placeholder(index));

        store.try_advance_to_generating(index, ticket);
        store.acquire(index);
        let shape = ShapeGenerator::new(Arc::new(ShapeCache::new(0))).generate(&solid(coord, 1));
        let lifecycle = fx.lifecycle.clone();
        let outcome = fx
            .sim
            .handle()
            .call(move |engine| lifecycle.complete_generation(engine, index, coord, ticket, shape))
            .unwrap();

        assert_eq!(outcome, GenerationOutcome::Installed);
        assert!(!store.is_placeholder(index));
        assert_eq!(store.body_handle(index), body);
    }
}
