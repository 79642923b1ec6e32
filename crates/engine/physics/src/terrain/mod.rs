//! Terrain collision for streamed chunks
//!
//! Block snapshots from the host world are compiled into compound cuboid
//! shapes on worker threads and installed as static bodies on the simulation
//! thread. [`ChunkStateStore`] tracks every managed chunk;
//! [`ChunkLifecycleManager`] moves chunks through their states.

mod generator;
mod lifecycle;
mod shape_cache;
mod snapshot;
mod store;

pub use generator::{ShapeGenerator, MIN_HALF_EXTENT};
pub use lifecycle::{ChunkLifecycleManager, GenerationOutcome, LifecycleStats, ScheduleOutcome};
pub use shape_cache::{ShapeCache, ShapeCacheStats, TerrainShape};
pub use snapshot::{BlockCollision, ChunkSnapshot, LocalAabb};
pub use store::{
    ChunkState, ChunkStateStore, SlotIndex, StoreError, DEFAULT_INITIAL_CAPACITY, MAX_PAGES,
    PAGE_SIZE,
};
