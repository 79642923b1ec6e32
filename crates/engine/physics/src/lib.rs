//! Chunk-synchronized physics for streamed voxel worlds
//!
//! The host streams chunk snapshots in and out; this crate keeps terrain
//! collision, dynamic bodies and constraints consistent with what is loaded.
//! All engine mutation happens on one simulation thread, fed through
//! [`SimulationHandle`]. Terrain shapes are compiled on a worker pool.

pub mod body;
pub mod config;
pub mod constraint;
pub mod coord;
pub mod engine;
pub mod explosion;
pub mod simulation;
pub mod terrain;
pub mod world;

pub use body::{BodyId, BodyRegistry, ChunkManager, MovementListener};
pub use config::PhysicsConfig;
pub use constraint::{
    ActivationOutcome, Constraint, ConstraintError, ConstraintId, ConstraintKind,
    ConstraintManager, ConstraintSettings, ConstraintSpace, ConstraintStorage, FlushReport,
};
pub use coord::{ChunkCoord, CHUNK_SIZE};
pub use engine::{BodyDesc, BodyHandle, ConstraintHandle, EngineError, PhysicsEngine, RapierEngine};
pub use explosion::apply_explosion;
pub use simulation::{SimulationHandle, SimulationThread};
pub use terrain::{
    BlockCollision, ChunkLifecycleManager, ChunkSnapshot, ChunkState, ChunkStateStore,
    LocalAabb, ScheduleOutcome, StoreError,
};
pub use world::{VoxelPhysicsWorld, WorldError, WorldStats};

// Re-export glam so hosts share the vector types
pub use glam;
