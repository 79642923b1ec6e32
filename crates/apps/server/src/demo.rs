//! Flat demo terrain and a few bodies to keep the simulation busy

use glam::Vec3;
use voxsim_physics::constraint::HingeSettings;
use voxsim_physics::{
    BlockCollision, BodyDesc, BodyId, ChunkCoord, ChunkSnapshot, ConstraintSettings,
    ConstraintSpace, VoxelPhysicsWorld, CHUNK_SIZE,
};

/// Solid layers at the bottom of every chunk with `y == 0`
const GROUND_LAYERS: u8 = 4;

pub fn flat_chunk(coord: ChunkCoord) -> ChunkSnapshot {
    if coord.y != 0 {
        return ChunkSnapshot::empty(coord);
    }
    let size = CHUNK_SIZE as u8;
    let mut blocks = Vec::with_capacity(size as usize * size as usize * GROUND_LAYERS as usize);
    for x in 0..size {
        for y in 0..GROUND_LAYERS {
            for z in 0..size {
                blocks.push(BlockCollision::full([x, y, z]));
            }
        }
    }
    ChunkSnapshot::new(coord, blocks)
}

/// Load every chunk within `radius` of the origin column
pub fn load_area(world: &VoxelPhysicsWorld, radius: i32) -> anyhow::Result<usize> {
    let mut loaded = 0;
    for x in -radius..=radius {
        for z in -radius..=radius {
            for y in 0..=1 {
                world.on_chunk_loaded(flat_chunk(ChunkCoord::new(x, y, z)))?;
                loaded += 1;
            }
        }
    }
    Ok(loaded)
}

/// Drop a grid of boxes above the origin and hinge neighbours into pairs
pub fn spawn_bodies(world: &VoxelPhysicsWorld, count: usize) -> anyhow::Result<Vec<BodyId>> {
    let cols = (count as f32).sqrt().ceil().max(1.0) as usize;
    let mut bodies = Vec::with_capacity(count);

    for i in 0..count {
        let position = Vec3::new(
            (i % cols) as f32 * 2.0 - cols as f32,
            12.0 + (i / cols) as f32 * 2.0,
            (i / cols) as f32 * 2.0 - cols as f32,
        );
        bodies.push(world.spawn_body(BodyDesc::cuboid(position, Vec3::splat(0.5)))?);
    }

    for pair in bodies.chunks_exact(2) {
        let hinge = ConstraintSettings::Hinge(HingeSettings {
            space: ConstraintSpace::LocalToBody,
            point1: Vec3::new(1.0, 0.0, 0.0),
            point2: Vec3::new(-1.0, 0.0, 0.0),
            axis1: Vec3::Z,
            axis2: Vec3::Z,
            limits: None,
        });
        world.create_constraint(&hinge, pair[0], pair[1])?;
    }
    Ok(bodies)
}
