//! Block-layout snapshots handed over by the host world

use crate::coord::ChunkCoord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Axis-aligned box in block-local units, usually within `[0, 1]`
#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct LocalAabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl LocalAabb {
    pub const FULL: Self = Self {
        min: [0.0; 3],
        max: [1.0; 3],
    };

    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn half_extents(&self) -> [f32; 3] {
        [
            (self.max[0] - self.min[0]) * 0.5,
            (self.max[1] - self.min[1]) * 0.5,
            (self.max[2] - self.min[2]) * 0.5,
        ]
    }

    #[inline]
    pub fn center(&self) -> [f32; 3] {
        [
            (self.max[0] + self.min[0]) * 0.5,
            (self.max[1] + self.min[1]) * 0.5,
            (self.max[2] + self.min[2]) * 0.5,
        ]
    }
}

/// Collision boxes of one block
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct BlockCollision {
    /// Block position inside the chunk
    pub local: [u8; 3],
    pub boxes: Vec<LocalAabb>,
}

impl BlockCollision {
    /// A solid full-cube block
    pub fn full(local: [u8; 3]) -> Self {
        Self {
            local,
            boxes: vec![LocalAabb::FULL],
        }
    }
}

/// Immutable copy of a chunk's collision-relevant block data
///
/// Blocks are kept sorted by local position, so two snapshots with the same
/// layout produce the same [`ChunkSnapshot::content_hash`] regardless of the
/// order the host enumerated them in.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub coord: ChunkCoord,
    blocks: Vec<BlockCollision>,
}

impl ChunkSnapshot {
    pub fn new(coord: ChunkCoord, mut blocks: Vec<BlockCollision>) -> Self {
        blocks.sort_by_key(|b| b.local);
        Self { coord, blocks }
    }

    pub fn empty(coord: ChunkCoord) -> Self {
        Self {
            coord,
            blocks: Vec::new(),
        }
    }

    pub fn blocks(&self) -> &[BlockCollision] {
        &self.blocks
    }

    /// True when no block contributes a collision box
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.boxes.is_empty())
    }

    /// SHA-256 of the block layout truncated to 64 bits
    ///
    /// The chunk coordinate is not part of the hash: shapes are chunk-local and
    /// can be shared between chunks with the same layout.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        for block in &self.blocks {
            if block.boxes.is_empty() {
                continue;
            }
            hasher.update(block.local);
            hasher.update((block.boxes.len() as u32).to_le_bytes());
            for aabb in &block.boxes {
                for v in aabb.min.iter().chain(aabb.max.iter()) {
                    hasher.update(v.to_le_bytes());
                }
            }
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }
}
