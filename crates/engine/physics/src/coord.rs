//! Chunk and region coordinates
//!
//! A [`ChunkCoord`] names one fixed-size cuboid section of the voxel world. It is
//! used both as a hash-map key and, through [`ChunkCoord::pack`], as a compact
//! 64-bit key.

use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Edge length of a chunk section in blocks
pub const CHUNK_SIZE: i32 = 16;

/// Number of chunks per region edge (regions are 32x32x32 chunks)
pub const REGION_SHIFT: i32 = 5;

/// Identifies a chunk section in chunk units
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkCoord {
    // Bits: [x:22][z:22][y:20]
    const X_SHIFT: u32 = 42;
    const Z_SHIFT: u32 = 20;
    const XZ_MASK: u64 = (1 << 22) - 1;
    const Y_MASK: u64 = (1 << 20) - 1;

    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chunk containing a world-space position
    pub fn containing(position: Vec3) -> Self {
        let block = position.floor().as_ivec3();
        Self::from_ivec3(block.div_euclid(IVec3::splat(CHUNK_SIZE)))
    }

    pub fn from_ivec3(v: IVec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }

    pub fn as_ivec3(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }

    /// World-space position of the chunk's minimum corner
    pub fn origin(&self) -> Vec3 {
        (self.as_ivec3() * CHUNK_SIZE).as_vec3()
    }

    /// Pack into a 64-bit key
    ///
    /// x and z keep 22 signed bits, y keeps 20 signed bits. Coordinates outside
    /// that range alias.
    pub fn pack(&self) -> u64 {
        ((self.x as u64 & Self::XZ_MASK) << Self::X_SHIFT)
            | ((self.z as u64 & Self::XZ_MASK) << Self::Z_SHIFT)
            | (self.y as u64 & Self::Y_MASK)
    }

    /// Inverse of [`ChunkCoord::pack`]
    pub fn unpack(key: u64) -> Self {
        Self {
            x: sign_extend((key >> Self::X_SHIFT) & Self::XZ_MASK, 22),
            y: sign_extend(key & Self::Y_MASK, 20),
            z: sign_extend((key >> Self::Z_SHIFT) & Self::XZ_MASK, 22),
        }
    }

    /// Region this chunk is persisted under
    pub fn region(&self) -> RegionPos {
        RegionPos {
            x: self.x >> REGION_SHIFT,
            y: self.y >> REGION_SHIFT,
            z: self.z >> REGION_SHIFT,
        }
    }
}

impl fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}

fn sign_extend(value: u64, bits: u32) -> i32 {
    let shift = 64 - bits;
    (((value << shift) as i64) >> shift) as i32
}

/// Identifies a persistence region (a cube of 32^3 chunks)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct RegionPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl RegionPos {
    /// File name used by file-backed storage
    pub fn file_name(&self) -> String {
        format!("r.{}.{}.{}.bin", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip_negative() {
        let coord = ChunkCoord::new(-1, -1, -1);
        assert_eq!(ChunkCoord::unpack(coord.pack()), coord);

        let coord = ChunkCoord::new(-2_000_000, 500_000, 1_999_999);
        assert_eq!(ChunkCoord::unpack(coord.pack()), coord);
    }

    #[test]
    fn test_pack_distinct_axes() {
        let a = ChunkCoord::new(1, 0, 0).pack();
        let b = ChunkCoord::new(0, 1, 0).pack();
        let c = ChunkCoord::new(0, 0, 1).pack();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_containing_floors_negative_positions() {
        assert_eq!(ChunkCoord::containing(Vec3::new(0.5, 0.5, 0.5)), ChunkCoord::ZERO);
        assert_eq!(
            ChunkCoord::containing(Vec3::new(-0.5, 15.9, 16.0)),
            ChunkCoord::new(-1, 0, 1)
        );
    }

    #[test]
    fn test_region_of_chunk() {
        assert_eq!(
            ChunkCoord::new(31, -1, 32).region(),
            RegionPos { x: 0, y: -1, z: 1 }
        );
    }
}
