//! Snapshot to collision shape compilation
//!
//! Runs on worker threads. Each worker keeps its own small LRU of elementary
//! cuboids so the common full-block and slab boxes are built once per thread.

use super::shape_cache::{ShapeCache, TerrainShape};
use super::snapshot::ChunkSnapshot;
use lru::LruCache;
use rapier3d::math::{Isometry, Real};
use rapier3d::geometry::SharedShape;
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Boxes thinner than this along any axis are not collidable
pub const MIN_HALF_EXTENT: f32 = 0.001;

const BOX_SHAPE_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(n) => n,
    None => unreachable!(),
};

thread_local! {
    /// Elementary cuboids keyed by the bit pattern of their half extents
    static BOX_SHAPES: RefCell<LruCache<[u32; 3], SharedShape>> =
        RefCell::new(LruCache::new(BOX_SHAPE_CACHE_CAPACITY));
}

#[inline]
fn with_box_shape(half: [f32; 3]) -> SharedShape {
    let key = half.map(f32::to_bits);
    BOX_SHAPES.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(shape) = cache.get(&key) {
            return shape.clone();
        }
        let shape = SharedShape::cuboid(half[0], half[1], half[2]);
        // Evicted entry is dropped here
        let _ = cache.push(key, shape.clone());
        shape
    })
}

/// Builds compound terrain shapes from block snapshots
pub struct ShapeGenerator {
    cache: Arc<ShapeCache>,
}

impl ShapeGenerator {
    pub fn new(cache: Arc<ShapeCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ShapeCache> {
        &self.cache
    }

    /// Compile a snapshot, `None` when nothing in it is collidable
    pub fn generate(&self, snapshot: &ChunkSnapshot) -> Option<Arc<TerrainShape>> {
        if snapshot.is_empty() {
            return None;
        }

        let hash = snapshot.content_hash();
        if let Some(shape) = self.cache.get(hash) {
            return Some(shape);
        }

        let mut parts: Vec<(Isometry<Real>, SharedShape)> = Vec::new();
        for block in snapshot.blocks() {
            let base = block.local.map(f32::from);
            for aabb in &block.boxes {
                let half = aabb.half_extents();
                if half.iter().any(|&h| h <= MIN_HALF_EXTENT) {
                    continue;
                }
                let center = aabb.center();
                let position = Isometry::translation(
                    base[0] + center[0],
                    base[1] + center[1],
                    base[2] + center[2],
                );
                parts.push((position, with_box_shape(half)));
            }
        }

        if parts.is_empty() {
            return None;
        }

        let shape = Arc::new(TerrainShape {
            box_count: parts.len(),
            shape: SharedShape::compound(parts),
            content_hash: hash,
        });
        self.cache.insert(hash, shape.clone());
        Some(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::ChunkCoord;
    use crate::terrain::snapshot::{BlockCollision, LocalAabb};

    fn floor(coord: ChunkCoord, width: u8) -> ChunkSnapshot {
        let blocks = (0..width)
            .flat_map(|x| (0..width).map(move |z| BlockCollision::full([x, 0, z])))
            .collect();
        ChunkSnapshot::new(coord, blocks)
    }

    #[test]
    fn test_second_request_hits_cache() {
        let generator = ShapeGenerator::new(Arc::new(ShapeCache::new(16)));
        let first = generator.generate(&floor(ChunkCoord::ZERO, 4)).unwrap();
        let second = generator
            .generate(&floor(ChunkCoord::new(1, 0, 0), 4))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.box_count, 16);
        assert_eq!(generator.cache().stats().hits, 1);
    }

    #[test]
    fn test_differing_block_misses() {
        let generator = ShapeGenerator::new(Arc::new(ShapeCache::new(16)));
        let first = generator.generate(&floor(ChunkCoord::ZERO, 4)).unwrap();

        let mut blocks = floor(ChunkCoord::ZERO, 4).blocks().to_vec();
        blocks[5] = BlockCollision {
            local: blocks[5].local,
            boxes: vec![LocalAabb::new([0.0; 3], [1.0, 0.5, 1.0])],
        };
        let second = generator
            .generate(&ChunkSnapshot::new(ChunkCoord::ZERO, blocks))
            .unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(generator.cache().stats().hits, 0);
    }

    #[test]
    fn test_degenerate_boxes_skipped() {
        let generator = ShapeGenerator::new(Arc::new(ShapeCache::new(16)));
        let snapshot = ChunkSnapshot::new(
            ChunkCoord::ZERO,
            vec![
                BlockCollision {
                    local: [0, 0, 0],
                    boxes: vec![LocalAabb::new([0.0; 3], [1.0, 0.0005, 1.0])],
                },
                BlockCollision::full([1, 0, 0]),
            ],
        );
        let shape = generator.generate(&snapshot).unwrap();
        assert_eq!(shape.box_count, 1);
    }

    #[test]
    fn test_only_degenerate_boxes_is_empty() {
        let generator = ShapeGenerator::new(Arc::new(ShapeCache::new(16)));
        let snapshot = ChunkSnapshot::new(
            ChunkCoord::ZERO,
            vec![BlockCollision {
                local: [0, 0, 0],
                boxes: vec![LocalAabb::new([0.0; 3], [0.0, 1.0, 1.0])],
            }],
        );
        assert!(generator.generate(&snapshot).is_none());
        assert!(generator.cache().is_empty());
    }

    #[test]
    fn test_generate_without_cache() {
        let generator = ShapeGenerator::new(Arc::new(ShapeCache::new(0)));
        let a = generator.generate(&floor(ChunkCoord::ZERO, 2)).unwrap();
        let b = generator.generate(&floor(ChunkCoord::ZERO, 2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.content_hash, b.content_hash);
    }
}
