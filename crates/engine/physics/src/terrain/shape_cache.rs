use lru::LruCache;
use parking_lot::Mutex;
use rapier3d::geometry::SharedShape;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Compiled collision shape for one chunk layout
///
/// The shape is expressed in chunk-local space; the owning body sits at the
/// chunk origin.
pub struct TerrainShape {
    pub shape: SharedShape,
    pub content_hash: u64,
    pub box_count: usize,
}

impl fmt::Debug for TerrainShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerrainShape")
            .field("content_hash", &format_args!("{:016x}", self.content_hash))
            .field("box_count", &self.box_count)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShapeCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded LRU of compiled shapes keyed by layout hash
///
/// A capacity of zero disables caching entirely.
pub struct ShapeCache {
    inner: Option<Mutex<LruCache<u64, Arc<TerrainShape>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ShapeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, hash: u64) -> Option<Arc<TerrainShape>> {
        let inner = self.inner.as_ref()?;
        let found = inner.lock().get(&hash).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, hash: u64, shape: Arc<TerrainShape>) {
        if let Some(inner) = &self.inner {
            inner.lock().put(hash, shape);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Some(inner) = &self.inner {
            inner.lock().clear();
        }
    }

    pub fn stats(&self) -> ShapeCacheStats {
        ShapeCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
