//! Region-indexed constraint persistence
//!
//! Constraints are grouped into region files by the chunk they were saved
//! under. A small index maps each constraint id to its region so removals and
//! moves never scan every file. Writes only touch memory and mark the region
//! dirty; [`ConstraintStorage::save_dirty_regions`] writes dirty regions out on
//! the rayon pool.

use super::{Constraint, ConstraintId};
use crate::coord::{ChunkCoord, RegionPos};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors emitted by storage implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Byte-level persistence for region files and the region index
pub trait StorageBackend: Send + Sync + 'static {
    /// `Ok(None)` when the region was never written
    fn read_region(&self, region: RegionPos) -> Result<Option<Vec<u8>>, StorageError>;
    fn write_region(&self, region: RegionPos, data: &[u8]) -> Result<(), StorageError>;
    fn read_index(&self) -> Result<Option<Vec<u8>>, StorageError>;
    fn write_index(&self, data: &[u8]) -> Result<(), StorageError>;
}

/// Region files under one directory, written through a temp file and rename
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    const INDEX_FILE: &'static str = "index.bin";

    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.dir.join(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.dir.join(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(tmp, &path)?;
        Ok(())
    }
}

impl StorageBackend for FileStorage {
    fn read_region(&self, region: RegionPos) -> Result<Option<Vec<u8>>, StorageError> {
        self.read(&region.file_name())
    }

    fn write_region(&self, region: RegionPos, data: &[u8]) -> Result<(), StorageError> {
        self.write(&region.file_name(), data)
    }

    fn read_index(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.read(Self::INDEX_FILE)
    }

    fn write_index(&self, data: &[u8]) -> Result<(), StorageError> {
        self.write(Self::INDEX_FILE, data)
    }
}

/// In-memory backend for hosts without persistent storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    regions: DashMap<RegionPos, Vec<u8>>,
    index: Mutex<Option<Vec<u8>>>,
}

impl StorageBackend for MemoryStorage {
    fn read_region(&self, region: RegionPos) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.regions.get(&region).map(|data| data.clone()))
    }

    fn write_region(&self, region: RegionPos, data: &[u8]) -> Result<(), StorageError> {
        self.regions.insert(region, data.to_vec());
        Ok(())
    }

    fn read_index(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.index.lock().clone())
    }

    fn write_index(&self, data: &[u8]) -> Result<(), StorageError> {
        *self.index.lock() = Some(data.to_vec());
        Ok(())
    }
}

/// Result of one background flush
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

/// Completion of a background flush
///
/// Await [`FlushTicket::completed`], or call [`FlushTicket::wait`] outside an
/// async context. Dropping it does not cancel the flush.
pub struct FlushTicket {
    rx: oneshot::Receiver<FlushReport>,
}

impl FlushTicket {
    fn ready(report: FlushReport) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(report);
        Self { rx }
    }

    pub fn wait(self) -> FlushReport {
        self.rx.blocking_recv().unwrap_or_default()
    }

    pub async fn completed(self) -> FlushReport {
        self.rx.await.unwrap_or_default()
    }
}

type Region = HashMap<ConstraintId, Constraint>;

struct Inner {
    backend: Arc<dyn StorageBackend>,
    /// Regions read so far, including every dirty one
    regions: DashMap<RegionPos, Region>,
    index: DashMap<ConstraintId, RegionPos>,
    dirty: Mutex<HashSet<RegionPos>>,
    /// Serializes flushes so a later snapshot is never overwritten by an earlier one
    flush_lock: Mutex<()>,
    index_dirty: AtomicBool,
}

/// Region-indexed constraint store
#[derive(Clone)]
pub struct ConstraintStorage {
    inner: Arc<Inner>,
}

impl ConstraintStorage {
    /// Open a store and read its index
    pub fn open(backend: Arc<dyn StorageBackend>) -> Result<Self, StorageError> {
        let index: HashMap<ConstraintId, RegionPos> = match backend.read_index()? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => HashMap::new(),
        };
        tracing::debug!(constraints = index.len(), "constraint index loaded");

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                regions: DashMap::new(),
                index: index.into_iter().collect(),
                dirty: Mutex::new(HashSet::new()),
                flush_lock: Mutex::new(()),
                index_dirty: AtomicBool::new(false),
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: Arc::new(MemoryStorage::default()),
                regions: DashMap::new(),
                index: DashMap::new(),
                dirty: Mutex::new(HashSet::new()),
                flush_lock: Mutex::new(()),
                index_dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Make sure a region is resident
    fn load_region(&self, region: RegionPos) -> Result<(), StorageError> {
        if self.inner.regions.contains_key(&region) {
            return Ok(());
        }
        let loaded: Region = match self.inner.backend.read_region(region)? {
            Some(bytes) => {
                let list: Vec<Constraint> = bincode::deserialize(&bytes)?;
                list.into_iter().map(|c| (c.id, c)).collect()
            }
            None => Region::new(),
        };
        // A concurrent load may have won; keep whichever is resident
        self.inner.regions.entry(region).or_insert(loaded);
        Ok(())
    }

    fn mark_dirty(&self, region: RegionPos) {
        self.inner.dirty.lock().insert(region);
    }

    /// Write constraints under their `home_chunk`
    ///
    /// Constraints without a home chunk are skipped. A failure for one
    /// constraint does not stop the rest; the last error is returned.
    pub fn store_constraints(&self, constraints: &[Constraint]) -> Result<usize, StorageError> {
        let mut stored = 0;
        let mut last_error = None;

        for constraint in constraints {
            let Some(chunk) = constraint.home_chunk else {
                tracing::warn!(id = %constraint.id, "constraint has no home chunk, not stored");
                continue;
            };
            let region = chunk.region();
            if let Err(err) = self.load_region(region) {
                tracing::error!(id = %constraint.id, ?region, error = %err, "region load failed");
                last_error = Some(err);
                continue;
            }

            let previous = self.inner.index.insert(constraint.id, region);
            if let Some(previous) = previous.filter(|p| *p != region) {
                if let Some(mut old) = self.inner.regions.get_mut(&previous) {
                    old.remove(&constraint.id);
                }
                self.mark_dirty(previous);
            }

            let mut saved = constraint.clone();
            saved.handle = None;
            if let Some(mut resident) = self.inner.regions.get_mut(&region) {
                resident.insert(saved.id, saved);
            }
            self.mark_dirty(region);
            stored += 1;
        }

        if stored > 0 {
            self.inner.index_dirty.store(true, Ordering::Release);
        }
        match last_error {
            Some(err) if stored == 0 => Err(err),
            Some(err) => {
                tracing::warn!(stored, error = %err, "constraint batch partially stored");
                Ok(stored)
            }
            None => Ok(stored),
        }
    }

    /// Forget a constraint's persisted data
    pub fn remove_data(&self, id: ConstraintId) -> bool {
        let Some((_, region)) = self.inner.index.remove(&id) else {
            return false;
        };
        self.inner.index_dirty.store(true, Ordering::Release);
        if let Err(err) = self.load_region(region) {
            tracing::warn!(%id, ?region, error = %err, "region load failed during removal");
            return true;
        }
        if let Some(mut resident) = self.inner.regions.get_mut(&region) {
            resident.remove(&id);
        }
        self.mark_dirty(region);
        true
    }

    /// Persisted constraints saved under `chunk`
    pub fn constraints_in_chunk(&self, chunk: ChunkCoord) -> Result<Vec<Constraint>, StorageError> {
        let region = chunk.region();
        self.load_region(region)?;
        Ok(self
            .inner
            .regions
            .get(&region)
            .map(|resident| {
                resident
                    .values()
                    .filter(|c| c.home_chunk == Some(chunk))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Every persisted constraint the index knows about
    pub fn load_all(&self) -> Result<Vec<Constraint>, StorageError> {
        let regions: HashSet<RegionPos> = self.inner.index.iter().map(|e| *e.value()).collect();
        let mut all = Vec::new();
        for region in regions {
            self.load_region(region)?;
            if let Some(resident) = self.inner.regions.get(&region) {
                all.extend(
                    resident
                        .values()
                        .filter(|c| self.inner.index.get(&c.id).is_some_and(|r| *r == region))
                        .cloned(),
                );
            }
        }
        Ok(all)
    }

    pub fn contains(&self, id: ConstraintId) -> bool {
        self.inner.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.index.is_empty()
    }

    pub fn dirty_regions(&self) -> usize {
        self.inner.dirty.lock().len()
    }

    /// Write every dirty region on the rayon pool
    ///
    /// Regions that fail to write are marked dirty again for the next flush.
    pub fn save_dirty_regions(&self) -> FlushTicket {
        if self.inner.dirty.lock().is_empty() {
            return FlushTicket::ready(FlushReport::default());
        }

        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        rayon::spawn(move || {
            let _ = tx.send(flush_dirty(&inner));
        });
        FlushTicket { rx }
    }

    /// Write the region index if it changed
    pub fn save_index(&self) -> Result<(), StorageError> {
        if !self.inner.index_dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot: HashMap<ConstraintId, RegionPos> = self
            .inner
            .index
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        let result = bincode::serialize(&snapshot)
            .map_err(StorageError::from)
            .and_then(|bytes| self.inner.backend.write_index(&bytes));
        if result.is_err() {
            self.inner.index_dirty.store(true, Ordering::Release);
        }
        result
    }
}

fn flush_dirty(inner: &Inner) -> FlushReport {
    let _guard = inner.flush_lock.lock();
    let dirty: Vec<RegionPos> = inner.dirty.lock().drain().collect();
    let mut report = FlushReport::default();

    for region in dirty {
        let list: Vec<Constraint> = inner
            .regions
            .get(&region)
            .map(|resident| resident.values().cloned().collect())
            .unwrap_or_default();

        let result = bincode::serialize(&list)
            .map_err(StorageError::from)
            .and_then(|bytes| inner.backend.write_region(region, &bytes));
        match result {
            Ok(()) => report.written += 1,
            Err(err) => {
                tracing::warn!(?region, error = %err, "region write failed, will retry");
                inner.dirty.lock().insert(region);
                report.failed += 1;
            }
        }
    }

    tracing::debug!(written = report.written, failed = report.failed, "constraint regions flushed");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyId;
    use crate::constraint::{ConstraintSettings, ConstraintSpace, PointSettings};
    use glam::Vec3;
    use std::sync::atomic::AtomicUsize;

    fn constraint(chunk: ChunkCoord) -> Constraint {
        let settings = ConstraintSettings::Point(PointSettings {
            space: ConstraintSpace::LocalToBody,
            point1: Vec3::ZERO,
            point2: Vec3::X,
        });
        let mut c = Constraint::new(&settings, BodyId::random(), BodyId::WORLD).unwrap();
        c.home_chunk = Some(chunk);
        c
    }

    /// Fails the first `failures` region writes
    struct FlakyStorage {
        inner: MemoryStorage,
        failures: AtomicUsize,
    }

    impl StorageBackend for FlakyStorage {
        fn read_region(&self, region: RegionPos) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.read_region(region)
        }

        fn write_region(&self, region: RegionPos, data: &[u8]) -> Result<(), StorageError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(io::Error::other("disk full").into());
            }
            self.inner.write_region(region, data)
        }

        fn read_index(&self) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.read_index()
        }

        fn write_index(&self, data: &[u8]) -> Result<(), StorageError> {
            self.inner.write_index(data)
        }
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> = Arc::new(FileStorage::new(dir.path()).unwrap());
        let storage = ConstraintStorage::open(backend.clone()).unwrap();

        let a = constraint(ChunkCoord::new(0, 0, 0));
        let b = constraint(ChunkCoord::new(40, 0, 0));
        assert_eq!(storage.store_constraints(&[a.clone(), b.clone()]).unwrap(), 2);
        assert_eq!(storage.save_dirty_regions().wait().written, 2);
        storage.save_index().unwrap();

        let reopened = ConstraintStorage::open(backend).unwrap();
        let mut loaded = reopened.load_all().unwrap();
        loaded.sort_by_key(|c| c.id);
        let mut expected = vec![a, b];
        expected.sort_by_key(|c| c.id);
        assert_eq!(loaded, expected);
    }

    #[test]
    fn test_constraints_in_chunk_filters_region() {
        let storage = ConstraintStorage::in_memory();
        let here = constraint(ChunkCoord::new(1, 0, 1));
        let neighbour = constraint(ChunkCoord::new(2, 0, 1));
        storage.store_constraints(&[here.clone(), neighbour]).unwrap();

        let found = storage.constraints_in_chunk(ChunkCoord::new(1, 0, 1)).unwrap();
        assert_eq!(found, vec![here]);
    }

    #[test]
    fn test_moving_constraint_between_regions() {
        let storage = ConstraintStorage::in_memory();
        let mut c = constraint(ChunkCoord::new(0, 0, 0));
        storage.store_constraints(&[c.clone()]).unwrap();

        c.home_chunk = Some(ChunkCoord::new(64, 0, 0));
        storage.store_constraints(&[c.clone()]).unwrap();

        assert!(storage.constraints_in_chunk(ChunkCoord::ZERO).unwrap().is_empty());
        assert_eq!(storage.load_all().unwrap(), vec![c]);
        assert_eq!(storage.dirty_regions(), 2);
    }

    #[test]
    fn test_remove_data() {
        let storage = ConstraintStorage::in_memory();
        let c = constraint(ChunkCoord::ZERO);
        storage.store_constraints(&[c.clone()]).unwrap();

        assert!(storage.remove_data(c.id));
        assert!(!storage.remove_data(c.id));
        assert!(storage.load_all().unwrap().is_empty());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_without_home_chunk_is_skipped() {
        let storage = ConstraintStorage::in_memory();
        let mut c = constraint(ChunkCoord::ZERO);
        c.home_chunk = None;
        assert_eq!(storage.store_constraints(&[c]).unwrap(), 0);
        assert_eq!(storage.dirty_regions(), 0);
    }

    #[test]
    fn test_failed_region_is_retried() {
        let backend = Arc::new(FlakyStorage {
            inner: MemoryStorage::default(),
            failures: AtomicUsize::new(1),
        });
        let storage = ConstraintStorage::open(backend.clone()).unwrap();
        storage.store_constraints(&[constraint(ChunkCoord::ZERO)]).unwrap();

        let first = storage.save_dirty_regions().wait();
        assert_eq!(first, FlushReport { written: 0, failed: 1 });
        assert_eq!(storage.dirty_regions(), 1);

        let second = storage.save_dirty_regions().wait();
        assert_eq!(second, FlushReport { written: 1, failed: 0 });
        assert_eq!(storage.dirty_regions(), 0);
        assert!(backend.inner.read_region(ChunkCoord::ZERO.region()).unwrap().is_some());
    }

    #[test]
    fn test_flush_ticket_is_awaitable() {
        let storage = ConstraintStorage::in_memory();
        storage.store_constraints(&[constraint(ChunkCoord::ZERO)]).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let report = runtime.block_on(storage.save_dirty_regions().completed());
        assert_eq!(report.written, 1);
    }

    #[test]
    fn test_overlapping_flushes_write_each_region_once() {
        let storage = ConstraintStorage::in_memory();
        let chunks: Vec<ChunkCoord> = (0..8).map(|i| ChunkCoord::new(i * 64, 0, 0)).collect();
        let regions: HashSet<RegionPos> = chunks.iter().map(|c| c.region()).collect();
        let batch: Vec<Constraint> = chunks.iter().map(|c| constraint(*c)).collect();
        storage.store_constraints(&batch).unwrap();

        let tickets: Vec<FlushTicket> = (0..4).map(|_| storage.save_dirty_regions()).collect();
        let written: usize = tickets.into_iter().map(|t| t.wait().written).sum();

        assert_eq!(written, regions.len());
        assert_eq!(storage.dirty_regions(), 0);
    }
}
