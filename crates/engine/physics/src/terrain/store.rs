//! Lock-free chunk slot table
//!
//! Slots live in fixed-size pages that are allocated once and never move. The
//! page directory is a boxed slice of `OnceLock`s sized for the maximum
//! capacity, so growing the table only fills in new pages and readers holding
//! an index never observe a reallocation.
//!
//! Every per-slot field is its own atomic column. Lifecycle state and the
//! generation version share one 64-bit word (version in the high half, state in
//! the low byte) so a ticket and the state it guards are compared in a single
//! CAS. Allocation, free and growth are serialized by one coarse mutex; nothing
//! else takes it.

use super::shape_cache::TerrainShape;
use crate::coord::ChunkCoord;
use crate::engine::BodyHandle;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

pub type SlotIndex = u32;

/// Slots per page
pub const PAGE_SIZE: usize = 1024;

/// Hard limit on the page directory
pub const MAX_PAGES: usize = 4096;

pub const DEFAULT_INITIAL_CAPACITY: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("chunk store exhausted at {capacity} slots")]
    CapacityExhausted { capacity: usize },
}

/// Lifecycle state of a chunk slot
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum ChunkState {
    Unloaded = 0,
    LoadingScheduled = 1,
    GeneratingShape = 2,
    Ready = 3,
    Removing = 4,
}

impl ChunkState {
    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::LoadingScheduled,
            2 => Self::GeneratingShape,
            3 => Self::Ready,
            4 => Self::Removing,
            _ => Self::Unloaded,
        }
    }

    /// A generation task owns the slot
    #[inline]
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::LoadingScheduled | Self::GeneratingShape | Self::Removing
        )
    }
}

#[inline]
fn pack(version: u32, state: ChunkState) -> u64 {
    ((version as u64) << 32) | state as u64
}

#[inline]
fn unpack(word: u64) -> (u32, ChunkState) {
    ((word >> 32) as u32, ChunkState::from_u8(word as u8))
}

/// One page of slot columns
struct Page {
    lifecycle: Box<[AtomicU64]>,
    body: Box<[AtomicU64]>,
    placeholder: Box<[AtomicBool]>,
    refs: Box<[AtomicU32]>,
    shape: Box<[Mutex<Option<Arc<TerrainShape>>>]>,
}

impl Page {
    fn new() -> Self {
        Self {
            lifecycle: (0..PAGE_SIZE).map(|_| AtomicU64::new(0)).collect(),
            body: (0..PAGE_SIZE).map(|_| AtomicU64::new(0)).collect(),
            placeholder: (0..PAGE_SIZE).map(|_| AtomicBool::new(false)).collect(),
            refs: (0..PAGE_SIZE).map(|_| AtomicU32::new(0)).collect(),
            shape: (0..PAGE_SIZE).map(|_| Mutex::new(None)).collect(),
        }
    }
}

struct Allocator {
    free: Vec<SlotIndex>,
    /// High-water mark of handed out indices
    next: SlotIndex,
    capacity: usize,
    /// Freed while still referenced; returned to `free` by the last `release_ref`
    deferred: HashSet<SlotIndex>,
    coords: Vec<Option<ChunkCoord>>,
}

/// Concurrent chunk coordinate to slot table
pub struct ChunkStateStore {
    pages: Box<[OnceLock<Page>]>,
    index: DashMap<ChunkCoord, SlotIndex>,
    alloc: Mutex<Allocator>,
    capacity: AtomicUsize,
    initial_capacity: usize,
    max_capacity: usize,
}

impl Default for ChunkStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_CAPACITY)
    }
}

impl ChunkStateStore {
    pub fn new(initial_capacity: usize) -> Self {
        Self::with_limits(initial_capacity, MAX_PAGES * PAGE_SIZE)
    }

    /// Store that refuses to grow past `max_capacity` slots
    pub fn with_limits(initial_capacity: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.clamp(1, MAX_PAGES * PAGE_SIZE);
        let initial_capacity = initial_capacity.clamp(1, max_capacity);
        let page_count = max_capacity.div_ceil(PAGE_SIZE);

        let store = Self {
            pages: (0..page_count).map(|_| OnceLock::new()).collect(),
            index: DashMap::new(),
            alloc: Mutex::new(Allocator {
                free: Vec::new(),
                next: 0,
                capacity: initial_capacity,
                deferred: HashSet::new(),
                coords: Vec::with_capacity(initial_capacity),
            }),
            capacity: AtomicUsize::new(initial_capacity),
            initial_capacity,
            max_capacity,
        };
        store.ensure_pages(initial_capacity);
        store
    }

    fn ensure_pages(&self, capacity: usize) {
        for page in self.pages.iter().take(capacity.div_ceil(PAGE_SIZE)) {
            page.get_or_init(Page::new);
        }
    }

    #[inline]
    fn locate(&self, index: SlotIndex) -> Option<(&Page, usize)> {
        let index = index as usize;
        let page = self.pages.get(index / PAGE_SIZE)?.get()?;
        Some((page, index % PAGE_SIZE))
    }

    // --- structural operations (coarse lock) ---

    /// Slot for `coord`, allocating one if the coordinate is not managed yet
    pub fn reserve(&self, coord: ChunkCoord) -> Result<SlotIndex, StoreError> {
        if let Some(index) = self.index.get(&coord) {
            return Ok(*index);
        }

        let mut alloc = self.alloc.lock();
        if let Some(index) = self.index.get(&coord) {
            return Ok(*index);
        }

        let index = self.allocate(&mut alloc)?;
        self.reset_slot(index);
        let slot = index as usize;
        if alloc.coords.len() <= slot {
            alloc.coords.resize(slot + 1, None);
        }
        alloc.coords[slot] = Some(coord);
        self.index.insert(coord, index);
        Ok(index)
    }

    fn allocate(&self, alloc: &mut Allocator) -> Result<SlotIndex, StoreError> {
        while let Some(index) = alloc.free.pop() {
            if self.ref_count(index) > 0 {
                alloc.deferred.insert(index);
                continue;
            }
            return Ok(index);
        }

        loop {
            if alloc.next as usize >= alloc.capacity {
                self.grow(alloc)?;
            }
            let index = alloc.next;
            alloc.next += 1;
            if self.ref_count(index) > 0 {
                // Still held by a task from before a `clear`
                alloc.deferred.insert(index);
                continue;
            }
            return Ok(index);
        }
    }

    fn grow(&self, alloc: &mut Allocator) -> Result<(), StoreError> {
        let current = alloc.capacity;
        let grown = (current + current.div_ceil(2)).min(self.max_capacity);
        if grown <= current {
            tracing::warn!(capacity = current, "chunk store capacity exhausted");
            return Err(StoreError::CapacityExhausted { capacity: current });
        }
        self.ensure_pages(grown);
        alloc.capacity = grown;
        self.capacity.store(grown, Ordering::Release);
        tracing::debug!(from = current, to = grown, "chunk store grown");
        Ok(())
    }

    fn reset_slot(&self, index: SlotIndex) {
        if let Some((page, i)) = self.locate(index) {
            let (version, _) = unpack(page.lifecycle[i].load(Ordering::Acquire));
            page.lifecycle[i].store(pack(version, ChunkState::Unloaded), Ordering::Release);
            page.body[i].store(BodyHandle::UNUSED.0, Ordering::Release);
            page.placeholder[i].store(false, Ordering::Release);
            page.shape[i].lock().take();
        }
    }

    /// Stop managing `coord`
    ///
    /// The slot's shape is dropped and its index returned to the free list, or
    /// parked until the last outstanding reference is released.
    pub fn release(&self, coord: ChunkCoord) -> Option<SlotIndex> {
        let mut alloc = self.alloc.lock();
        let (_, index) = self.index.remove(&coord)?;

        if let Some(slot) = alloc.coords.get_mut(index as usize) {
            *slot = None;
        }
        if let Some((page, i)) = self.locate(index) {
            page.shape[i].lock().take();
            page.body[i].store(BodyHandle::UNUSED.0, Ordering::Release);
            page.placeholder[i].store(false, Ordering::Release);
            self.set_state(index, ChunkState::Unloaded);
        }

        if self.ref_count(index) > 0 {
            alloc.deferred.insert(index);
        } else {
            alloc.free.push(index);
        }
        Some(index)
    }

    /// Drop every shape and forget all coordinates
    ///
    /// Versions are bumped so tickets issued before the clear go stale.
    pub fn clear(&self) {
        let mut alloc = self.alloc.lock();
        self.index.clear();

        for index in 0..alloc.next {
            if let Some((page, i)) = self.locate(index) {
                page.shape[i].lock().take();
                page.body[i].store(BodyHandle::UNUSED.0, Ordering::Release);
                page.placeholder[i].store(false, Ordering::Release);
                let (version, _) = unpack(page.lifecycle[i].load(Ordering::Acquire));
                page.lifecycle[i].store(
                    pack(version.wrapping_add(1), ChunkState::Unloaded),
                    Ordering::Release,
                );
            }
        }

        alloc.free.clear();
        alloc.deferred.clear();
        alloc.coords.clear();
        alloc.next = 0;
        alloc.capacity = self.initial_capacity;
        self.capacity.store(self.initial_capacity, Ordering::Release);
    }

    // --- lookups ---

    pub fn index_of(&self, coord: ChunkCoord) -> Option<SlotIndex> {
        self.index.get(&coord).map(|entry| *entry)
    }

    pub fn coord_of(&self, index: SlotIndex) -> Option<ChunkCoord> {
        self.alloc.lock().coords.get(index as usize).copied().flatten()
    }

    /// Every coordinate currently holding a slot
    pub fn managed_coords(&self) -> Vec<ChunkCoord> {
        self.index.iter().map(|entry| *entry.key()).collect()
    }

    /// Slots in the `Ready` state
    pub fn active_indices(&self) -> Vec<SlotIndex> {
        self.index
            .iter()
            .map(|entry| *entry.value())
            .filter(|&index| self.state(index) == ChunkState::Ready)
            .collect()
    }

    /// Engine bodies owned by managed slots
    pub fn body_handles(&self) -> Vec<(ChunkCoord, BodyHandle)> {
        self.index
            .iter()
            .filter_map(|entry| {
                let body = self.body_handle(*entry.value());
                (!body.is_unused()).then_some((*entry.key(), body))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    // --- lifecycle ---

    pub fn state(&self, index: SlotIndex) -> ChunkState {
        self.locate(index)
            .map_or(ChunkState::Unloaded, |(page, i)| {
                unpack(page.lifecycle[i].load(Ordering::Acquire)).1
            })
    }

    pub fn version(&self, index: SlotIndex) -> u32 {
        self.locate(index).map_or(0, |(page, i)| {
            unpack(page.lifecycle[i].load(Ordering::Acquire)).0
        })
    }

    /// Overwrite the state, keeping the version
    pub fn set_state(&self, index: SlotIndex, state: ChunkState) {
        if let Some((page, i)) = self.locate(index) {
            let _ = page.lifecycle[i].fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(unpack(word).0, state))
            });
        }
    }

    /// Claim the slot for a new generation task
    ///
    /// Returns the task's version ticket, or `None` while another task owns the
    /// slot or it is being removed.
    pub fn try_schedule_generation(&self, index: SlotIndex) -> Option<u32> {
        let (page, i) = self.locate(index)?;
        let cell = &page.lifecycle[i];
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let (version, state) = unpack(current);
            if state.is_busy() {
                return None;
            }
            let ticket = version.wrapping_add(1);
            match cell.compare_exchange_weak(
                current,
                pack(ticket, ChunkState::LoadingScheduled),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ticket),
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    fn transition(&self, index: SlotIndex, ticket: u32, from: ChunkState, to: ChunkState) -> bool {
        self.locate(index).is_some_and(|(page, i)| {
            page.lifecycle[i]
                .compare_exchange(
                    pack(ticket, from),
                    pack(ticket, to),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }

    /// `LoadingScheduled -> GeneratingShape` for the holder of `ticket`
    pub fn try_advance_to_generating(&self, index: SlotIndex, ticket: u32) -> bool {
        self.transition(
            index,
            ticket,
            ChunkState::LoadingScheduled,
            ChunkState::GeneratingShape,
        )
    }

    /// `GeneratingShape -> Ready` for the holder of `ticket`
    pub fn try_complete(&self, index: SlotIndex, ticket: u32) -> bool {
        self.transition(index, ticket, ChunkState::GeneratingShape, ChunkState::Ready)
    }

    /// `GeneratingShape -> Unloaded` after a failed generation
    pub fn try_fail(&self, index: SlotIndex, ticket: u32) -> bool {
        self.transition(
            index,
            ticket,
            ChunkState::GeneratingShape,
            ChunkState::Unloaded,
        )
    }

    /// Abort a scheduled task before it started generating
    pub fn try_reset_from_scheduled(&self, index: SlotIndex) -> bool {
        let Some((page, i)) = self.locate(index) else {
            return false;
        };
        page.lifecycle[i]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (version, state) = unpack(word);
                (state == ChunkState::LoadingScheduled)
                    .then_some(pack(version, ChunkState::Unloaded))
            })
            .is_ok()
    }

    /// Move to `Removing` and invalidate every outstanding ticket
    pub fn mark_removing(&self, index: SlotIndex) -> Option<u32> {
        let (page, i) = self.locate(index)?;
        let previous = page.lifecycle[i]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(unpack(word).0.wrapping_add(1), ChunkState::Removing))
            })
            .ok()?;
        Some(unpack(previous).0.wrapping_add(1))
    }

    /// A ticket is stale once a newer one was issued for the slot
    pub fn is_version_stale(&self, index: SlotIndex, ticket: u32) -> bool {
        ticket < self.version(index)
    }

    // --- per-slot fields ---

    pub fn body_handle(&self, index: SlotIndex) -> BodyHandle {
        self.locate(index).map_or(BodyHandle::UNUSED, |(page, i)| {
            BodyHandle(page.body[i].load(Ordering::Acquire))
        })
    }

    pub fn set_body_handle(&self, index: SlotIndex, body: BodyHandle) {
        if let Some((page, i)) = self.locate(index) {
            page.body[i].store(body.0, Ordering::Release);
        }
    }

    pub fn is_placeholder(&self, index: SlotIndex) -> bool {
        self.locate(index)
            .is_some_and(|(page, i)| page.placeholder[i].load(Ordering::Acquire))
    }

    pub fn set_placeholder(&self, index: SlotIndex, placeholder: bool) {
        if let Some((page, i)) = self.locate(index) {
            page.placeholder[i].store(placeholder, Ordering::Release);
        }
    }

    pub fn shape(&self, index: SlotIndex) -> Option<Arc<TerrainShape>> {
        let (page, i) = self.locate(index)?;
        page.shape[i].lock().clone()
    }

    /// Swap in a new shape; the previous one is dropped unless it is the same
    /// allocation
    pub fn install_shape(&self, index: SlotIndex, shape: Option<Arc<TerrainShape>>) {
        let Some((page, i)) = self.locate(index) else {
            return;
        };
        let previous = std::mem::replace(&mut *page.shape[i].lock(), shape);
        drop(previous);
    }

    // --- references ---

    pub fn ref_count(&self, index: SlotIndex) -> u32 {
        self.locate(index)
            .map_or(0, |(page, i)| page.refs[i].load(Ordering::Acquire))
    }

    /// Pin the slot index against reuse
    pub fn acquire(&self, index: SlotIndex) -> bool {
        match self.locate(index) {
            Some((page, i)) => {
                page.refs[i].fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Drop a pin taken with [`ChunkStateStore::acquire`]
    pub fn release_ref(&self, index: SlotIndex) {
        let Some((page, i)) = self.locate(index) else {
            return;
        };
        let previous = page.refs[i]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            let mut alloc = self.alloc.lock();
            if alloc.deferred.remove(&index) {
                alloc.free.push(index);
            }
        }
    }
}
