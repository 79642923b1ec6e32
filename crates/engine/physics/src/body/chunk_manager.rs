use super::BodyId;
use crate::coord::ChunkCoord;
use dashmap::DashMap;
use std::sync::Arc;

/// Notified when a tracked body crosses a chunk border
pub trait MovementListener: Send + Sync {
    fn on_body_moved(&self, body: BodyId, from: ChunkCoord, to: ChunkCoord);
}

/// Groups bodies by the chunk they are in
///
/// Holds ids only; the body itself is owned elsewhere. At most one map entry is
/// locked at a time.
#[derive(Default)]
pub struct ChunkManager {
    by_chunk: DashMap<ChunkCoord, Vec<BodyId>>,
    chunk_of: DashMap<BodyId, ChunkCoord>,
    listener: Option<Arc<dyn MovementListener>>,
}

impl ChunkManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: Arc<dyn MovementListener>) -> Self {
        Self {
            listener: Some(listener),
            ..Self::default()
        }
    }

    pub fn start_tracking(&self, body: BodyId, coord: ChunkCoord) {
        match self.chunk_of.insert(body, coord) {
            Some(previous) if previous == coord => return,
            Some(previous) => self.detach(body, previous),
            None => {}
        }
        self.by_chunk.entry(coord).or_default().push(body);
    }

    /// Returns the chunk the body was tracked in
    pub fn stop_tracking(&self, body: BodyId) -> Option<ChunkCoord> {
        let (_, coord) = self.chunk_of.remove(&body)?;
        self.detach(body, coord);
        Some(coord)
    }

    /// Re-bucket a body that crossed from `from` into `to`
    ///
    /// Ignored unless the body is currently tracked in `from`; an untracked or
    /// stale move never starts tracking.
    pub fn move_body(&self, body: BodyId, from: ChunkCoord, to: ChunkCoord) {
        if from == to {
            return;
        }
        match self.chunk_of.get_mut(&body) {
            Some(mut current) if *current == from => *current = to,
            _ => return,
        }
        self.detach(body, from);
        self.by_chunk.entry(to).or_default().push(body);

        if let Some(listener) = &self.listener {
            listener.on_body_moved(body, from, to);
        }
    }

    fn detach(&self, body: BodyId, coord: ChunkCoord) {
        if let Some(mut list) = self.by_chunk.get_mut(&coord) {
            list.retain(|b| *b != body);
        }
        self.by_chunk.remove_if(&coord, |_, list| list.is_empty());
    }

    pub fn chunk_of(&self, body: BodyId) -> Option<ChunkCoord> {
        self.chunk_of.get(&body).map(|entry| *entry)
    }

    /// Copy of the bodies currently in a chunk
    pub fn bodies_in_chunk(&self, coord: ChunkCoord) -> Vec<BodyId> {
        self.by_chunk
            .get(&coord)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Detach and return every body in a chunk in one step
    pub fn remove_all_in_chunk(&self, coord: ChunkCoord) -> Vec<BodyId> {
        let Some((_, removed)) = self.by_chunk.remove(&coord) else {
            return Vec::new();
        };
        for body in &removed {
            self.chunk_of.remove_if(body, |_, c| *c == coord);
        }
        removed
    }

    /// Every tracked body with its chunk
    pub fn tracked(&self) -> Vec<(BodyId, ChunkCoord)> {
        self.chunk_of
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunk_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_of.is_empty()
    }

    pub fn clear(&self) {
        self.by_chunk.clear();
        self.chunk_of.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        moves: Mutex<Vec<(BodyId, ChunkCoord, ChunkCoord)>>,
    }

    impl MovementListener for Recorder {
        fn on_body_moved(&self, body: BodyId, from: ChunkCoord, to: ChunkCoord) {
            self.moves.lock().push((body, from, to));
        }
    }

    #[test]
    fn test_track_and_stop() {
        let manager = ChunkManager::new();
        let body = BodyId::random();
        manager.start_tracking(body, ChunkCoord::ZERO);

        assert_eq!(manager.chunk_of(body), Some(ChunkCoord::ZERO));
        assert_eq!(manager.bodies_in_chunk(ChunkCoord::ZERO), vec![body]);

        assert_eq!(manager.stop_tracking(body), Some(ChunkCoord::ZERO));
        assert!(manager.bodies_in_chunk(ChunkCoord::ZERO).is_empty());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_retracking_moves_bucket() {
        let manager = ChunkManager::new();
        let body = BodyId::random();
        manager.start_tracking(body, ChunkCoord::ZERO);
        manager.start_tracking(body, ChunkCoord::new(1, 0, 0));

        assert!(manager.bodies_in_chunk(ChunkCoord::ZERO).is_empty());
        assert_eq!(manager.bodies_in_chunk(ChunkCoord::new(1, 0, 0)), vec![body]);
    }

    #[test]
    fn test_move_notifies_listener() {
        let recorder = Arc::new(Recorder::default());
        let manager = ChunkManager::with_listener(recorder.clone());
        let body = BodyId::random();
        let to = ChunkCoord::new(0, 0, 1);
        manager.start_tracking(body, ChunkCoord::ZERO);

        manager.move_body(body, ChunkCoord::ZERO, to);
        manager.move_body(body, to, to);

        assert_eq!(manager.chunk_of(body), Some(to));
        assert_eq!(manager.bodies_in_chunk(to), vec![body]);
        assert_eq!(*recorder.moves.lock(), vec![(body, ChunkCoord::ZERO, to)]);
    }

    #[test]
    fn test_move_ignores_untracked_and_stale_bodies() {
        let recorder = Arc::new(Recorder::default());
        let manager = ChunkManager::with_listener(recorder.clone());
        let stray = BodyId::random();
        let tracked = BodyId::random();
        let elsewhere = ChunkCoord::new(4, 0, 0);
        manager.start_tracking(tracked, ChunkCoord::ZERO);

        manager.move_body(stray, ChunkCoord::ZERO, elsewhere);
        manager.move_body(tracked, ChunkCoord::new(9, 9, 9), elsewhere);

        assert!(manager.chunk_of(stray).is_none());
        assert_eq!(manager.chunk_of(tracked), Some(ChunkCoord::ZERO));
        assert!(manager.bodies_in_chunk(elsewhere).is_empty());
        assert!(recorder.moves.lock().is_empty());
    }

    #[test]
    fn test_remove_all_in_chunk() {
        let manager = ChunkManager::new();
        let a = BodyId::random();
        let b = BodyId::random();
        let other = BodyId::random();
        manager.start_tracking(a, ChunkCoord::ZERO);
        manager.start_tracking(b, ChunkCoord::ZERO);
        manager.start_tracking(other, ChunkCoord::new(2, 0, 0));

        let removed = manager.remove_all_in_chunk(ChunkCoord::ZERO);

        assert_eq!(removed, vec![a, b]);
        assert!(manager.bodies_in_chunk(ChunkCoord::ZERO).is_empty());
        assert!(manager.chunk_of(a).is_none());
        assert_eq!(manager.chunk_of(other), Some(ChunkCoord::new(2, 0, 0)));
        assert!(manager.remove_all_in_chunk(ChunkCoord::ZERO).is_empty());
    }
}
