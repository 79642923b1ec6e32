use voxsim_physics::WorldStats;

/// Log a one-line summary of the world
pub fn print_stats(stats: &WorldStats) {
    tracing::info!(
        "Ticks: {} | Chunks: {} ({} ready, {} rebuilds queued) | Bodies: {} | Constraints: {} active, {} pending | Shape cache: {} hits, {} misses",
        stats.ticks,
        stats.terrain.managed_chunks,
        stats.terrain.ready_chunks,
        stats.terrain.pending_rebuilds,
        stats.live_bodies,
        stats.active_constraints,
        stats.pending_constraints,
        stats.terrain.shape_cache.hits,
        stats.terrain.shape_cache.misses,
    );
}
