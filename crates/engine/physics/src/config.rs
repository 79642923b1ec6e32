use crate::terrain::{DEFAULT_INITIAL_CAPACITY, MAX_PAGES, PAGE_SIZE};
use std::{env, path::PathBuf};

/// Configuration for a [`crate::VoxelPhysicsWorld`].
#[derive(Debug, Clone)]
pub struct PhysicsConfig {
    /// Directory constraint region files are written to.
    pub data_dir: PathBuf,
    /// Chunk slots allocated up front.
    pub initial_chunk_capacity: usize,
    /// Compiled shapes kept for reuse; 0 disables the cache.
    pub shape_cache_capacity: usize,
    /// Worker threads for shape generation; 0 lets rayon decide.
    pub worker_threads: usize,
    /// Give freshly loaded chunks a full-cube body until their real shape is ready.
    pub placeholder_shapes: bool,
    /// Seconds between periodic constraint flushes.
    pub flush_interval_secs: u64,
    /// Vertical gravity acceleration.
    pub gravity: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            initial_chunk_capacity: DEFAULT_INITIAL_CAPACITY,
            shape_cache_capacity: 1024,
            worker_threads: 0,
            placeholder_shapes: false,
            flush_interval_secs: 30,
            gravity: -9.81,
        }
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PhysicsConfig {
    /// Builds a configuration from `VOXSIM_*` environment variables, falling
    /// back to the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let data_dir = env::var("VOXSIM_DATA")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let config = Self {
            data_dir,
            initial_chunk_capacity: parsed(
                "VOXSIM_CHUNK_CAPACITY",
                defaults.initial_chunk_capacity,
            ),
            shape_cache_capacity: parsed("VOXSIM_SHAPE_CACHE", defaults.shape_cache_capacity),
            worker_threads: parsed("VOXSIM_WORKERS", defaults.worker_threads),
            placeholder_shapes: parsed("VOXSIM_PLACEHOLDERS", defaults.placeholder_shapes),
            flush_interval_secs: parsed("VOXSIM_FLUSH_INTERVAL", defaults.flush_interval_secs),
            gravity: parsed("VOXSIM_GRAVITY", defaults.gravity),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.initial_chunk_capacity >= 1,
            "chunk capacity must be >= 1"
        );
        anyhow::ensure!(
            self.initial_chunk_capacity <= MAX_PAGES * PAGE_SIZE,
            "chunk capacity must be <= {}",
            MAX_PAGES * PAGE_SIZE
        );
        anyhow::ensure!(self.flush_interval_secs >= 1, "flush interval must be >= 1s");
        anyhow::ensure!(self.gravity.is_finite(), "gravity must be finite");
        Ok(())
    }

    /// Where constraint regions live
    pub fn constraint_dir(&self) -> PathBuf {
        self.data_dir.join("constraints")
    }
}
