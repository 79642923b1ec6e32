mod demo;
mod metrics;

use clap::Parser;
use glam::Vec3;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use voxsim_physics::{PhysicsConfig, VoxelPhysicsWorld};

#[derive(Parser)]
#[command(name = "server")]
#[command(about = "Headless voxel physics server", long_about = None)]
struct Args {
    /// Directory for persisted constraints (overrides VOXSIM_DATA)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Simulation steps per second
    #[arg(long, default_value_t = 60)]
    tick_rate: u32,

    /// Chunks loaded around the origin, in chunks
    #[arg(long, default_value_t = 2)]
    view_radius: i32,

    /// Boxes dropped onto the demo terrain
    #[arg(long, default_value_t = 16)]
    demo_bodies: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.tick_rate >= 1, "tick rate must be >= 1");
    anyhow::ensure!(args.view_radius >= 0, "view radius must be >= 0");

    let mut config = PhysicsConfig::from_env()?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    let flush_every = Duration::from_secs(config.flush_interval_secs);

    let world = VoxelPhysicsWorld::open(config)?;
    let chunks = demo::load_area(&world, args.view_radius)?;
    let bodies = demo::spawn_bodies(&world, args.demo_bodies)?;
    tracing::info!(chunks, bodies = bodies.len(), "demo world ready");

    let dt = 1.0 / args.tick_rate as f32;
    let mut tick = tokio::time::interval(Duration::from_secs_f32(dt));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut flush = tokio::time::interval(flush_every);
    let mut stats = tokio::time::interval(Duration::from_secs(30));
    let mut blast = tokio::time::interval(Duration::from_secs(10));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = tick.tick() => world.tick(dt)?,
            _ = flush.tick() => {
                let ticket = world.flush_persistence();
                tokio::spawn(async move {
                    let report = ticket.completed().await;
                    if report.failed > 0 {
                        tracing::warn!(failed = report.failed, "constraint regions not flushed");
                    }
                });
            }
            _ = stats.tick() => metrics::print_stats(&world.stats()),
            _ = blast.tick() => {
                world.explode(Vec3::new(0.0, 4.0, 0.0), 8.0, 20.0);
            }
            _ = &mut shutdown => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    let report = tokio::task::spawn_blocking(move || world.shutdown()).await?;
    if report.failed > 0 {
        tracing::error!(failed = report.failed, "constraint regions lost");
    }
    Ok(())
}
