//! terrain-gen: generate a marching-cubes terrain grid and optionally
//! render a snapshot of it
//!
//! Usage: `terrain-gen [config.toml]`

use anyhow::{Context, Result};

use marching_terrain::render::{capture_snapshot, save_snapshot};
use marching_terrain::{open_device, ChunkGrid, FrameContext, TerrainConfig, TerrainRenderer};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => TerrainConfig::load(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => {
            log::info!("No configuration given, using defaults");
            TerrainConfig::default()
        }
    };

    let opened = open_device(config.device.backend).context("failed to open compute device")?;
    log::info!("Using {:?} backend", opened.backend());

    let mut grid = ChunkGrid::new(
        opened.compute(),
        config.chunks.point_count,
        config.chunks.chunks_per_axis,
        config.chunks.capacity,
        config.transfer,
    )?;

    let summary = grid
        .update_all(&config.generation)
        .context("terrain generation failed")?;

    for chunk in grid.chunks() {
        log::info!(
            "Chunk at {:?}: {} triangles ({} slots)",
            chunk.origin(),
            chunk.triangle_count(),
            chunk.triangle_capacity()
        );
    }
    log::info!(
        "Generated {} chunks, {} triangles, {} pipeline dispatches",
        summary.regenerated,
        summary.triangles,
        grid.pipeline().lock().dispatch_count()
    );

    if let Some(path) = config.render.snapshot_path() {
        match opened.wgpu() {
            Some(device) => {
                let renderer =
                    TerrainRenderer::new(device.clone(), wgpu::TextureFormat::Rgba8UnormSrgb);
                let (min, max) = grid.bounds();
                let frame = FrameContext::framing(
                    min,
                    max,
                    config.render.aspect(),
                    config.generation,
                    config.render.draw_points,
                );
                let image = capture_snapshot(
                    &renderer,
                    &grid,
                    &frame,
                    config.render.width,
                    config.render.height,
                )?;
                save_snapshot(&image, &path)?;
                log::info!("Snapshot written to {}", path.display());
            }
            None => log::warn!("Snapshots need the GPU backend, skipping {}", path.display()),
        }
    }

    Ok(())
}
