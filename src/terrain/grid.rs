use std::sync::Arc;

use glam::IVec3;

use super::chunk::{TerrainChunk, UpdateOutcome};
use super::pipeline::{validate_point_count, CapacityPolicy, MarchingCubesPipeline, SharedPipeline};
use super::settings::GenerationSettings;
use crate::error::TerrainResult;
use crate::gpu::{ComputeDevice, TransferMode};
use crate::render::{Computable, DrawCall, Drawable, FrameContext};

/// Summary of a grid-wide update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridUpdate {
    pub regenerated: usize,
    pub skipped: usize,
    pub triangles: u64,
}

/// A cube of chunks sharing one compute pipeline
///
/// Neighbouring chunks overlap by one lattice plane so their surfaces meet.
/// Chunks are updated one after another; the shared pipeline only holds one
/// chunk's results at a time.
pub struct ChunkGrid {
    pipeline: SharedPipeline,
    chunks: Vec<TerrainChunk>,
    chunks_per_axis: u32,
    last_settings: Option<GenerationSettings>,
}

impl ChunkGrid {
    pub fn new(
        device: Arc<dyn ComputeDevice>,
        point_count: u32,
        chunks_per_axis: u32,
        policy: CapacityPolicy,
        transfer: TransferMode,
    ) -> TerrainResult<Self> {
        let side = validate_point_count(point_count)?;
        let pipeline = MarchingCubesPipeline::new(device, point_count, policy)?.into_shared();

        let stride = side as i32 - 1;
        let mut chunks = Vec::with_capacity((chunks_per_axis as usize).pow(3));
        for i in 0..chunks_per_axis as i32 {
            for j in 0..chunks_per_axis as i32 {
                for k in 0..chunks_per_axis as i32 {
                    let origin = IVec3::new(i, j, k) * stride;
                    chunks.push(TerrainChunk::new(
                        pipeline.clone(),
                        point_count,
                        origin,
                        transfer,
                    )?);
                }
            }
        }

        log::info!(
            "[ChunkGrid] Created {} chunks ({}^3) of {} points",
            chunks.len(),
            chunks_per_axis,
            point_count
        );

        Ok(Self {
            pipeline,
            chunks,
            chunks_per_axis,
            last_settings: None,
        })
    }

    /// Update every chunk when the settings changed since the last call
    pub fn update_all(&mut self, settings: &GenerationSettings) -> TerrainResult<GridUpdate> {
        let mut summary = GridUpdate::default();
        if self.last_settings.as_ref() == Some(settings) {
            summary.skipped = self.chunks.len();
            summary.triangles = self.total_triangles();
            return Ok(summary);
        }

        for chunk in &mut self.chunks {
            match chunk.update(settings)? {
                UpdateOutcome::Regenerated { .. } => summary.regenerated += 1,
                UpdateOutcome::Skipped => summary.skipped += 1,
            }
        }
        self.last_settings = Some(*settings);
        summary.triangles = self.total_triangles();

        log::info!(
            "[ChunkGrid] Updated {} chunks, {} triangles total",
            summary.regenerated,
            summary.triangles
        );
        Ok(summary)
    }

    /// Force every chunk to regenerate on the next update
    pub fn mark_stale(&mut self) {
        self.last_settings = None;
        for chunk in &mut self.chunks {
            chunk.mark_stale();
        }
    }

    pub fn total_triangles(&self) -> u64 {
        self.chunks.iter().map(|c| c.triangle_count() as u64).sum()
    }

    pub fn chunks(&self) -> &[TerrainChunk] {
        &self.chunks
    }

    pub fn chunks_per_axis(&self) -> u32 {
        self.chunks_per_axis
    }

    pub fn pipeline(&self) -> &SharedPipeline {
        &self.pipeline
    }

    /// World-space extent covered by the grid, as (min, max) corners
    pub fn bounds(&self) -> (glam::Vec3, glam::Vec3) {
        let min = self
            .chunks
            .iter()
            .map(|c| c.origin())
            .fold(IVec3::MAX, IVec3::min);
        let max = self
            .chunks
            .iter()
            .map(|c| c.origin() + IVec3::splat(c.resolution() as i32 - 1))
            .fold(IVec3::MIN, IVec3::max);
        if self.chunks.is_empty() {
            return (glam::Vec3::ZERO, glam::Vec3::ZERO);
        }
        (min.as_vec3(), max.as_vec3())
    }
}

impl Computable for ChunkGrid {
    fn update(&mut self, settings: &GenerationSettings) -> TerrainResult<UpdateOutcome> {
        let summary = self.update_all(settings)?;
        if summary.regenerated == 0 {
            return Ok(UpdateOutcome::Skipped);
        }
        Ok(UpdateOutcome::Regenerated {
            triangles: summary.triangles.min(u32::MAX as u64) as u32,
        })
    }
}

impl Drawable for ChunkGrid {
    fn draw(&self, frame: &FrameContext) -> Vec<DrawCall> {
        self.chunks.iter().flat_map(|chunk| chunk.draw(frame)).collect()
    }
}
