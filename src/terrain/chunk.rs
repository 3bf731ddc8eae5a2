use glam::IVec3;

use super::data::{GridPoint, Triangle, GRID_POINT_SIZE, TRIANGLE_SIZE};
use super::pipeline::{validate_point_count, SharedPipeline};
use super::settings::GenerationSettings;
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{DeviceBuffer, StorageHint, TransferMode, VERTEX_SLOT};
use crate::render::{Computable, DrawCall, Drawable, FrameContext, Primitive};

/// Generation state of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Buffers reserved, nothing generated yet
    Uninitialized,
    /// Vertex buffers hold the mesh for `last_settings`
    Generated,
    /// Forced to regenerate on the next update
    Stale,
}

/// Result of [`TerrainChunk::update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Settings unchanged, no device work done
    Skipped,
    Regenerated { triangles: u32 },
}

/// One cube of lattice points and the mesh extracted from it
///
/// Each vertex buffer has a staging twin. Updates stream into the staging
/// pair and swap it in only once both transfers have finished, so the live
/// pair always holds one complete mesh.
pub struct TerrainChunk {
    pipeline: SharedPipeline,
    origin: IVec3,
    point_count: u32,
    resolution: u32,
    points_vbo: DeviceBuffer,
    triangles_vbo: DeviceBuffer,
    staging_points: DeviceBuffer,
    staging_triangles: DeviceBuffer,
    triangle_capacity: u32,
    triangle_count: u32,
    last_settings: Option<GenerationSettings>,
    state: ChunkState,
    transfer: TransferMode,
}

impl TerrainChunk {
    pub fn new(
        pipeline: SharedPipeline,
        point_count: u32,
        origin: IVec3,
        transfer: TransferMode,
    ) -> TerrainResult<Self> {
        let resolution = validate_point_count(point_count)?;

        let (device, triangle_capacity) = {
            let pipeline = pipeline.lock();
            if resolution > pipeline.side() {
                return Err(TerrainError::ResolutionExceedsCapacity {
                    resolution,
                    side: pipeline.side(),
                });
            }
            (
                pipeline.device().clone(),
                pipeline.policy().triangle_capacity(point_count),
            )
        };

        let vertex_buffer = |name: &str, size: u64| {
            DeviceBuffer::with_size(
                device.clone(),
                format!("Chunk {:?} {}", origin, name),
                VERTEX_SLOT,
                size,
                StorageHint::Vertex,
            )
        };
        let points_size = point_count as u64 * GRID_POINT_SIZE;
        let triangles_size = triangle_capacity as u64 * TRIANGLE_SIZE;
        let points_vbo = vertex_buffer("Points 0", points_size)?;
        let triangles_vbo = vertex_buffer("Triangles 0", triangles_size)?;
        let staging_points = vertex_buffer("Points 1", points_size)?;
        let staging_triangles = vertex_buffer("Triangles 1", triangles_size)?;

        log::debug!(
            "[TerrainChunk] Created at {:?} with {} points, {} triangle slots",
            origin,
            point_count,
            triangle_capacity
        );

        Ok(Self {
            pipeline,
            origin,
            point_count,
            resolution,
            points_vbo,
            triangles_vbo,
            staging_points,
            staging_triangles,
            triangle_capacity,
            triangle_count: 0,
            last_settings: None,
            state: ChunkState::Uninitialized,
            transfer,
        })
    }

    /// Regenerate the mesh if `settings` differ from the last applied ones
    ///
    /// On error the previously generated mesh and bookkeeping are kept:
    /// results land in the staging buffers, which become live only after
    /// every transfer succeeded.
    pub fn update(&mut self, settings: &GenerationSettings) -> TerrainResult<UpdateOutcome> {
        if self.state == ChunkState::Generated && self.last_settings.as_ref() == Some(settings) {
            return Ok(UpdateOutcome::Skipped);
        }

        let count = {
            let mut pipeline = self.pipeline.lock();
            pipeline.dispatch(settings, self.origin, self.resolution)?;

            let count = pipeline.checked_triangle_count()?;
            if count > self.triangle_capacity {
                return Err(TerrainError::ExtractionOverflow {
                    count,
                    capacity: self.triangle_capacity,
                });
            }

            let points = self.transfer.transfer(
                pipeline.points_buffer(),
                &self.staging_points,
                self.point_count as u64 * GRID_POINT_SIZE,
            )?;
            log::trace!("[TerrainChunk] Points transfer: {:?}", points);

            if count > 0 {
                let triangles = self.transfer.transfer(
                    pipeline.triangles_buffer(),
                    &self.staging_triangles,
                    count as u64 * TRIANGLE_SIZE,
                )?;
                log::trace!("[TerrainChunk] Triangles transfer: {:?}", triangles);
            }
            count
        };

        std::mem::swap(&mut self.points_vbo, &mut self.staging_points);
        std::mem::swap(&mut self.triangles_vbo, &mut self.staging_triangles);
        self.triangle_count = count;
        self.last_settings = Some(*settings);
        self.state = ChunkState::Generated;

        log::debug!(
            "[TerrainChunk] Regenerated {:?}: {} triangles",
            self.origin,
            count
        );
        Ok(UpdateOutcome::Regenerated { triangles: count })
    }

    /// Force the next update to regenerate
    pub fn mark_stale(&mut self) {
        if self.state == ChunkState::Generated {
            self.state = ChunkState::Stale;
        }
    }

    /// Host copy of the live triangles
    pub fn read_triangles(&self) -> TerrainResult<Vec<Triangle>> {
        self.triangles_vbo.read_records(0, self.triangle_count as usize)
    }

    /// Host copy of the point cloud; empty before the first generation
    pub fn read_points(&self) -> TerrainResult<Vec<GridPoint>> {
        if self.state == ChunkState::Uninitialized {
            return Ok(Vec::new());
        }
        self.points_vbo.read_records(0, self.point_count as usize)
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn triangle_capacity(&self) -> u32 {
        self.triangle_capacity
    }

    pub fn point_count(&self) -> u32 {
        self.point_count
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn origin(&self) -> IVec3 {
        self.origin
    }

    pub fn last_settings(&self) -> Option<&GenerationSettings> {
        self.last_settings.as_ref()
    }

    pub fn points_vertex_buffer(&self) -> &DeviceBuffer {
        &self.points_vbo
    }

    pub fn triangles_vertex_buffer(&self) -> &DeviceBuffer {
        &self.triangles_vbo
    }

    pub fn pipeline(&self) -> &SharedPipeline {
        &self.pipeline
    }
}

impl Computable for TerrainChunk {
    fn update(&mut self, settings: &GenerationSettings) -> TerrainResult<UpdateOutcome> {
        TerrainChunk::update(self, settings)
    }
}

impl Drawable for TerrainChunk {
    fn draw(&self, frame: &FrameContext) -> Vec<DrawCall> {
        let mut calls = Vec::new();
        if self.state == ChunkState::Uninitialized {
            return calls;
        }

        if frame.draw_points {
            if let Some(buffer) = self.points_vbo.handle() {
                calls.push(DrawCall {
                    primitive: Primitive::Points,
                    buffer,
                    first: 0,
                    count: self.point_count,
                    stride: GRID_POINT_SIZE,
                });
            }
        }

        if self.triangle_count > 0 {
            if let Some(buffer) = self.triangles_vbo.handle() {
                calls.push(DrawCall {
                    primitive: Primitive::Triangles,
                    buffer,
                    first: 0,
                    count: self.triangle_count * 3,
                    stride: TRIANGLE_SIZE / 3,
                });
            }
        }
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{ComputeDevice, HostDevice};
    use crate::terrain::{CapacityPolicy, MarchingCubesPipeline};
    use std::sync::Arc;

    fn pipeline(points: u32) -> SharedPipeline {
        let device: Arc<dyn ComputeDevice> = Arc::new(HostDevice::new());
        MarchingCubesPipeline::new(device, points, CapacityPolicy::Heuristic)
            .unwrap()
            .into_shared()
    }

    #[test]
    fn test_new_chunk_is_uninitialized() {
        let chunk =
            TerrainChunk::new(pipeline(512), 512, IVec3::ZERO, TransferMode::default()).unwrap();
        assert_eq!(chunk.state(), ChunkState::Uninitialized);
        assert_eq!(chunk.triangle_count(), 0);
        assert_eq!(chunk.triangle_capacity(), 1024);
        assert_eq!(chunk.resolution(), 8);
        assert!(chunk.read_points().unwrap().is_empty());
        assert!(chunk.draw(&FrameContext::default()).is_empty());
    }

    #[test]
    fn test_chunk_larger_than_pipeline_rejected() {
        assert!(matches!(
            TerrainChunk::new(pipeline(8), 27, IVec3::ZERO, TransferMode::default()),
            Err(TerrainError::ResolutionExceedsCapacity { resolution: 3, side: 2 })
        ));
        assert!(matches!(
            TerrainChunk::new(pipeline(8), 10, IVec3::ZERO, TransferMode::default()),
            Err(TerrainError::InvalidPointCount { count: 10 })
        ));
    }

    #[test]
    fn test_mark_stale_only_after_generation() {
        let mut chunk =
            TerrainChunk::new(pipeline(8), 8, IVec3::ZERO, TransferMode::default()).unwrap();
        chunk.mark_stale();
        assert_eq!(chunk.state(), ChunkState::Uninitialized);
        chunk.update(&GenerationSettings::default()).unwrap();
        chunk.mark_stale();
        assert_eq!(chunk.state(), ChunkState::Stale);
    }
}
