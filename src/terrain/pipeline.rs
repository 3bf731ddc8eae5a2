//! Two-stage marching cubes compute pipeline
//!
//! Stage 1 writes the density lattice into the points buffer, stage 2
//! polygonises it into the triangles buffer while counting emitted triangles
//! with the atomic counter. The pipeline is single-buffered: one chunk's
//! worth of results lives here until the next dispatch overwrites it.

use std::sync::Arc;

use glam::IVec3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::data::{GridPoint, Triangle, GRID_POINT_SIZE, TRIANGLE_SIZE};
use super::settings::GenerationSettings;
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::{
    AtomicCounter, BufferMapping, ComputeDevice, DeviceBuffer, Kernel, KernelUniforms, MapIntent,
    StorageHint, POINTS_SLOT, TRIANGLES_SLOT,
};

/// Pipeline shared by several chunks; the lock serialises their updates
pub type SharedPipeline = Arc<Mutex<MarchingCubesPipeline>>;

/// Most triangles a single cube can produce
pub const MAX_TRIANGLES_PER_CUBE: u32 = 5;

/// How many triangle slots to reserve for a given point count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Two triangles per lattice point
    #[default]
    Heuristic,
    /// Five triangles per cube, never overflows
    WorstCase,
    /// An explicit number of triangles
    Fixed(u32),
}

impl CapacityPolicy {
    pub fn triangle_capacity(&self, point_count: u32) -> u32 {
        match *self {
            CapacityPolicy::Heuristic => point_count.saturating_mul(2),
            CapacityPolicy::WorstCase => {
                let cubes = cube_side(point_count).unwrap_or(0).saturating_sub(1);
                cubes
                    .saturating_mul(cubes)
                    .saturating_mul(cubes)
                    .saturating_mul(MAX_TRIANGLES_PER_CUBE)
            }
            CapacityPolicy::Fixed(triangles) => triangles,
        }
    }
}

/// Exact integer cube root, if `count` is a non-zero perfect cube
pub fn cube_side(count: u32) -> Option<u32> {
    if count == 0 {
        return None;
    }
    let estimate = (count as f64).cbrt().round() as u64;
    (estimate.saturating_sub(1)..=estimate + 1)
        .find(|&side| side * side * side == count as u64)
        .map(|side| side as u32)
}

/// Validate a point count and return points per axis
pub fn validate_point_count(count: u32) -> TerrainResult<u32> {
    cube_side(count).ok_or(TerrainError::InvalidPointCount { count })
}

pub struct MarchingCubesPipeline {
    device: Arc<dyn ComputeDevice>,
    points: DeviceBuffer,
    triangles: DeviceBuffer,
    counter: AtomicCounter,
    policy: CapacityPolicy,
    side: u32,
    point_capacity: u32,
    triangle_capacity: u32,
    dispatches: u64,
}

impl MarchingCubesPipeline {
    /// Reserve buffers for `capacity_points` lattice points
    pub fn new(
        device: Arc<dyn ComputeDevice>,
        capacity_points: u32,
        policy: CapacityPolicy,
    ) -> TerrainResult<Self> {
        let side = validate_point_count(capacity_points)?;
        let triangle_capacity = policy.triangle_capacity(capacity_points);

        let points = DeviceBuffer::with_size(
            device.clone(),
            "Terrain Points",
            POINTS_SLOT,
            capacity_points as u64 * GRID_POINT_SIZE,
            StorageHint::Storage,
        )?;
        let triangles = DeviceBuffer::with_size(
            device.clone(),
            "Terrain Triangles",
            TRIANGLES_SLOT,
            triangle_capacity as u64 * TRIANGLE_SIZE,
            StorageHint::Storage,
        )?;
        let counter = AtomicCounter::new(device.clone())?;
        counter.reset()?;

        log::info!(
            "[MarchingCubesPipeline] Created on {:?} backend: {} points ({}^3), {} triangle slots",
            device.backend(),
            capacity_points,
            side,
            triangle_capacity
        );

        Ok(Self {
            device,
            points,
            triangles,
            counter,
            policy,
            side,
            point_capacity: capacity_points,
            triangle_capacity,
            dispatches: 0,
        })
    }

    /// Wrap for sharing between chunks
    pub fn into_shared(self) -> SharedPipeline {
        Arc::new(Mutex::new(self))
    }

    /// Run both stages for one chunk
    pub fn dispatch(
        &mut self,
        settings: &GenerationSettings,
        origin: IVec3,
        resolution: u32,
    ) -> TerrainResult<()> {
        let uniforms = self.uniforms(settings, origin, resolution)?;
        self.counter.reset()?;
        self.run(Kernel::DensityField, &uniforms)?;
        self.run(Kernel::ExtractSurface, &uniforms)?;
        self.dispatches += 1;

        log::debug!(
            "[MarchingCubesPipeline] Dispatch #{} at {:?}, resolution {}",
            self.dispatches,
            origin,
            resolution
        );
        Ok(())
    }

    /// Stage 1 only: evaluate the density field
    pub fn generate_field(
        &mut self,
        settings: &GenerationSettings,
        origin: IVec3,
        resolution: u32,
    ) -> TerrainResult<()> {
        let uniforms = self.uniforms(settings, origin, resolution)?;
        self.run(Kernel::DensityField, &uniforms)
    }

    /// Stage 2 only: polygonise whatever field the points buffer holds
    pub fn extract_surface(&mut self, iso_level: f32, resolution: u32) -> TerrainResult<()> {
        let settings = GenerationSettings {
            iso_level,
            ..Default::default()
        };
        let uniforms = self.uniforms(&settings, IVec3::ZERO, resolution)?;
        self.counter.reset()?;
        self.run(Kernel::ExtractSurface, &uniforms)
    }

    /// Replace the lattice with a host-provided field
    pub fn load_field(&mut self, points: &[GridPoint]) -> TerrainResult<()> {
        let count = u32::try_from(points.len())
            .map_err(|_| TerrainError::InvalidPointCount { count: u32::MAX })?;
        let resolution = validate_point_count(count)?;
        self.check_resolution(resolution)?;
        self.points.write_records(0, points)
    }

    /// Triangles emitted by the last extraction, including any past capacity
    pub fn triangle_count(&self) -> TerrainResult<u32> {
        self.counter.read()
    }

    /// Triangle count, failing if the extraction ran out of slots
    pub fn checked_triangle_count(&self) -> TerrainResult<u32> {
        let count = self.triangle_count()?;
        if count > self.triangle_capacity {
            log::warn!(
                "[MarchingCubesPipeline] Extraction overflow: {} triangles for {} slots",
                count,
                self.triangle_capacity
            );
            return Err(TerrainError::ExtractionOverflow {
                count,
                capacity: self.triangle_capacity,
            });
        }
        Ok(count)
    }

    pub fn points_buffer(&self) -> &DeviceBuffer {
        &self.points
    }

    pub fn triangles_buffer(&self) -> &DeviceBuffer {
        &self.triangles
    }

    /// Scoped read mapping of the whole points buffer
    pub fn expose_points_buffer(&self) -> TerrainResult<BufferMapping<'_>> {
        self.points.map_full(MapIntent::Read)
    }

    /// Scoped read mapping of the whole triangles buffer
    pub fn expose_triangles_buffer(&self) -> TerrainResult<BufferMapping<'_>> {
        self.triangles.map_full(MapIntent::Read)
    }

    /// Lattice of the last stage 1 run at `resolution`
    pub fn read_points(&self, resolution: u32) -> TerrainResult<Vec<GridPoint>> {
        self.check_resolution(resolution)?;
        self.points.read_records(0, (resolution as usize).pow(3))
    }

    /// First `count` triangles of the triangles buffer
    pub fn read_triangles(&self, count: u32) -> TerrainResult<Vec<Triangle>> {
        self.triangles.read_records(0, count.min(self.triangle_capacity) as usize)
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    pub fn point_capacity(&self) -> u32 {
        self.point_capacity
    }

    pub fn triangle_capacity(&self) -> u32 {
        self.triangle_capacity
    }

    /// Points per axis the buffers can hold
    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn policy(&self) -> CapacityPolicy {
        self.policy
    }

    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.device
    }

    fn check_resolution(&self, resolution: u32) -> TerrainResult<()> {
        if resolution == 0 || resolution > self.side {
            return Err(TerrainError::ResolutionExceedsCapacity {
                resolution,
                side: self.side,
            });
        }
        Ok(())
    }

    fn uniforms(
        &self,
        settings: &GenerationSettings,
        origin: IVec3,
        resolution: u32,
    ) -> TerrainResult<KernelUniforms> {
        self.check_resolution(resolution)?;
        Ok(KernelUniforms::new(
            settings,
            origin,
            resolution,
            self.triangle_capacity,
        ))
    }

    /// Bind the kernel's buffers, run it, and wait for its writes
    fn run(&self, kernel: Kernel, uniforms: &KernelUniforms) -> TerrainResult<()> {
        self.points.bind()?;
        if kernel == Kernel::ExtractSurface {
            self.triangles.bind()?;
            self.counter.bind()?;
        }
        self.device.dispatch(kernel, uniforms)?;
        self.device.memory_barrier();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HostDevice;
    use glam::Vec3;

    fn host() -> Arc<dyn ComputeDevice> {
        Arc::new(HostDevice::new())
    }

    #[test]
    fn test_cube_side() {
        assert_eq!(cube_side(0), None);
        assert_eq!(cube_side(1), Some(1));
        assert_eq!(cube_side(8), Some(2));
        assert_eq!(cube_side(10), None);
        assert_eq!(cube_side(32768), Some(32));
        assert_eq!(cube_side(1_000_000), Some(100));
        assert_eq!(cube_side(999_999), None);
    }

    #[test]
    fn test_rejects_invalid_point_counts() {
        for count in [0, 10, 26] {
            assert!(matches!(
                MarchingCubesPipeline::new(host(), count, CapacityPolicy::Heuristic),
                Err(TerrainError::InvalidPointCount { .. })
            ));
        }
    }

    #[test]
    fn test_capacity_policies() {
        assert_eq!(CapacityPolicy::Heuristic.triangle_capacity(64), 128);
        assert_eq!(CapacityPolicy::WorstCase.triangle_capacity(64), 135);
        assert_eq!(CapacityPolicy::WorstCase.triangle_capacity(1), 0);
        assert_eq!(CapacityPolicy::Fixed(7).triangle_capacity(64), 7);

        let pipeline = MarchingCubesPipeline::new(host(), 27, CapacityPolicy::Heuristic).unwrap();
        assert_eq!(pipeline.triangle_capacity(), 54);
        assert_eq!(pipeline.points_buffer().size(), 27 * 16);
        assert_eq!(pipeline.triangles_buffer().size(), 54 * 72);
        assert_eq!(pipeline.triangle_count().unwrap(), 0);
    }

    #[test]
    fn test_resolution_bounded_by_capacity() {
        let mut pipeline =
            MarchingCubesPipeline::new(host(), 8, CapacityPolicy::Heuristic).unwrap();
        let settings = GenerationSettings::default();
        assert!(matches!(
            pipeline.dispatch(&settings, IVec3::ZERO, 3),
            Err(TerrainError::ResolutionExceedsCapacity { resolution: 3, side: 2 })
        ));
        assert!(pipeline.dispatch(&settings, IVec3::ZERO, 0).is_err());
        assert_eq!(pipeline.dispatch_count(), 0);
    }

    #[test]
    fn test_field_positions_follow_origin() {
        let mut pipeline =
            MarchingCubesPipeline::new(host(), 27, CapacityPolicy::Heuristic).unwrap();
        let settings = GenerationSettings::default();
        pipeline
            .generate_field(&settings, IVec3::new(2, 0, -2), 3)
            .unwrap();
        let points = pipeline.read_points(3).unwrap();
        assert_eq!(points[0].position, [2.0, 0.0, -2.0]);
        assert_eq!(points[26].position, [4.0, 2.0, 0.0]);
        let expected = super::super::density::density_at(Vec3::new(4.0, 2.0, 0.0), &settings);
        assert_eq!(points[26].density, expected);
    }

    #[test]
    fn test_counter_reset_between_dispatches() {
        let mut pipeline =
            MarchingCubesPipeline::new(host(), 512, CapacityPolicy::WorstCase).unwrap();
        let settings = GenerationSettings::default();
        pipeline.dispatch(&settings, IVec3::ZERO, 8).unwrap();
        let first = pipeline.triangle_count().unwrap();
        pipeline.dispatch(&settings, IVec3::ZERO, 8).unwrap();
        assert_eq!(pipeline.triangle_count().unwrap(), first);
        assert_eq!(pipeline.dispatch_count(), 2);
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut pipeline =
            MarchingCubesPipeline::new(host(), 8, CapacityPolicy::Fixed(0)).unwrap();
        let mut field: Vec<GridPoint> = (0..8)
            .map(|index| {
                let (i, j, k) = super::super::density::lattice_coords(index, 2);
                GridPoint::new(Vec3::new(i as f32, j as f32, k as f32), 1.25)
            })
            .collect();
        field[0].density = 0.75;
        pipeline.load_field(&field).unwrap();
        pipeline.extract_surface(1.0, 2).unwrap();

        assert_eq!(pipeline.triangle_count().unwrap(), 1);
        assert!(matches!(
            pipeline.checked_triangle_count(),
            Err(TerrainError::ExtractionOverflow { count: 1, capacity: 0 })
        ));
    }

    #[test]
    fn test_expose_buffers_are_scoped() {
        let pipeline = MarchingCubesPipeline::new(host(), 8, CapacityPolicy::Heuristic).unwrap();
        {
            let mapping = pipeline.expose_points_buffer().unwrap();
            assert_eq!(mapping.len(), 8 * 16);
            assert!(pipeline.points_buffer().is_mapped());
        }
        assert!(!pipeline.points_buffer().is_mapped());
        let mapping = pipeline.expose_triangles_buffer().unwrap();
        assert_eq!(mapping.len(), 16 * 72);
    }
}
