/// Terrain Pipeline Integration Tests
///
/// Runs the full generate -> extract -> transfer path on the host backend,
/// checking regeneration gating, determinism, capacity handling and the
/// draw contract of chunks.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use glam::{IVec3, Vec3};
use marching_terrain::gpu::{BackendKind, BufferHandle, Kernel, KernelUniforms, StorageHint};
use marching_terrain::render::{Computable, Drawable, FrameContext, Primitive};
use marching_terrain::terrain::density::{lattice_coords, sample_lattice};
use marching_terrain::terrain::marching::{cube_configuration, cube_corners};
use marching_terrain::terrain::{Triangle, GRID_POINT_SIZE, TRIANGLE_SIZE};
use marching_terrain::{
    CapacityPolicy, ChunkGrid, ChunkState, ComputeDevice, GenerationSettings, GridPoint,
    HostDevice, MarchingCubesPipeline, SharedPipeline, TerrainChunk, TerrainError, TerrainResult,
    TransferMode, UpdateOutcome,
};

const EPSILON: f32 = 1e-5;

fn host() -> Arc<dyn ComputeDevice> {
    Arc::new(HostDevice::new())
}

fn shared_pipeline(points: u32, policy: CapacityPolicy) -> SharedPipeline {
    MarchingCubesPipeline::new(host(), points, policy)
        .unwrap()
        .into_shared()
}

/// Settings whose iso level sits halfway through the chunk's density range,
/// so the surface is guaranteed to cross it
fn crossing_settings(origin: IVec3, resolution: u32) -> GenerationSettings {
    crossing_from(GenerationSettings::default(), origin, resolution)
}

fn crossing_from(
    mut settings: GenerationSettings,
    origin: IVec3,
    resolution: u32,
) -> GenerationSettings {
    let points = sample_lattice(origin, resolution, &settings);
    let (min, max) = points.iter().fold((f32::MAX, f32::MIN), |(lo, hi), p| {
        (lo.min(p.density), hi.max(p.density))
    });
    assert!(min < max, "field is flat");
    settings.iso_level = (min + max) * 0.5;
    settings
}

/// 2x2x2 field with only the corner at the origin below 1.0
fn one_corner_field() -> Vec<GridPoint> {
    (0..8)
        .map(|index| {
            let (i, j, k) = lattice_coords(index, 2);
            let density = if index == 0 { 0.75 } else { 1.25 };
            GridPoint::new(Vec3::new(i as f32, j as f32, k as f32), density)
        })
        .collect()
}

fn triangle_bytes(triangles: &[Triangle]) -> Vec<u8> {
    bytemuck::cast_slice(triangles).to_vec()
}

/// Host device whose writes and copies start failing once an armed budget
/// of successful calls is spent
struct FailingDevice {
    inner: HostDevice,
    armed: AtomicBool,
    budget: AtomicU32,
}

impl FailingDevice {
    fn new() -> Self {
        Self {
            inner: HostDevice::new(),
            armed: AtomicBool::new(false),
            budget: AtomicU32::new(0),
        }
    }

    fn fail_after(&self, successful_writes: u32) {
        self.budget.store(successful_writes, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    fn spend(&self, operation: &str) -> TerrainResult<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let spent = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match spent {
            Ok(_) => Ok(()),
            Err(_) => Err(TerrainError::GpuOperationFailed {
                operation: operation.to_string(),
                error: "device lost".to_string(),
            }),
        }
    }
}

impl ComputeDevice for FailingDevice {
    fn backend(&self) -> BackendKind {
        self.inner.backend()
    }

    fn allocate(&self, label: &str, size: u64, hint: StorageHint) -> TerrainResult<BufferHandle> {
        self.inner.allocate(label, size, hint)
    }

    fn release(&self, handle: BufferHandle) {
        self.inner.release(handle)
    }

    fn buffer_size(&self, handle: BufferHandle) -> TerrainResult<u64> {
        self.inner.buffer_size(handle)
    }

    fn bind(&self, slot: u32, handle: BufferHandle) -> TerrainResult<()> {
        self.inner.bind(slot, handle)
    }

    fn bound(&self, slot: u32) -> Option<BufferHandle> {
        self.inner.bound(slot)
    }

    fn read(&self, handle: BufferHandle, offset: u64, len: u64) -> TerrainResult<Vec<u8>> {
        self.inner.read(handle, offset, len)
    }

    fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> TerrainResult<()> {
        self.spend("write")?;
        self.inner.write(handle, offset, data)
    }

    fn copy(
        &self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        len: u64,
    ) -> TerrainResult<()> {
        self.spend("copy")?;
        self.inner.copy(src, src_offset, dst, dst_offset, len)
    }

    fn dispatch(&self, kernel: Kernel, uniforms: &KernelUniforms) -> TerrainResult<()> {
        self.inner.dispatch(kernel, uniforms)
    }

    fn memory_barrier(&self) {
        self.inner.memory_barrier()
    }
}

#[test]
fn test_failed_transfer_keeps_previous_mesh() {
    let origin = IVec3::ZERO;
    let first = crossing_settings(origin, 8);
    let second = crossing_from(
        GenerationSettings {
            scale: 0.23,
            ..GenerationSettings::default()
        },
        origin,
        8,
    );

    // One counter reset, then 8 KiB of points in 1 KiB pieces, then triangles:
    // fail before the counter reset, midway through the points, and on the
    // first triangle write
    for successful_writes in [0, 3, 9] {
        let device = Arc::new(FailingDevice::new());
        let compute: Arc<dyn ComputeDevice> = device.clone();
        let pipeline = MarchingCubesPipeline::new(compute, 512, CapacityPolicy::WorstCase)
            .unwrap()
            .into_shared();
        let mut chunk = TerrainChunk::new(
            pipeline,
            512,
            origin,
            TransferMode::Mapped { chunk_size: 1024 },
        )
        .unwrap();

        chunk.update(&first).unwrap();
        let count = chunk.triangle_count();
        let points = chunk.read_points().unwrap();
        let triangles = chunk.read_triangles().unwrap();
        let draws = chunk.draw(&FrameContext::default());
        assert!(count > 0);

        device.fail_after(successful_writes);
        assert!(
            matches!(
                chunk.update(&second),
                Err(TerrainError::GpuOperationFailed { .. })
            ),
            "update succeeded with {} writes allowed",
            successful_writes
        );

        assert_eq!(chunk.state(), ChunkState::Generated);
        assert_eq!(chunk.last_settings(), Some(&first));
        assert_eq!(chunk.triangle_count(), count);
        assert_eq!(chunk.draw(&FrameContext::default()), draws);
        assert_eq!(chunk.read_points().unwrap(), points);
        assert_eq!(
            triangle_bytes(&chunk.read_triangles().unwrap()),
            triangle_bytes(&triangles)
        );

        device.disarm();
        chunk.update(&second).unwrap();
        assert_eq!(chunk.last_settings(), Some(&second));
        assert_ne!(chunk.read_points().unwrap(), points);
    }
}

#[test]
fn test_unchanged_settings_dispatch_once() {
    let pipeline = shared_pipeline(512, CapacityPolicy::WorstCase);
    let mut chunk =
        TerrainChunk::new(pipeline.clone(), 512, IVec3::ZERO, TransferMode::default()).unwrap();
    let settings = crossing_settings(IVec3::ZERO, 8);

    let first = chunk.update(&settings).unwrap();
    assert!(matches!(first, UpdateOutcome::Regenerated { .. }));
    let count = chunk.triangle_count();
    let triangles = chunk.read_triangles().unwrap();
    assert!(count > 0);

    for _ in 0..3 {
        assert_eq!(chunk.update(&settings).unwrap(), UpdateOutcome::Skipped);
        assert_eq!(chunk.triangle_count(), count);
        assert_eq!(
            triangle_bytes(&chunk.read_triangles().unwrap()),
            triangle_bytes(&triangles)
        );
    }
    assert_eq!(pipeline.lock().dispatch_count(), 1);

    let changed = GenerationSettings {
        octaves: 3,
        ..settings
    };
    assert!(matches!(
        chunk.update(&changed).unwrap(),
        UpdateOutcome::Regenerated { .. }
    ));
    assert_eq!(pipeline.lock().dispatch_count(), 2);
    assert_eq!(chunk.last_settings(), Some(&changed));
}

#[test]
fn test_stale_chunk_regenerates_with_same_settings() {
    let pipeline = shared_pipeline(64, CapacityPolicy::WorstCase);
    let mut chunk =
        TerrainChunk::new(pipeline.clone(), 64, IVec3::ZERO, TransferMode::default()).unwrap();
    let settings = crossing_settings(IVec3::ZERO, 4);

    chunk.update(&settings).unwrap();
    let count = chunk.triangle_count();
    let triangles = chunk.read_triangles().unwrap();
    assert!(count > 0);

    chunk.mark_stale();
    assert_eq!(chunk.state(), ChunkState::Stale);
    assert_eq!(
        chunk.update(&settings).unwrap(),
        UpdateOutcome::Regenerated { triangles: count }
    );
    assert_eq!(chunk.state(), ChunkState::Generated);
    assert_eq!(pipeline.lock().dispatch_count(), 2);

    // A real re-dispatch reproduces the same mesh byte for byte
    assert_eq!(chunk.triangle_count(), count);
    assert_eq!(
        triangle_bytes(&chunk.read_triangles().unwrap()),
        triangle_bytes(&triangles)
    );
}

#[test]
fn test_regeneration_is_deterministic() {
    let origin = IVec3::new(7, -3, 12);
    let settings = crossing_settings(origin, 8);

    let mut meshes = Vec::new();
    for _ in 0..2 {
        let pipeline = shared_pipeline(512, CapacityPolicy::WorstCase);
        let mut chunk = TerrainChunk::new(pipeline, 512, origin, TransferMode::default()).unwrap();
        chunk.update(&settings).unwrap();
        assert!(chunk.triangle_count() > 0);
        meshes.push((chunk.read_points().unwrap(), chunk.read_triangles().unwrap()));
    }

    let (points_a, triangles_a) = &meshes[0];
    let (points_b, triangles_b) = &meshes[1];
    assert_eq!(
        bytemuck::cast_slice::<GridPoint, u8>(points_a),
        bytemuck::cast_slice::<GridPoint, u8>(points_b)
    );
    // Slot order follows the host's deterministic claim order
    assert_eq!(triangles_a, triangles_b);
}

#[test]
fn test_constant_field_yields_no_triangles() {
    for iso_level in [0.5, 1.5] {
        let pipeline = shared_pipeline(512, CapacityPolicy::Heuristic);
        let mut chunk =
            TerrainChunk::new(pipeline, 512, IVec3::ZERO, TransferMode::default()).unwrap();
        let settings = GenerationSettings {
            octaves: 0,
            iso_level,
            ..Default::default()
        };

        assert_eq!(
            chunk.update(&settings).unwrap(),
            UpdateOutcome::Regenerated { triangles: 0 }
        );
        assert_eq!(chunk.triangle_count(), 0);
        assert!(chunk.read_triangles().unwrap().is_empty());
        assert!(chunk
            .read_points()
            .unwrap()
            .iter()
            .all(|p| p.density == 1.0));

        let frame = FrameContext::default();
        assert!(chunk.draw(&frame).is_empty());
        let with_points = FrameContext {
            draw_points: true,
            ..frame
        };
        let calls = chunk.draw(&with_points);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].primitive, Primitive::Points);
        assert_eq!(calls[0].count, 512);
    }
}

#[test]
fn test_draw_calls_cover_live_triangles() {
    let pipeline = shared_pipeline(512, CapacityPolicy::WorstCase);
    let mut chunk = TerrainChunk::new(pipeline, 512, IVec3::ZERO, TransferMode::default()).unwrap();
    chunk.update(&crossing_settings(IVec3::ZERO, 8)).unwrap();

    let frame = FrameContext {
        draw_points: true,
        ..FrameContext::default()
    };
    let calls = chunk.draw(&frame);
    assert_eq!(calls.len(), 2);

    assert_eq!(calls[0].primitive, Primitive::Points);
    assert_eq!(calls[0].stride, GRID_POINT_SIZE);
    assert_eq!(calls[0].buffer, chunk.points_vertex_buffer().handle().unwrap());

    assert_eq!(calls[1].primitive, Primitive::Triangles);
    assert_eq!(calls[1].first, 0);
    assert_eq!(calls[1].count, chunk.triangle_count() * 3);
    assert_eq!(calls[1].stride, TRIANGLE_SIZE / 3);
    assert_eq!(
        calls[1].buffer,
        chunk.triangles_vertex_buffer().handle().unwrap()
    );
}

#[test]
fn test_single_corner_surface() {
    let mut pipeline = MarchingCubesPipeline::new(host(), 8, CapacityPolicy::Heuristic).unwrap();
    let field = one_corner_field();
    let corners = cube_corners(&field, 2, 0, 0, 0);
    assert_eq!(cube_configuration(&corners.map(|c| c.density), 1.0), 1);

    pipeline.load_field(&field).unwrap();
    pipeline.extract_surface(1.0, 2).unwrap();

    assert_eq!(pipeline.checked_triangle_count().unwrap(), 1);
    let triangle = pipeline.read_triangles(1).unwrap()[0];

    let mut positions: Vec<[f32; 3]> = triangle.positions().iter().map(|p| p.to_array()).collect();
    positions.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let expected = [[0.0, 0.0, 0.5], [0.0, 0.5, 0.0], [0.5, 0.0, 0.0]];
    for (actual, expected) in positions.iter().zip(expected.iter()) {
        for axis in 0..3 {
            assert!(
                (actual[axis] - expected[axis]).abs() < EPSILON,
                "{:?} != {:?}",
                actual,
                expected
            );
        }
    }

    for vertex in &triangle.vertices {
        let normal = Vec3::from_array(vertex.normal);
        assert!((normal.length() - 1.0).abs() < 1e-4);
        // Density rises away from the low corner
        assert!(normal.x > 0.0 && normal.y > 0.0 && normal.z > 0.0);
    }
}

#[test]
fn test_failed_update_keeps_previous_mesh() {
    let pipeline = shared_pipeline(512, CapacityPolicy::Fixed(0));
    let mut chunk = TerrainChunk::new(pipeline, 512, IVec3::ZERO, TransferMode::default()).unwrap();

    let flat = GenerationSettings {
        octaves: 0,
        iso_level: 0.5,
        ..Default::default()
    };
    chunk.update(&flat).unwrap();
    assert_eq!(chunk.state(), ChunkState::Generated);

    let result = chunk.update(&crossing_settings(IVec3::ZERO, 8));
    assert!(matches!(
        result,
        Err(TerrainError::ExtractionOverflow { capacity: 0, .. })
    ));
    assert_eq!(chunk.state(), ChunkState::Generated);
    assert_eq!(chunk.last_settings(), Some(&flat));
    assert_eq!(chunk.triangle_count(), 0);
    assert!(chunk
        .read_points()
        .unwrap()
        .iter()
        .all(|p| p.density == 1.0));
}

#[test]
fn test_transfer_modes_fill_identical_buffers() {
    let origin = IVec3::new(0, 4, 0);
    let settings = crossing_settings(origin, 8);

    let mut results = Vec::new();
    for transfer in [
        TransferMode::Mapped { chunk_size: 100 },
        TransferMode::Mapped { chunk_size: 1 << 20 },
        TransferMode::DeviceCopy,
    ] {
        let pipeline = shared_pipeline(512, CapacityPolicy::WorstCase);
        let mut chunk = TerrainChunk::new(pipeline, 512, origin, transfer).unwrap();
        chunk.update(&settings).unwrap();
        results.push((chunk.read_points().unwrap(), chunk.read_triangles().unwrap()));
    }

    assert!(!results[0].1.is_empty());
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn test_grid_updates_every_chunk_once() {
    let mut grid = ChunkGrid::new(
        host(),
        64,
        2,
        CapacityPolicy::WorstCase,
        TransferMode::DeviceCopy,
    )
    .unwrap();
    let settings = GenerationSettings::default();

    let summary = grid.update_all(&settings).unwrap();
    assert_eq!(summary.regenerated, 8);
    assert_eq!(summary.skipped, 0);
    assert_eq!(grid.pipeline().lock().dispatch_count(), 8);
    assert!(grid
        .chunks()
        .iter()
        .all(|c| c.state() == ChunkState::Generated));

    let again = grid.update_all(&settings).unwrap();
    assert_eq!(again.regenerated, 0);
    assert_eq!(again.skipped, 8);
    assert_eq!(again.triangles, summary.triangles);
    assert_eq!(grid.pipeline().lock().dispatch_count(), 8);

    grid.mark_stale();
    assert!(matches!(
        Computable::update(&mut grid, &settings).unwrap(),
        UpdateOutcome::Regenerated { .. }
    ));
    assert_eq!(grid.pipeline().lock().dispatch_count(), 16);
}

#[test]
fn test_neighbouring_chunks_share_boundary_plane() {
    let mut grid = ChunkGrid::new(
        host(),
        27,
        2,
        CapacityPolicy::WorstCase,
        TransferMode::default(),
    )
    .unwrap();
    grid.update_all(&GenerationSettings::default()).unwrap();

    // chunks[0] at the origin, chunks[1] offset by two along z
    let near = grid.chunks()[0].read_points().unwrap();
    let far = grid.chunks()[1].read_points().unwrap();
    for i in 0..3 {
        for j in 0..3 {
            let a = near[(i * 3 + j) * 3 + 2];
            let b = far[(i * 3 + j) * 3];
            assert_eq!(a.position, b.position);
            assert_eq!(a.density, b.density);
        }
    }
}
