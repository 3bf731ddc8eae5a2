/// GPU Terrain Validation Tests
///
/// Verifies that the wgpu kernels agree with the host backend. Every test
/// skips when no adapter is available.
use std::sync::Arc;

use glam::{IVec3, Vec3};
use marching_terrain::terrain::density::lattice_coords;
use marching_terrain::{
    CapacityPolicy, ComputeDevice, GenerationSettings, GridPoint, HostDevice,
    MarchingCubesPipeline, TerrainChunk, TransferMode, WgpuDevice,
};

/// Tolerance for floating point comparisons
const FLOAT_TOLERANCE: f32 = 0.001;

fn init_gpu() -> Option<Arc<WgpuDevice>> {
    WgpuDevice::request().ok().map(Arc::new)
}

fn sorted_positions(triangles: &[marching_terrain::Triangle]) -> Vec<[f32; 3]> {
    let mut positions: Vec<[f32; 3]> = triangles
        .iter()
        .flat_map(|t| t.positions())
        .map(|p| p.to_array())
        .collect();
    positions.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    positions
}

#[test]
fn test_gpu_density_matches_host() {
    let Some(gpu) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let settings = GenerationSettings::default();
    let origin = IVec3::new(-4, 8, 3);

    let mut gpu_pipeline =
        MarchingCubesPipeline::new(gpu, 512, CapacityPolicy::WorstCase).unwrap();
    gpu_pipeline.generate_field(&settings, origin, 8).unwrap();
    let gpu_points = gpu_pipeline.read_points(8).unwrap();

    let host: Arc<dyn ComputeDevice> = Arc::new(HostDevice::new());
    let mut host_pipeline =
        MarchingCubesPipeline::new(host, 512, CapacityPolicy::WorstCase).unwrap();
    host_pipeline.generate_field(&settings, origin, 8).unwrap();
    let host_points = host_pipeline.read_points(8).unwrap();

    for (gpu_point, host_point) in gpu_points.iter().zip(&host_points) {
        assert_eq!(gpu_point.position, host_point.position);
        assert!(
            (gpu_point.density - host_point.density).abs() < FLOAT_TOLERANCE,
            "density mismatch at {:?}: {} vs {}",
            host_point.position,
            gpu_point.density,
            host_point.density
        );
    }
}

#[test]
fn test_gpu_single_corner_surface() {
    let Some(gpu) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let field: Vec<GridPoint> = (0..8)
        .map(|index| {
            let (i, j, k) = lattice_coords(index, 2);
            let density = if index == 0 { 0.75 } else { 1.25 };
            GridPoint::new(Vec3::new(i as f32, j as f32, k as f32), density)
        })
        .collect();

    let mut pipeline = MarchingCubesPipeline::new(gpu, 8, CapacityPolicy::Heuristic).unwrap();
    pipeline.load_field(&field).unwrap();
    pipeline.extract_surface(1.0, 2).unwrap();
    assert_eq!(pipeline.checked_triangle_count().unwrap(), 1);

    let positions = sorted_positions(&pipeline.read_triangles(1).unwrap());
    let expected = [[0.0, 0.0, 0.5], [0.0, 0.5, 0.0], [0.5, 0.0, 0.0]];
    for (actual, expected) in positions.iter().zip(expected.iter()) {
        for axis in 0..3 {
            assert!((actual[axis] - expected[axis]).abs() < FLOAT_TOLERANCE);
        }
    }
}

#[test]
fn test_gpu_chunk_matches_host_chunk() {
    let Some(gpu) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };

    let settings = GenerationSettings {
        iso_level: 0.95,
        ..Default::default()
    };
    let origin = IVec3::new(3, 5, 7);

    let gpu_pipeline = MarchingCubesPipeline::new(gpu, 4096, CapacityPolicy::WorstCase)
        .unwrap()
        .into_shared();
    let mut gpu_chunk =
        TerrainChunk::new(gpu_pipeline, 4096, origin, TransferMode::default()).unwrap();
    gpu_chunk.update(&settings).unwrap();

    let host: Arc<dyn ComputeDevice> = Arc::new(HostDevice::new());
    let host_pipeline = MarchingCubesPipeline::new(host, 4096, CapacityPolicy::WorstCase)
        .unwrap()
        .into_shared();
    let mut host_chunk =
        TerrainChunk::new(host_pipeline, 4096, origin, TransferMode::DeviceCopy).unwrap();
    host_chunk.update(&settings).unwrap();

    // Slot order differs between backends, so compare as sorted sets
    let gpu_count = gpu_chunk.triangle_count();
    let host_count = host_chunk.triangle_count();
    let allowed = (host_count / 100).max(2);
    assert!(
        gpu_count.abs_diff(host_count) <= allowed,
        "triangle counts diverge: gpu {} host {}",
        gpu_count,
        host_count
    );

    if gpu_count == host_count {
        let gpu_positions = sorted_positions(&gpu_chunk.read_triangles().unwrap());
        let host_positions = sorted_positions(&host_chunk.read_triangles().unwrap());
        for (a, b) in gpu_positions.iter().zip(&host_positions) {
            for axis in 0..3 {
                assert!((a[axis] - b[axis]).abs() < FLOAT_TOLERANCE);
            }
        }
    }
}
