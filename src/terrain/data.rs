use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Bytes per lattice point record
pub const GRID_POINT_SIZE: u64 = std::mem::size_of::<GridPoint>() as u64;
/// Bytes per triangle record
pub const TRIANGLE_SIZE: u64 = std::mem::size_of::<Triangle>() as u64;

/// A lattice sample: world position and density
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GridPoint {
    /// World-space position (chunk origin + lattice offset)
    pub position: [f32; 3],
    /// Scalar field value at the position
    pub density: f32,
}

impl GridPoint {
    pub fn new(position: Vec3, density: f32) -> Self {
        Self {
            position: position.to_array(),
            density,
        }
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

/// One vertex of an extracted triangle
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct TriangleVertex {
    pub position: [f32; 3],
    /// Unit normal from the interpolated field gradient
    pub normal: [f32; 3],
}

/// Interleaved triangle record as written by the extraction kernel
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Triangle {
    pub vertices: [TriangleVertex; 3],
}

impl Triangle {
    pub fn positions(&self) -> [Vec3; 3] {
        [
            Vec3::from_array(self.vertices[0].position),
            Vec3::from_array(self.vertices[1].position),
            Vec3::from_array(self.vertices[2].position),
        ]
    }
}

/// Decode records from a byte slice of any alignment
pub fn decode_records<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect()
}
