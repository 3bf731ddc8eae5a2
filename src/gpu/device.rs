//! Compute device abstraction
//!
//! The terrain pipeline talks to the GPU through [`ComputeDevice`]: opaque
//! buffer handles, a slot-indexed binding table, and two fixed kernels. The
//! binding table is global device state, so whatever is bound last at a slot
//! is what the next kernel dispatch sees.

use bytemuck::{Pod, Zeroable};
use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::error::TerrainResult;
use crate::terrain::GenerationSettings;

/// Binding slot the density kernel writes and the extraction kernel reads
pub const POINTS_SLOT: u32 = 0;
/// Binding slot for the triangle output of the extraction kernel
pub const TRIANGLES_SLOT: u32 = 1;
/// Binding slot for the emitted-triangle counter
pub const COUNTER_SLOT: u32 = 2;
/// Shared slot for vertex buffers, replaced on every bind like a single array target
pub const VERTEX_SLOT: u32 = 8;

/// Edge length of a compute workgroup, per axis
pub const WORKGROUP_SIZE: u32 = 4;

/// Opaque reference to device storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u32);

impl BufferHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// How the host intends to use a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageHint {
    /// Kernel-written storage that the host streams out of
    Storage,
    /// Small atomic counter storage
    Counter,
    /// Vertex storage consumed by the renderer
    Vertex,
}

/// Access intent of a host mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapIntent {
    Read,
    Write,
}

/// Which backend is executing kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Try the GPU and fall back to the host backend
    #[default]
    Auto,
    Gpu,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Host,
    Wgpu,
}

/// The two kernels of the terrain pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Stage 1: evaluate the density field at every lattice point
    DensityField,
    /// Stage 2: polygonise every cube and append triangles
    ExtractSurface,
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::DensityField => "density_field",
            Kernel::ExtractSurface => "extract_surface",
        }
    }

    /// Binding slots the kernel reads or writes
    pub fn slots(&self) -> &'static [u32] {
        match self {
            Kernel::DensityField => &[POINTS_SLOT],
            Kernel::ExtractSurface => &[POINTS_SLOT, TRIANGLES_SLOT, COUNTER_SLOT],
        }
    }

    /// Minimum byte size of the buffer at `slot` for the given uniforms
    pub fn required_size(&self, slot: u32, uniforms: &KernelUniforms) -> u64 {
        let points = uniforms.resolution as u64;
        match slot {
            POINTS_SLOT => points * points * points * crate::terrain::GRID_POINT_SIZE,
            COUNTER_SLOT => 4,
            // Triangle output is bounded by the capacity guard, not the grid
            _ => 0,
        }
    }

    /// Workgroups needed to cover the kernel's domain
    pub fn workgroups(&self, resolution: u32) -> [u32; 3] {
        let extent = match self {
            Kernel::DensityField => resolution,
            Kernel::ExtractSurface => resolution.saturating_sub(1),
        };
        let groups = (extent + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
        [groups, groups, groups]
    }
}

/// Uniform block shared by both kernels
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct KernelUniforms {
    /// Chunk origin in lattice units (w unused)
    pub origin: [f32; 4],
    pub scale: f32,
    pub persistence: f32,
    pub lacunarity: f32,
    pub iso_level: f32,
    pub octaves: u32,
    /// Points per axis of the chunk
    pub resolution: u32,
    /// Triangle slots available in the output buffer
    pub triangle_capacity: u32,
    pub _padding: u32,
}

impl KernelUniforms {
    pub fn new(
        settings: &GenerationSettings,
        origin: IVec3,
        resolution: u32,
        triangle_capacity: u32,
    ) -> Self {
        Self {
            origin: [origin.x as f32, origin.y as f32, origin.z as f32, 0.0],
            scale: settings.scale,
            persistence: settings.persistence,
            lacunarity: settings.lacunarity,
            iso_level: settings.iso_level,
            octaves: settings.octaves,
            resolution,
            triangle_capacity,
            _padding: 0,
        }
    }

    pub fn settings(&self) -> GenerationSettings {
        GenerationSettings {
            scale: self.scale,
            persistence: self.persistence,
            lacunarity: self.lacunarity,
            octaves: self.octaves,
            iso_level: self.iso_level,
        }
    }
}

/// A device that owns buffer storage and executes the terrain kernels
///
/// Implementations must be usable from several threads; all methods take
/// `&self` and serialize internally.
pub trait ComputeDevice: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Allocate `size` bytes of zeroed storage
    fn allocate(&self, label: &str, size: u64, hint: StorageHint) -> TerrainResult<BufferHandle>;

    /// Release storage; unknown handles are ignored
    fn release(&self, handle: BufferHandle);

    fn buffer_size(&self, handle: BufferHandle) -> TerrainResult<u64>;

    /// Bind `handle` at `slot`, replacing whatever was bound there
    fn bind(&self, slot: u32, handle: BufferHandle) -> TerrainResult<()>;

    fn bound(&self, slot: u32) -> Option<BufferHandle>;

    /// Copy `len` bytes starting at `offset` back to the host
    fn read(&self, handle: BufferHandle, offset: u64, len: u64) -> TerrainResult<Vec<u8>>;

    fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> TerrainResult<()>;

    /// Device-side copy, no host round trip
    fn copy(
        &self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        len: u64,
    ) -> TerrainResult<()>;

    /// Run `kernel` over the buffers currently bound at its slots
    fn dispatch(&self, kernel: Kernel, uniforms: &KernelUniforms) -> TerrainResult<()>;

    /// Block until every write made by previous dispatches is visible
    fn memory_barrier(&self);
}

pub(crate) fn check_range(
    label: &str,
    size: u64,
    offset: u64,
    len: u64,
) -> TerrainResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(crate::error::TerrainError::MappingOutOfRange {
            label: label.to_string(),
            offset,
            len,
            size,
        }),
    }
}
