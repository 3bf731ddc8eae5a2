//! GPU marching-cubes terrain
//!
//! A fractal noise density field is evaluated over a cube of lattice points,
//! polygonised with marching cubes, and streamed into per-chunk vertex
//! buffers. Chunks regenerate only when their generation settings change.

pub mod config;
pub mod error;
pub mod gpu;
pub mod render;
pub mod terrain;

pub use config::TerrainConfig;
pub use error::{GpuErrorContext, TerrainError, TerrainResult};
pub use gpu::{
    open_device, AtomicCounter, BufferMapping, ComputeDevice, DeviceBuffer, HostDevice, MapIntent,
    OpenedDevice, TransferMode, WgpuDevice,
};
pub use render::{Computable, DrawCall, Drawable, FrameContext, Primitive, TerrainRenderer};
pub use terrain::{
    CapacityPolicy, ChunkGrid, ChunkState, GenerationSettings, GridPoint, MarchingCubesPipeline,
    SharedPipeline, TerrainChunk, Triangle, UpdateOutcome,
};
