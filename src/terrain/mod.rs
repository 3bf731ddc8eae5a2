//! Procedural terrain: density field, marching cubes, and chunk orchestration

pub mod chunk;
pub mod data;
pub mod density;
pub mod grid;
pub mod marching;
pub mod pipeline;
pub mod settings;
pub mod tables;

pub use chunk::{ChunkState, TerrainChunk, UpdateOutcome};
pub use data::{GridPoint, Triangle, TriangleVertex, GRID_POINT_SIZE, TRIANGLE_SIZE};
pub use grid::{ChunkGrid, GridUpdate};
pub use pipeline::{
    cube_side, validate_point_count, CapacityPolicy, MarchingCubesPipeline, SharedPipeline,
};
pub use settings::GenerationSettings;
