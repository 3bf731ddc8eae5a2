//! Terrain error handling
//!
//! One error type for the device layer, the compute pipeline and chunk
//! orchestration.

use thiserror::Error;

/// Result alias used across the crate
pub type TerrainResult<T> = Result<T, TerrainError>;

#[derive(Debug, Error)]
pub enum TerrainError {
    #[error("Invalid point count {count}: must be a non-zero perfect cube")]
    InvalidPointCount { count: u32 },

    #[error("Resolution {resolution} does not fit a pipeline sized for {side} points per axis")]
    ResolutionExceedsCapacity { resolution: u32, side: u32 },

    #[error("Buffer '{label}' has no reserved storage")]
    BufferNotReserved { label: String },

    #[error("Buffer '{label}' is already mapped")]
    AlreadyMapped { label: String },

    #[error("Range {offset}+{len} is outside buffer '{label}' of {size} bytes")]
    MappingOutOfRange {
        label: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("Unknown buffer handle {handle}")]
    UnknownBuffer { handle: u32 },

    #[error("Kernel {kernel} requires a buffer bound at slot {slot}")]
    InvalidBindState { kernel: String, slot: u32 },

    #[error("Buffer at slot {slot} holds {actual} bytes, kernel needs {required}")]
    KernelBufferTooSmall { slot: u32, required: u64, actual: u64 },

    #[error("Extraction overflow: {count} triangles emitted, capacity is {capacity}")]
    ExtractionOverflow { count: u32, capacity: u32 },

    #[error("Invalid transfer: {reason}")]
    InvalidTransfer { reason: String },

    #[error("Device allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: u64, reason: String },

    #[error("GPU operation '{operation}' failed: {error}")]
    GpuOperationFailed { operation: String, error: String },

    #[error("No compatible GPU adapter found")]
    NoAdapter,

    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot failed: {0}")]
    Snapshot(String),
}

/// Attach an operation name to foreign GPU errors
pub trait GpuErrorContext<T> {
    fn gpu_context(self, operation: &str) -> TerrainResult<T>;
}

impl<T, E> GpuErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn gpu_context(self, operation: &str) -> TerrainResult<T> {
        self.map_err(|e| TerrainError::GpuOperationFailed {
            operation: operation.to_string(),
            error: e.to_string(),
        })
    }
}

impl<T> GpuErrorContext<T> for Option<T> {
    fn gpu_context(self, operation: &str) -> TerrainResult<T> {
        self.ok_or_else(|| TerrainError::GpuOperationFailed {
            operation: operation.to_string(),
            error: "no value produced".to_string(),
        })
    }
}

/// Create an invalid configuration error
pub fn invalid_config(field: &str, reason: impl std::fmt::Display) -> TerrainError {
    TerrainError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
