use std::sync::Arc;

use super::buffer::DeviceBuffer;
use super::device::{ComputeDevice, MapIntent, StorageHint, COUNTER_SLOT};
use crate::error::TerrainResult;

/// Single `u32` the extraction kernel atomically increments per triangle
pub struct AtomicCounter {
    buffer: DeviceBuffer,
}

impl AtomicCounter {
    pub fn new(device: Arc<dyn ComputeDevice>) -> TerrainResult<Self> {
        let buffer = DeviceBuffer::with_size(
            device,
            "Triangle Counter",
            COUNTER_SLOT,
            std::mem::size_of::<u32>() as u64,
            StorageHint::Counter,
        )?;
        Ok(Self { buffer })
    }

    /// Zero the counter; leaves it bound
    pub fn reset(&self) -> TerrainResult<()> {
        let mut mapping = self.buffer.map_full(MapIntent::Write)?;
        mapping.as_mut_slice().copy_from_slice(&0u32.to_ne_bytes());
        mapping.unmap()
    }

    /// Current value; leaves it bound
    pub fn read(&self) -> TerrainResult<u32> {
        let mapping = self.buffer.map_full(MapIntent::Read)?;
        let value = mapping.records::<u32>().first().copied().unwrap_or(0);
        mapping.unmap()?;
        Ok(value)
    }

    pub fn bind(&self) -> TerrainResult<()> {
        self.buffer.bind()
    }

    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }
}
