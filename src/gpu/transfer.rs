//! Moving bytes between device buffers
//!
//! Mapped streaming copies through host memory in bounded pieces so no
//! single mapping exceeds `chunk_size` bytes. Device copy skips the host.
//! Both leave identical bytes in the destination.

use serde::{Deserialize, Serialize};

use super::buffer::DeviceBuffer;
use super::device::MapIntent;
use crate::error::{TerrainError, TerrainResult};

/// Default piece size of mapped streaming, in bytes
pub const DEFAULT_CHUNK_SIZE: u64 = 1024;

/// How chunk vertex buffers are filled from the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransferMode {
    /// Stream through host mappings of at most `chunk_size` bytes
    Mapped {
        #[serde(default = "default_chunk_size")]
        chunk_size: u64,
    },
    /// Copy on the device
    DeviceCopy,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

impl Default for TransferMode {
    fn default() -> Self {
        TransferMode::Mapped {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl TransferMode {
    /// Copy the first `total` bytes of `src` into `dst`
    pub fn transfer(
        &self,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        total: u64,
    ) -> TerrainResult<TransferReport> {
        match *self {
            TransferMode::Mapped { chunk_size } => stream_from(src, dst, total, chunk_size),
            TransferMode::DeviceCopy => copy_device(src, dst, total),
        }
    }
}

/// What a transfer moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u64,
    /// Mapping round trips, or 1 for a device copy
    pub chunks: u32,
}

fn check_total(src: &DeviceBuffer, dst: &DeviceBuffer, total: u64) -> TerrainResult<()> {
    for buffer in [src, dst] {
        if total > buffer.size() {
            return Err(TerrainError::MappingOutOfRange {
                label: buffer.label().to_string(),
                offset: 0,
                len: total,
                size: buffer.size(),
            });
        }
    }
    Ok(())
}

/// Stream `total` bytes from `src` to `dst` in pieces of at most `chunk_size`
pub fn stream_from(
    src: &DeviceBuffer,
    dst: &DeviceBuffer,
    total: u64,
    chunk_size: u64,
) -> TerrainResult<TransferReport> {
    if chunk_size == 0 {
        return Err(TerrainError::InvalidTransfer {
            reason: "chunk size must be positive".to_string(),
        });
    }
    check_total(src, dst, total)?;

    let mut report = TransferReport::default();
    let mut offset = 0;
    while offset < total {
        let len = chunk_size.min(total - offset);

        let source = src.map_range(offset, len, MapIntent::Read)?;
        let target = dst.map_range(offset, len, MapIntent::Write)?;
        if let (Some(source), Some(mut target)) = (source, target) {
            target.as_mut_slice().copy_from_slice(source.as_slice());
            source.unmap()?;
            target.unmap()?;
        }

        offset += len;
        report.bytes += len;
        report.chunks += 1;
    }

    log::trace!(
        "[Transfer] Streamed {} bytes '{}' -> '{}' in {} chunks",
        report.bytes,
        src.label(),
        dst.label(),
        report.chunks
    );
    Ok(report)
}

/// Device-side copy of `total` bytes from `src` to `dst`
pub fn copy_device(
    src: &DeviceBuffer,
    dst: &DeviceBuffer,
    total: u64,
) -> TerrainResult<TransferReport> {
    check_total(src, dst, total)?;
    if total == 0 {
        return Ok(TransferReport::default());
    }

    let (Some(from), Some(to)) = (src.handle(), dst.handle()) else {
        return Err(TerrainError::InvalidTransfer {
            reason: format!("'{}' or '{}' is not reserved", src.label(), dst.label()),
        });
    };
    src.device().copy(from, 0, to, 0, total)?;
    Ok(TransferReport {
        bytes: total,
        chunks: 1,
    })
}
