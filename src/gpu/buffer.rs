//! Device buffers with scoped host mappings
//!
//! A [`DeviceBuffer`] owns one allocation on a [`ComputeDevice`] and remembers
//! the binding slot it belongs to. Every mapping binds the buffer first, so
//! callers never depend on what happened to be bound before. Mappings are
//! guards: a write mapping is flushed back when the guard is unmapped or
//! dropped, and the buffer cannot be mapped twice at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::Pod;

use super::device::{check_range, BufferHandle, ComputeDevice, MapIntent, StorageHint};
use crate::error::{TerrainError, TerrainResult};
use crate::terrain::data::decode_records;

pub struct DeviceBuffer {
    device: Arc<dyn ComputeDevice>,
    label: String,
    binding: u32,
    handle: Option<BufferHandle>,
    size: u64,
    mapped: AtomicBool,
}

impl DeviceBuffer {
    /// Create an empty buffer for `binding`; storage is reserved separately
    pub fn new(device: Arc<dyn ComputeDevice>, label: impl Into<String>, binding: u32) -> Self {
        Self {
            device,
            label: label.into(),
            binding,
            handle: None,
            size: 0,
            mapped: AtomicBool::new(false),
        }
    }

    /// Create a buffer and reserve `size` bytes
    pub fn with_size(
        device: Arc<dyn ComputeDevice>,
        label: impl Into<String>,
        binding: u32,
        size: u64,
        hint: StorageHint,
    ) -> TerrainResult<Self> {
        let mut buffer = Self::new(device, label, binding);
        buffer.reserve(size, hint)?;
        Ok(buffer)
    }

    /// Replace the storage with `size` fresh zeroed bytes
    ///
    /// Previous contents are discarded.
    pub fn reserve(&mut self, size: u64, hint: StorageHint) -> TerrainResult<()> {
        if self.mapped.load(Ordering::Acquire) {
            return Err(TerrainError::AlreadyMapped {
                label: self.label.clone(),
            });
        }

        let handle = self.device.allocate(&self.label, size, hint)?;
        if let Some(old) = self.handle.replace(handle) {
            self.device.release(old);
        }
        self.size = size;
        log::debug!("[DeviceBuffer] Reserved {} bytes for '{}'", size, self.label);
        Ok(())
    }

    /// Bind to the configured slot, replacing whatever was bound there
    pub fn bind(&self) -> TerrainResult<()> {
        self.device.bind(self.binding, self.require_handle()?)
    }

    /// Map the whole buffer
    pub fn map_full(&self, intent: MapIntent) -> TerrainResult<BufferMapping<'_>> {
        let handle = self.require_handle()?;
        self.open_mapping(handle, 0, self.size, intent)
    }

    /// Map `len` bytes at `offset`; a zero-length range yields no mapping
    pub fn map_range(
        &self,
        offset: u64,
        len: u64,
        intent: MapIntent,
    ) -> TerrainResult<Option<BufferMapping<'_>>> {
        let handle = self.require_handle()?;
        check_range(&self.label, self.size, offset, len)?;
        if len == 0 {
            return Ok(None);
        }
        self.open_mapping(handle, offset, len, intent).map(Some)
    }

    /// Read a range as typed records
    pub fn read_records<T: Pod>(&self, offset: u64, count: usize) -> TerrainResult<Vec<T>> {
        let len = (count * std::mem::size_of::<T>()) as u64;
        match self.map_range(offset, len, MapIntent::Read)? {
            Some(mapping) => Ok(mapping.records()),
            None => Ok(Vec::new()),
        }
    }

    /// Write typed records starting at `offset`
    pub fn write_records<T: Pod>(&self, offset: u64, records: &[T]) -> TerrainResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(records);
        if let Some(mut mapping) = self.map_range(offset, bytes.len() as u64, MapIntent::Write)? {
            mapping.as_mut_slice().copy_from_slice(bytes);
            mapping.unmap()?;
        }
        Ok(())
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn binding(&self) -> u32 {
        self.binding
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_reserved(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    pub fn device(&self) -> &Arc<dyn ComputeDevice> {
        &self.device
    }

    fn require_handle(&self) -> TerrainResult<BufferHandle> {
        self.handle.ok_or_else(|| TerrainError::BufferNotReserved {
            label: self.label.clone(),
        })
    }

    fn open_mapping(
        &self,
        handle: BufferHandle,
        offset: u64,
        len: u64,
        intent: MapIntent,
    ) -> TerrainResult<BufferMapping<'_>> {
        if self
            .mapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TerrainError::AlreadyMapped {
                label: self.label.clone(),
            });
        }

        let bytes = self.device.bind(self.binding, handle).and_then(|_| match intent {
            MapIntent::Read => self.device.read(handle, offset, len),
            // Write mappings start zeroed; every byte is expected to be overwritten
            MapIntent::Write => Ok(vec![0; len as usize]),
        });

        match bytes {
            Ok(bytes) => Ok(BufferMapping {
                buffer: self,
                handle,
                offset,
                intent,
                bytes,
                open: true,
            }),
            Err(e) => {
                self.mapped.store(false, Ordering::Release);
                Err(e)
            }
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.device.release(handle);
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("label", &self.label)
            .field("binding", &self.binding)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish()
    }
}

/// Host view of a mapped buffer range
pub struct BufferMapping<'a> {
    buffer: &'a DeviceBuffer,
    handle: BufferHandle,
    offset: u64,
    intent: MapIntent,
    bytes: Vec<u8>,
    open: bool,
}

impl<'a> BufferMapping<'a> {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Writable bytes; changes are only flushed for write mappings
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn records<T: Pod>(&self) -> Vec<T> {
        decode_records(&self.bytes)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn intent(&self) -> MapIntent {
        self.intent
    }

    /// Flush a write mapping and release the buffer for new mappings
    pub fn unmap(mut self) -> TerrainResult<()> {
        self.close()
    }

    fn close(&mut self) -> TerrainResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let result = match self.intent {
            MapIntent::Write => self.buffer.device.write(self.handle, self.offset, &self.bytes),
            MapIntent::Read => Ok(()),
        };
        self.buffer.mapped.store(false, Ordering::Release);
        result
    }
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!(
                "[DeviceBuffer] Failed to flush mapping of '{}': {}",
                self.buffer.label,
                e
            );
        }
    }
}
