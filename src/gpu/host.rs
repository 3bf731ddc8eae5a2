//! CPU implementation of [`ComputeDevice`]
//!
//! Buffers are plain byte vectors behind a mutex. Kernels run on the rayon
//! pool: the density field is evaluated in parallel, cubes are polygonised in
//! parallel, and triangle slots are then claimed in cube order so output is
//! reproducible run to run.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::device::{
    check_range, BackendKind, BufferHandle, ComputeDevice, Kernel, KernelUniforms, StorageHint,
    COUNTER_SLOT, POINTS_SLOT, TRIANGLES_SLOT,
};
use crate::error::{TerrainError, TerrainResult};
use crate::terrain::data::{decode_records, GridPoint, GRID_POINT_SIZE, TRIANGLE_SIZE};
use crate::terrain::{density, marching};

struct HostBuffer {
    label: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct HostState {
    buffers: HashMap<BufferHandle, HostBuffer>,
    bindings: HashMap<u32, BufferHandle>,
    next_id: u32,
}

impl HostState {
    fn buffer(&self, handle: BufferHandle) -> TerrainResult<&HostBuffer> {
        self.buffers
            .get(&handle)
            .ok_or(TerrainError::UnknownBuffer { handle: handle.0 })
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> TerrainResult<&mut HostBuffer> {
        self.buffers
            .get_mut(&handle)
            .ok_or(TerrainError::UnknownBuffer { handle: handle.0 })
    }

    /// Resolve the buffer bound at `slot` for `kernel`
    fn bound_for(
        &self,
        kernel: Kernel,
        slot: u32,
        uniforms: &KernelUniforms,
    ) -> TerrainResult<BufferHandle> {
        let handle = *self
            .bindings
            .get(&slot)
            .ok_or_else(|| TerrainError::InvalidBindState {
                kernel: kernel.name().to_string(),
                slot,
            })?;
        let actual = self.buffer(handle)?.bytes.len() as u64;
        let required = kernel.required_size(slot, uniforms);
        if actual < required {
            return Err(TerrainError::KernelBufferTooSmall { slot, required, actual });
        }
        Ok(handle)
    }
}

/// Reference device executing kernels on the CPU
#[derive(Default)]
pub struct HostDevice {
    state: Mutex<HostState>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live allocations
    pub fn allocation_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    fn run_density_field(&self, uniforms: &KernelUniforms) -> TerrainResult<()> {
        let mut state = self.state.lock();
        let points = state.bound_for(Kernel::DensityField, POINTS_SLOT, uniforms)?;

        let origin = glam::Vec3::from_slice(&uniforms.origin[..3]).as_ivec3();
        let samples = density::sample_lattice(origin, uniforms.resolution, &uniforms.settings());
        let bytes: &[u8] = bytemuck::cast_slice(&samples);

        state.buffer_mut(points)?.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn run_extract_surface(&self, uniforms: &KernelUniforms) -> TerrainResult<()> {
        let mut state = self.state.lock();
        let points = state.bound_for(Kernel::ExtractSurface, POINTS_SLOT, uniforms)?;
        let triangles = state.bound_for(Kernel::ExtractSurface, TRIANGLES_SLOT, uniforms)?;
        let counter = state.bound_for(Kernel::ExtractSurface, COUNTER_SLOT, uniforms)?;

        let resolution = uniforms.resolution;
        let point_bytes = (resolution as u64).pow(3) * GRID_POINT_SIZE;
        let lattice: Vec<GridPoint> =
            decode_records(&state.buffer(points)?.bytes[..point_bytes as usize]);

        let per_cube = marching::polygonise_lattice(&lattice, resolution, uniforms.iso_level);

        let counter_bytes = &state.buffer(counter)?.bytes;
        let mut next = u32::from_ne_bytes([
            counter_bytes[0],
            counter_bytes[1],
            counter_bytes[2],
            counter_bytes[3],
        ]);

        // Slots past the capacity are claimed but never written
        let output = state.buffer_mut(triangles)?;
        let writable = output.bytes.len() as u64 / TRIANGLE_SIZE;
        for triangle in per_cube.iter().flatten() {
            let slot = next as u64;
            next = next.wrapping_add(1);
            if slot < uniforms.triangle_capacity as u64 && slot < writable {
                let start = (slot * TRIANGLE_SIZE) as usize;
                output.bytes[start..start + TRIANGLE_SIZE as usize]
                    .copy_from_slice(bytemuck::bytes_of(triangle));
            }
        }

        state.buffer_mut(counter)?.bytes[..4].copy_from_slice(&next.to_ne_bytes());
        Ok(())
    }
}

impl ComputeDevice for HostDevice {
    fn backend(&self) -> BackendKind {
        BackendKind::Host
    }

    fn allocate(&self, label: &str, size: u64, hint: StorageHint) -> TerrainResult<BufferHandle> {
        let len = usize::try_from(size).map_err(|_| TerrainError::AllocationFailed {
            size,
            reason: "size exceeds host address space".to_string(),
        })?;

        let mut state = self.state.lock();
        state.next_id += 1;
        let handle = BufferHandle(state.next_id);
        state.buffers.insert(
            handle,
            HostBuffer {
                label: label.to_string(),
                bytes: vec![0; len],
            },
        );
        log::trace!(
            "[HostDevice] Allocated '{}' ({} bytes, {:?}) as {:?}",
            label,
            size,
            hint,
            handle
        );
        Ok(handle)
    }

    fn release(&self, handle: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(buffer) = state.buffers.remove(&handle) {
            state.bindings.retain(|_, bound| *bound != handle);
            log::trace!("[HostDevice] Released '{}'", buffer.label);
        }
    }

    fn buffer_size(&self, handle: BufferHandle) -> TerrainResult<u64> {
        Ok(self.state.lock().buffer(handle)?.bytes.len() as u64)
    }

    fn bind(&self, slot: u32, handle: BufferHandle) -> TerrainResult<()> {
        let mut state = self.state.lock();
        state.buffer(handle)?;
        state.bindings.insert(slot, handle);
        Ok(())
    }

    fn bound(&self, slot: u32) -> Option<BufferHandle> {
        self.state.lock().bindings.get(&slot).copied()
    }

    fn read(&self, handle: BufferHandle, offset: u64, len: u64) -> TerrainResult<Vec<u8>> {
        let state = self.state.lock();
        let buffer = state.buffer(handle)?;
        check_range(&buffer.label, buffer.bytes.len() as u64, offset, len)?;
        Ok(buffer.bytes[offset as usize..(offset + len) as usize].to_vec())
    }

    fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> TerrainResult<()> {
        let mut state = self.state.lock();
        let buffer = state.buffer_mut(handle)?;
        check_range(&buffer.label, buffer.bytes.len() as u64, offset, data.len() as u64)?;
        buffer.bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copy(
        &self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        len: u64,
    ) -> TerrainResult<()> {
        let data = self.read(src, src_offset, len)?;
        self.write(dst, dst_offset, &data)
    }

    fn dispatch(&self, kernel: Kernel, uniforms: &KernelUniforms) -> TerrainResult<()> {
        log::trace!(
            "[HostDevice] Dispatching {} at resolution {}",
            kernel.name(),
            uniforms.resolution
        );
        match kernel {
            Kernel::DensityField => self.run_density_field(uniforms),
            Kernel::ExtractSurface => self.run_extract_surface(uniforms),
        }
    }

    fn memory_barrier(&self) {
        // Host kernels complete before dispatch returns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::GenerationSettings;
    use glam::IVec3;

    #[test]
    fn test_allocate_zeroed_and_release() {
        let device = HostDevice::new();
        let handle = device.allocate("buf", 12, StorageHint::Storage).unwrap();
        assert_eq!(device.read(handle, 0, 12).unwrap(), vec![0; 12]);
        device.bind(POINTS_SLOT, handle).unwrap();
        device.release(handle);
        assert_eq!(device.allocation_count(), 0);
        assert_eq!(device.bound(POINTS_SLOT), None);
        assert!(device.read(handle, 0, 1).is_err());
    }

    #[test]
    fn test_out_of_range_access() {
        let device = HostDevice::new();
        let handle = device.allocate("buf", 8, StorageHint::Storage).unwrap();
        assert!(device.write(handle, 4, &[1; 8]).is_err());
        assert!(device.read(handle, 9, 0).is_err());
        device.write(handle, 4, &[7; 4]).unwrap();
        assert_eq!(device.read(handle, 2, 4).unwrap(), vec![0, 0, 7, 7]);
    }

    #[test]
    fn test_dispatch_requires_bindings() {
        let device = HostDevice::new();
        let uniforms = KernelUniforms::new(&GenerationSettings::default(), IVec3::ZERO, 2, 16);
        let err = device.dispatch(Kernel::DensityField, &uniforms).unwrap_err();
        assert!(matches!(err, TerrainError::InvalidBindState { slot: POINTS_SLOT, .. }));

        let small = device.allocate("small", 16, StorageHint::Storage).unwrap();
        device.bind(POINTS_SLOT, small).unwrap();
        let err = device.dispatch(Kernel::DensityField, &uniforms).unwrap_err();
        assert!(matches!(err, TerrainError::KernelBufferTooSmall { required: 128, .. }));
    }

    #[test]
    fn test_counter_counts_past_capacity() {
        let device = HostDevice::new();
        let settings = GenerationSettings::default();
        let resolution = 8;
        let points = device
            .allocate("points", 512 * GRID_POINT_SIZE, StorageHint::Storage)
            .unwrap();
        let triangles = device.allocate("triangles", TRIANGLE_SIZE, StorageHint::Storage).unwrap();
        let counter = device.allocate("counter", 4, StorageHint::Counter).unwrap();
        device.bind(POINTS_SLOT, points).unwrap();
        device.bind(TRIANGLES_SLOT, triangles).unwrap();
        device.bind(COUNTER_SLOT, counter).unwrap();

        let uniforms = KernelUniforms::new(&settings, IVec3::ZERO, resolution, 1);
        device.dispatch(Kernel::DensityField, &uniforms).unwrap();
        device.dispatch(Kernel::ExtractSurface, &uniforms).unwrap();

        let lattice: Vec<GridPoint> = decode_records(&device.read(points, 0, 512 * 16).unwrap());
        let expected: usize = marching::polygonise_lattice(&lattice, resolution, settings.iso_level)
            .iter()
            .map(Vec::len)
            .sum();
        let count = u32::from_ne_bytes(device.read(counter, 0, 4).unwrap().try_into().unwrap());
        assert_eq!(count as usize, expected);
        assert!(count > 1);
    }
}
