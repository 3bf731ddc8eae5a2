//! Compute device layer
//!
//! Buffers, the atomic triangle counter, transfers between buffers, and the
//! two backends that execute the terrain kernels.

pub mod buffer;
pub mod counter;
pub mod device;
pub mod host;
pub mod transfer;
pub mod wgpu_device;

use std::sync::Arc;

pub use buffer::{BufferMapping, DeviceBuffer};
pub use counter::AtomicCounter;
pub use device::{
    BackendKind, BackendPreference, BufferHandle, ComputeDevice, Kernel, KernelUniforms,
    MapIntent, StorageHint, COUNTER_SLOT, POINTS_SLOT, TRIANGLES_SLOT, VERTEX_SLOT,
};
pub use host::HostDevice;
pub use transfer::{copy_device, stream_from, TransferMode, TransferReport, DEFAULT_CHUNK_SIZE};
pub use wgpu_device::WgpuDevice;

use crate::error::{TerrainError, TerrainResult};

/// A device opened according to a [`BackendPreference`]
#[derive(Clone)]
pub enum OpenedDevice {
    Host(Arc<HostDevice>),
    Wgpu(Arc<WgpuDevice>),
}

impl OpenedDevice {
    /// The device as seen by the terrain pipeline
    pub fn compute(&self) -> Arc<dyn ComputeDevice> {
        match self {
            OpenedDevice::Host(device) => device.clone(),
            OpenedDevice::Wgpu(device) => device.clone(),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            OpenedDevice::Host(_) => BackendKind::Host,
            OpenedDevice::Wgpu(_) => BackendKind::Wgpu,
        }
    }

    /// The wgpu device, when one is in use
    pub fn wgpu(&self) -> Option<&Arc<WgpuDevice>> {
        match self {
            OpenedDevice::Wgpu(device) => Some(device),
            OpenedDevice::Host(_) => None,
        }
    }
}

/// Open a compute device
pub fn open_device(preference: BackendPreference) -> TerrainResult<OpenedDevice> {
    match preference {
        BackendPreference::Host => Ok(OpenedDevice::Host(Arc::new(HostDevice::new()))),
        BackendPreference::Gpu => Ok(OpenedDevice::Wgpu(Arc::new(WgpuDevice::request()?))),
        BackendPreference::Auto => match WgpuDevice::request() {
            Ok(device) => Ok(OpenedDevice::Wgpu(Arc::new(device))),
            Err(TerrainError::NoAdapter) => {
                log::warn!("[gpu] No GPU adapter available, using the host backend");
                Ok(OpenedDevice::Host(Arc::new(HostDevice::new())))
            }
            Err(e) => Err(e),
        },
    }
}
