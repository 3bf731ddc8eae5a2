//! wgpu implementation of [`ComputeDevice`]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::device::{
    check_range, BackendKind, BufferHandle, ComputeDevice, Kernel, KernelUniforms, StorageHint,
    COUNTER_SLOT, POINTS_SLOT, TRIANGLES_SLOT,
};
use crate::error::{GpuErrorContext, TerrainError, TerrainResult};
use crate::terrain::tables;

const UNIFORMS_BINDING: u32 = 3;
const TRI_TABLE_BINDING: u32 = 4;

/// Round `value` down to the copy alignment
fn align_down(value: u64) -> u64 {
    value & !(wgpu::COPY_BUFFER_ALIGNMENT - 1)
}

/// Round `value` up to the copy alignment
fn align_up(value: u64) -> u64 {
    (value + wgpu::COPY_BUFFER_ALIGNMENT - 1) & !(wgpu::COPY_BUFFER_ALIGNMENT - 1)
}

struct WgpuBuffer {
    raw: Arc<wgpu::Buffer>,
    /// Size requested by the caller; the allocation may be padded
    size: u64,
    label: String,
}

#[derive(Default)]
struct WgpuState {
    buffers: HashMap<BufferHandle, WgpuBuffer>,
    bindings: HashMap<u32, BufferHandle>,
    next_id: u32,
}

impl WgpuState {
    fn buffer(&self, handle: BufferHandle) -> TerrainResult<&WgpuBuffer> {
        self.buffers
            .get(&handle)
            .ok_or(TerrainError::UnknownBuffer { handle: handle.0 })
    }
}

/// Compute pipelines and shared resources of the two kernels
struct KernelPipelines {
    density_layout: wgpu::BindGroupLayout,
    density_pipeline: wgpu::ComputePipeline,
    extract_layout: wgpu::BindGroupLayout,
    extract_pipeline: wgpu::ComputePipeline,
    uniforms: wgpu::Buffer,
    tri_table: wgpu::Buffer,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<KernelUniforms>() as u64),
        },
        count: None,
    }
}

impl KernelPipelines {
    fn new(device: &wgpu::Device) -> Self {
        let density_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Density Field Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/density_field.wgsl").into()),
        });
        let extract_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Extract Surface Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/extract_surface.wgsl").into()),
        });

        let density_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Density Field Bind Group Layout"),
            entries: &[storage_entry(POINTS_SLOT, false), uniform_entry(UNIFORMS_BINDING)],
        });
        let extract_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Extract Surface Bind Group Layout"),
            entries: &[
                storage_entry(POINTS_SLOT, true),
                storage_entry(TRIANGLES_SLOT, false),
                storage_entry(COUNTER_SLOT, false),
                uniform_entry(UNIFORMS_BINDING),
                storage_entry(TRI_TABLE_BINDING, true),
            ],
        });

        let density_pipeline = create_compute_pipeline(
            device,
            "Density Field Pipeline",
            &density_layout,
            &density_shader,
        );
        let extract_pipeline = create_compute_pipeline(
            device,
            "Extract Surface Pipeline",
            &extract_layout,
            &extract_shader,
        );

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Kernel Uniforms"),
            size: std::mem::size_of::<KernelUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let tri_table = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Marching Cubes Triangle Table"),
            contents: bytemuck::cast_slice(&tables::flat_tri_table()),
            usage: wgpu::BufferUsages::STORAGE,
        });

        Self {
            density_layout,
            density_pipeline,
            extract_layout,
            extract_pipeline,
            uniforms,
            tri_table,
        }
    }
}

fn create_compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    module: &wgpu::ShaderModule,
) -> wgpu::ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module,
        entry_point: "main",
    })
}

/// Map a staging buffer and copy its contents out
///
/// The staging buffer must already hold the data, i.e. the copy into it has
/// been submitted.
pub(crate) fn read_staging(
    device: &wgpu::Device,
    staging: &wgpu::Buffer,
    operation: &str,
) -> TerrainResult<Vec<u8>> {
    let slice = staging.slice(..);
    let (tx, rx) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        if tx.send(result).is_err() {
            log::error!("[WgpuDevice] Failed to send map_async result - receiver dropped");
        }
    });

    device.poll(wgpu::Maintain::Wait);

    pollster::block_on(rx)
        .gpu_context(operation)?
        .gpu_context(operation)?;

    let data = slice.get_mapped_range();
    let bytes = data.to_vec();
    drop(data);
    staging.unmap();
    Ok(bytes)
}

/// GPU device running the terrain kernels through wgpu
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_name: String,
    kernels: KernelPipelines,
    state: Mutex<WgpuState>,
}

impl WgpuDevice {
    /// Wrap an existing device and queue
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self::with_adapter_name(device, queue, "external".to_string())
    }

    fn with_adapter_name(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        adapter_name: String,
    ) -> Self {
        let kernels = KernelPipelines::new(&device);
        log::info!("[WgpuDevice] Terrain kernels compiled on '{}'", adapter_name);
        Self {
            device,
            queue,
            adapter_name,
            kernels,
            state: Mutex::new(WgpuState::default()),
        }
    }

    /// Request a headless adapter and device
    pub fn request() -> TerrainResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(TerrainError::NoAdapter)?;

        let info = adapter.get_info();
        log::info!("[WgpuDevice] Using adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Terrain Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .gpu_context("request_device")?;

        Ok(Self::with_adapter_name(
            Arc::new(device),
            Arc::new(queue),
            info.name,
        ))
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Underlying wgpu buffer of a handle, for binding as a vertex source
    pub fn raw_buffer(&self, handle: BufferHandle) -> TerrainResult<Arc<wgpu::Buffer>> {
        Ok(self.state.lock().buffer(handle)?.raw.clone())
    }

    fn resolve(&self, handle: BufferHandle) -> TerrainResult<(Arc<wgpu::Buffer>, u64, String)> {
        let state = self.state.lock();
        let buffer = state.buffer(handle)?;
        Ok((buffer.raw.clone(), buffer.size, buffer.label.clone()))
    }

    fn read_aligned(&self, raw: &wgpu::Buffer, start: u64, len: u64) -> TerrainResult<Vec<u8>> {
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Terrain Readback Staging"),
            size: len,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Terrain Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(raw, start, &staging, 0, len);
        self.queue.submit(Some(encoder.finish()));

        read_staging(&self.device, &staging, "buffer readback")
    }
}

impl ComputeDevice for WgpuDevice {
    fn backend(&self) -> BackendKind {
        BackendKind::Wgpu
    }

    fn allocate(&self, label: &str, size: u64, hint: StorageHint) -> TerrainResult<BufferHandle> {
        let usage = match hint {
            StorageHint::Storage | StorageHint::Counter => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            StorageHint::Vertex => {
                wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
        };

        let padded = align_up(size.max(wgpu::COPY_BUFFER_ALIGNMENT));
        let limits = self.device.limits();
        // Every terrain buffer may end up bound to a kernel
        let max = limits
            .max_buffer_size
            .min(limits.max_storage_buffer_binding_size as u64);
        if padded > max {
            return Err(TerrainError::AllocationFailed {
                size,
                reason: format!("exceeds device limit of {} bytes", max),
            });
        }

        // New buffers are zero-initialised by wgpu
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded,
            usage,
            mapped_at_creation: false,
        });

        let mut state = self.state.lock();
        state.next_id += 1;
        let handle = BufferHandle(state.next_id);
        state.buffers.insert(
            handle,
            WgpuBuffer {
                raw: Arc::new(raw),
                size,
                label: label.to_string(),
            },
        );

        log::debug!(
            "[WgpuDevice] Allocated '{}' ({} bytes, {:?}) as {:?}",
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
            buffer.raw.destroy();
            log::debug!("[WgpuDevice] Released '{}'", buffer.label);
        }
    }

    fn buffer_size(&self, handle: BufferHandle) -> TerrainResult<u64> {
        Ok(self.state.lock().buffer(handle)?.size)
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
        let (raw, size, label) = self.resolve(handle)?;
        check_range(&label, size, offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }

        let start = align_down(offset);
        let end = align_up(offset + len);
        let window = self.read_aligned(&raw, start, end - start)?;
        let skip = (offset - start) as usize;
        Ok(window[skip..skip + len as usize].to_vec())
    }

    fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> TerrainResult<()> {
        let (raw, size, label) = self.resolve(handle)?;
        check_range(&label, size, offset, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }

        let len = data.len() as u64;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT == 0 && len % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(&raw, offset, data);
        } else {
            // Merge into the surrounding aligned window
            let start = align_down(offset);
            let end = align_up(offset + len);
            let mut window = self.read_aligned(&raw, start, end - start)?;
            let skip = (offset - start) as usize;
            window[skip..skip + data.len()].copy_from_slice(data);
            self.queue.write_buffer(&raw, start, &window);
        }
        self.queue.submit(std::iter::empty());
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
        let (src_raw, src_size, src_label) = self.resolve(src)?;
        let (dst_raw, dst_size, dst_label) = self.resolve(dst)?;
        check_range(&src_label, src_size, src_offset, len)?;
        check_range(&dst_label, dst_size, dst_offset, len)?;
        if len == 0 {
            return Ok(());
        }

        let aligned = [src_offset, dst_offset, len]
            .iter()
            .all(|v| v % wgpu::COPY_BUFFER_ALIGNMENT == 0);
        if !aligned {
            let data = self.read(src, src_offset, len)?;
            return self.write(dst, dst_offset, &data);
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Terrain Copy Encoder"),
        });
        encoder.copy_buffer_to_buffer(&src_raw, src_offset, &dst_raw, dst_offset, len);
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn dispatch(&self, kernel: Kernel, uniforms: &KernelUniforms) -> TerrainResult<()> {
        let mut bound = Vec::with_capacity(kernel.slots().len());
        {
            let state = self.state.lock();
            for &slot in kernel.slots() {
                let handle = *state.bindings.get(&slot).ok_or_else(|| {
                    TerrainError::InvalidBindState {
                        kernel: kernel.name().to_string(),
                        slot,
                    }
                })?;
                let buffer = state.buffer(handle)?;
                let required = kernel.required_size(slot, uniforms);
                if buffer.size < required {
                    return Err(TerrainError::KernelBufferTooSmall {
                        slot,
                        required,
                        actual: buffer.size,
                    });
                }
                bound.push((slot, buffer.raw.clone()));
            }
        }

        self.queue
            .write_buffer(&self.kernels.uniforms, 0, bytemuck::bytes_of(uniforms));

        let (layout, pipeline) = match kernel {
            Kernel::DensityField => (&self.kernels.density_layout, &self.kernels.density_pipeline),
            Kernel::ExtractSurface => (&self.kernels.extract_layout, &self.kernels.extract_pipeline),
        };

        let mut entries: Vec<wgpu::BindGroupEntry> = bound
            .iter()
            .map(|(slot, raw)| wgpu::BindGroupEntry {
                binding: *slot,
                resource: raw.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: UNIFORMS_BINDING,
            resource: self.kernels.uniforms.as_entire_binding(),
        });
        if kernel == Kernel::ExtractSurface {
            entries.push(wgpu::BindGroupEntry {
                binding: TRI_TABLE_BINDING,
                resource: self.kernels.tri_table.as_entire_binding(),
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout,
            entries: &entries,
        });

        let [x, y, z] = kernel.workgroups(uniforms.resolution);
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Terrain Kernel Encoder"),
        });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name()),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            if x > 0 {
                compute_pass.dispatch_workgroups(x, y, z);
            }
        }
        self.queue.submit(Some(encoder.finish()));

        log::trace!(
            "[WgpuDevice] Dispatched {} with {}x{}x{} workgroups",
            kernel.name(),
            x,
            y,
            z
        );
        Ok(())
    }

    fn memory_barrier(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}
