//! wgpu renderer for terrain draw calls

use std::ops::Range;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::{DrawCall, Drawable, FrameContext, Primitive};
use crate::error::TerrainResult;
use crate::gpu::WgpuDevice;
use crate::terrain::{GRID_POINT_SIZE, TRIANGLE_SIZE};

/// Per-frame uniform shared by both terrain pipelines
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    view_proj: [[f32; 4]; 4],
    light_position: [f32; 4],
    camera_position: [f32; 4],
    /// x: iso level
    params: [f32; 4],
}

impl FrameUniforms {
    fn from_frame(frame: &FrameContext) -> Self {
        Self {
            view_proj: frame.view_projection().to_cols_array_2d(),
            light_position: frame.light_position.extend(1.0).to_array(),
            camera_position: frame.camera_position.extend(1.0).to_array(),
            params: [frame.settings.iso_level, 0.0, 0.0, 0.0],
        }
    }
}

/// Draw calls with their buffers resolved, ready to record
pub struct PreparedFrame {
    draws: Vec<(Primitive, Arc<wgpu::Buffer>, Range<u32>)>,
}

impl PreparedFrame {
    pub fn draw_count(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }
}

pub struct TerrainRenderer {
    device: Arc<WgpuDevice>,
    color_format: wgpu::TextureFormat,
    uniform_buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    mesh_pipeline: wgpu::RenderPipeline,
    points_pipeline: wgpu::RenderPipeline,
}

impl TerrainRenderer {
    pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

    pub fn new(device: Arc<WgpuDevice>, color_format: wgpu::TextureFormat) -> Self {
        let gpu = device.device().clone();

        let uniform_buffer = gpu.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Terrain Frame Uniforms"),
            size: std::mem::size_of::<FrameUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group_layout = gpu.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Terrain Frame Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let bind_group = gpu.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Terrain Frame Bind Group"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        let layout = gpu.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Terrain Render Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let mesh_shader = gpu.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Terrain Mesh Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/terrain_mesh.wgsl").into()),
        });
        let points_shader = gpu.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Terrain Points Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/terrain_points.wgsl").into()),
        });

        const MESH_ATTRIBUTES: [wgpu::VertexAttribute; 2] =
            wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3];
        const POINT_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
            wgpu::vertex_attr_array![0 => Float32x4];

        let mesh_pipeline = create_render_pipeline(
            &gpu,
            "Terrain Mesh Pipeline",
            &layout,
            &mesh_shader,
            wgpu::VertexBufferLayout {
                array_stride: TRIANGLE_SIZE / 3,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &MESH_ATTRIBUTES,
            },
            wgpu::PrimitiveTopology::TriangleList,
            color_format,
        );
        let points_pipeline = create_render_pipeline(
            &gpu,
            "Terrain Points Pipeline",
            &layout,
            &points_shader,
            wgpu::VertexBufferLayout {
                array_stride: GRID_POINT_SIZE,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &POINT_ATTRIBUTES,
            },
            wgpu::PrimitiveTopology::PointList,
            color_format,
        );

        log::debug!("[TerrainRenderer] Pipelines created for {:?}", color_format);

        Self {
            device,
            color_format,
            uniform_buffer,
            bind_group,
            mesh_pipeline,
            points_pipeline,
        }
    }

    pub fn device(&self) -> &Arc<WgpuDevice> {
        &self.device
    }

    pub fn color_format(&self) -> wgpu::TextureFormat {
        self.color_format
    }

    /// Upload frame uniforms and resolve the drawable's vertex buffers
    pub fn prepare(
        &self,
        frame: &FrameContext,
        drawable: &dyn Drawable,
    ) -> TerrainResult<PreparedFrame> {
        let uniforms = FrameUniforms::from_frame(frame);
        self.device
            .queue()
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let draws = drawable
            .draw(frame)
            .into_iter()
            .map(|call: DrawCall| {
                let buffer = self.device.raw_buffer(call.buffer)?;
                Ok((call.primitive, buffer, call.first..call.first + call.count))
            })
            .collect::<TerrainResult<Vec<_>>>()?;

        Ok(PreparedFrame { draws })
    }

    /// Record prepared draws into an open render pass
    pub fn record<'a>(&'a self, pass: &mut wgpu::RenderPass<'a>, prepared: &'a PreparedFrame) {
        pass.set_bind_group(0, &self.bind_group, &[]);
        for (primitive, buffer, vertices) in &prepared.draws {
            let pipeline = match primitive {
                Primitive::Points => &self.points_pipeline,
                Primitive::Triangles => &self.mesh_pipeline,
            };
            pass.set_pipeline(pipeline);
            pass.set_vertex_buffer(0, buffer.slice(..));
            pass.draw(vertices.clone(), 0..1);
        }
    }
}

fn create_render_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    vertex_layout: wgpu::VertexBufferLayout<'_>,
    topology: wgpu::PrimitiveTopology,
    color_format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: "vs_main",
            buffers: &[vertex_layout],
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: "fs_main",
            targets: &[Some(wgpu::ColorTargetState {
                format: color_format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: TerrainRenderer::DEPTH_FORMAT,
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::Less,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
    })
}
