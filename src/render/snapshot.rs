//! Offscreen rendering to an image

use std::path::Path;

use image::{ImageBuffer, Rgba, RgbaImage};

use super::{Drawable, FrameContext, TerrainRenderer};
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::wgpu_device::read_staging;

const SNAPSHOT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const CLEAR_COLOR: wgpu::Color = wgpu::Color {
    r: 0.53,
    g: 0.71,
    b: 0.92,
    a: 1.0,
};

/// Bytes per row once padded to the copy alignment
fn padded_row_bytes(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (unpadded + align - 1) / align * align
}

/// Render `drawable` from `frame` into a `width` x `height` image
pub fn capture_snapshot(
    renderer: &TerrainRenderer,
    drawable: &dyn Drawable,
    frame: &FrameContext,
    width: u32,
    height: u32,
) -> TerrainResult<RgbaImage> {
    if width == 0 || height == 0 {
        return Err(TerrainError::Snapshot(format!(
            "invalid snapshot size {}x{}",
            width, height
        )));
    }
    if renderer.color_format() != SNAPSHOT_FORMAT {
        return Err(TerrainError::Snapshot(format!(
            "renderer targets {:?}, snapshots need {:?}",
            renderer.color_format(),
            SNAPSHOT_FORMAT
        )));
    }

    let wgpu_device = renderer.device();
    let device = wgpu_device.device();
    let queue = wgpu_device.queue();

    let extent = wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    };
    let color = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Snapshot Color"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: SNAPSHOT_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let depth = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Snapshot Depth"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TerrainRenderer::DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
    let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());

    let prepared = renderer.prepare(frame, drawable)?;

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Snapshot Encoder"),
    });
    {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Snapshot Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(CLEAR_COLOR),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        renderer.record(&mut pass, &prepared);
    }

    let row_bytes = padded_row_bytes(width);
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Snapshot Staging Buffer"),
        size: row_bytes as u64 * height as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture {
            texture: &color,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::ImageCopyBuffer {
            buffer: &staging,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(row_bytes),
                rows_per_image: Some(height),
            },
        },
        extent,
    );
    queue.submit(Some(encoder.finish()));

    let data = read_staging(device, &staging, "snapshot readback")?;
    log::info!(
        "[Snapshot] Rendered {} draw calls at {}x{}",
        prepared.draw_count(),
        width,
        height
    );
    buffer_to_image(&data, width, height, row_bytes)
}

/// Strip row padding from RGBA texel rows
pub fn buffer_to_image(
    data: &[u8],
    width: u32,
    height: u32,
    row_bytes: u32,
) -> TerrainResult<RgbaImage> {
    let expected = row_bytes as usize * height as usize;
    if data.len() < expected || row_bytes < width * 4 {
        return Err(TerrainError::Snapshot(format!(
            "buffer size mismatch: expected {} bytes, got {}",
            expected,
            data.len()
        )));
    }

    let mut image = ImageBuffer::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let offset = y as usize * row_bytes as usize + x as usize * 4;
        *pixel = Rgba([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
    }
    Ok(image)
}

/// Write a snapshot as PNG
pub fn save_snapshot(image: &RgbaImage, path: impl AsRef<Path>) -> TerrainResult<()> {
    image
        .save(path.as_ref())
        .map_err(|e| TerrainError::Snapshot(format!("{}: {}", path.as_ref().display(), e)))
}
