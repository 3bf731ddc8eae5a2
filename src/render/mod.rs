//! Rendering contract between terrain and the frame loop
//!
//! Terrain objects describe what to draw as [`DrawCall`]s against their own
//! vertex buffers; the renderer turns those into GPU work. Camera and
//! lighting arrive in a [`FrameContext`] each frame.

pub mod renderer;
pub mod snapshot;

use glam::{Mat4, Vec3};

use crate::error::TerrainResult;
use crate::gpu::BufferHandle;
use crate::terrain::{GenerationSettings, UpdateOutcome};

pub use renderer::{PreparedFrame, TerrainRenderer};
pub use snapshot::{buffer_to_image, capture_snapshot, save_snapshot};

/// Something whose device-side state is regenerated from settings
pub trait Computable {
    fn update(&mut self, settings: &GenerationSettings) -> TerrainResult<UpdateOutcome>;
}

/// Something that can describe its draw calls for a frame
pub trait Drawable {
    /// Must not change generation state
    fn draw(&self, frame: &FrameContext) -> Vec<DrawCall>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Points,
    Triangles,
}

/// One non-indexed draw over a vertex buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub primitive: Primitive,
    pub buffer: BufferHandle,
    /// First vertex
    pub first: u32,
    /// Vertex count
    pub count: u32,
    /// Bytes between consecutive vertices
    pub stride: u64,
}

/// Per-frame camera, lighting and display state
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub view: Mat4,
    pub projection: Mat4,
    pub camera_position: Vec3,
    pub light_position: Vec3,
    pub settings: GenerationSettings,
    /// Also draw the lattice as a point cloud
    pub draw_points: bool,
}

impl Default for FrameContext {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            camera_position: Vec3::ZERO,
            light_position: Vec3::new(0.0, 100.0, 0.0),
            settings: GenerationSettings::default(),
            draw_points: false,
        }
    }
}

impl FrameContext {
    /// Perspective camera at `eye` looking at `target`, y up
    pub fn looking_at(
        eye: Vec3,
        target: Vec3,
        aspect: f32,
        settings: GenerationSettings,
        draw_points: bool,
    ) -> Self {
        Self {
            view: Mat4::look_at_rh(eye, target, Vec3::Y),
            projection: Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 1000.0),
            camera_position: eye,
            light_position: eye + Vec3::new(0.0, 50.0, 0.0),
            settings,
            draw_points,
        }
    }

    /// Camera framing an axis-aligned box from above one corner
    pub fn framing(
        min: Vec3,
        max: Vec3,
        aspect: f32,
        settings: GenerationSettings,
        draw_points: bool,
    ) -> Self {
        let center = (min + max) * 0.5;
        let radius = ((max - min).length() * 0.5).max(1.0);
        let eye = center + Vec3::new(1.2, 0.9, 1.2) * radius * 1.6;
        Self::looking_at(eye, center, aspect, settings, draw_points)
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }
}
