//! Marching cubes polygonisation over a lattice of [`GridPoint`]s
//!
//! This is the host reference for the `extract_surface` kernel. Normals come
//! from central differences over the points themselves, so the extracted
//! surface is consistent with whatever field stage 1 wrote.

use glam::Vec3;
use rayon::prelude::*;

use super::data::{GridPoint, Triangle, TriangleVertex};
use super::density::{lattice_coords, lattice_index};
use super::tables::{triangles, CORNER_OFFSETS, EDGE_CORNERS};

/// Below this density difference an edge is treated as degenerate
pub const DEGENERATE_EPSILON: f32 = 1e-6;

/// One cube corner with its field sample
#[derive(Debug, Clone, Copy)]
pub struct Corner {
    pub position: Vec3,
    pub density: f32,
    pub gradient: Vec3,
}

/// Build the 8-bit configuration: bit `c` set when corner `c` is below iso
pub fn cube_configuration(densities: &[f32; 8], iso_level: f32) -> u8 {
    densities
        .iter()
        .enumerate()
        .fold(0u8, |config, (corner, &density)| {
            if density < iso_level {
                config | (1 << corner)
            } else {
                config
            }
        })
}

/// Interpolation parameter of the iso crossing between two densities
#[inline]
pub fn crossing(d0: f32, d1: f32, iso_level: f32) -> f32 {
    let delta = d1 - d0;
    if delta.abs() < DEGENERATE_EPSILON {
        0.5
    } else {
        (iso_level - d0) / delta
    }
}

fn unit_or_up(v: Vec3) -> Vec3 {
    let len = v.length();
    if len > 0.0 && len.is_finite() {
        v / len
    } else {
        Vec3::Y
    }
}

fn edge_vertex(a: &Corner, b: &Corner, iso_level: f32) -> TriangleVertex {
    let t = crossing(a.density, b.density, iso_level);
    TriangleVertex {
        position: a.position.lerp(b.position, t).to_array(),
        normal: unit_or_up(a.gradient.lerp(b.gradient, t)).to_array(),
    }
}

/// Triangulate one cube, appending to `out`; returns triangles emitted
pub fn polygonise(corners: &[Corner; 8], iso_level: f32, out: &mut Vec<Triangle>) -> usize {
    let densities = corners.map(|c| c.density);
    let config = cube_configuration(&densities, iso_level);
    if config == 0x00 || config == 0xFF {
        return 0;
    }

    let before = out.len();
    for edges in triangles(config) {
        let vertices = edges.map(|edge| {
            let [a, b] = EDGE_CORNERS[edge];
            edge_vertex(&corners[a], &corners[b], iso_level)
        });
        out.push(Triangle { vertices });
    }
    out.len() - before
}

/// Field gradient at lattice point `(i, j, k)`, one-sided at the boundary
pub fn lattice_gradient(points: &[GridPoint], resolution: u32, i: u32, j: u32, k: u32) -> Vec3 {
    let density = |i: u32, j: u32, k: u32| points[lattice_index(i, j, k, resolution)].density;
    let axis = |lo: f32, hi: f32, span: u32| if span == 0 { 0.0 } else { (hi - lo) / span as f32 };
    let last = resolution - 1;

    let (x0, x1) = (i.saturating_sub(1), (i + 1).min(last));
    let (y0, y1) = (j.saturating_sub(1), (j + 1).min(last));
    let (z0, z1) = (k.saturating_sub(1), (k + 1).min(last));

    Vec3::new(
        axis(density(x0, j, k), density(x1, j, k), x1 - x0),
        axis(density(i, y0, k), density(i, y1, k), y1 - y0),
        axis(density(i, j, z0), density(i, j, z1), z1 - z0),
    )
}

/// Gather the 8 corners of the cube whose lowest corner is `(i, j, k)`
pub fn cube_corners(points: &[GridPoint], resolution: u32, i: u32, j: u32, k: u32) -> [Corner; 8] {
    CORNER_OFFSETS.map(|[dx, dy, dz]| {
        let (ci, cj, ck) = (i + dx, j + dy, k + dz);
        let point = points[lattice_index(ci, cj, ck, resolution)];
        Corner {
            position: point.position(),
            density: point.density,
            gradient: lattice_gradient(points, resolution, ci, cj, ck),
        }
    })
}

/// Polygonise every cube of the lattice
///
/// Returns one triangle list per cube in linear cube order; callers decide
/// how the lists are laid out in the output buffer.
pub fn polygonise_lattice(
    points: &[GridPoint],
    resolution: u32,
    iso_level: f32,
) -> Vec<Vec<Triangle>> {
    let cubes_per_axis = resolution.saturating_sub(1);
    let total = (cubes_per_axis as usize).pow(3);
    (0..total)
        .into_par_iter()
        .map(|cube| {
            let (i, j, k) = lattice_coords(cube, cubes_per_axis);
            let corners = cube_corners(points, resolution, i, j, k);
            let mut out = Vec::new();
            polygonise(&corners, iso_level, &mut out);
            out
        })
        .collect()
}
