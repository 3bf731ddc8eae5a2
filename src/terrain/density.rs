//! Fractal gradient-noise density field
//!
//! Host reference for the `density_field` kernel. The WGSL in
//! `gpu/shaders/density_field.wgsl` evaluates the same hash, gradient set and
//! octave loop so both backends agree up to float rounding, which lets GPU
//! output be checked against this copy.
//!
//! The `noise` crate is not used here: its permutation-table Perlin has no
//! counterpart inside the kernel, so the host field could not match the
//! GPU one.

use glam::{IVec3, Vec3};
use rayon::prelude::*;

use super::data::GridPoint;
use super::settings::GenerationSettings;

/// Density every field is centred on; fbm adds a signed offset
pub const BASE_DENSITY: f32 = 1.0;

const GRADIENTS: [[f32; 3]; 12] = [
    [1.0, 1.0, 0.0],
    [-1.0, 1.0, 0.0],
    [1.0, -1.0, 0.0],
    [-1.0, -1.0, 0.0],
    [1.0, 0.0, 1.0],
    [-1.0, 0.0, 1.0],
    [1.0, 0.0, -1.0],
    [-1.0, 0.0, -1.0],
    [0.0, 1.0, 1.0],
    [0.0, -1.0, 1.0],
    [0.0, 1.0, -1.0],
    [0.0, -1.0, -1.0],
];

/// 32-bit integer avalanche hash
#[inline]
pub fn hash_u32(x: u32) -> u32 {
    let mut h = x;
    h ^= h >> 16;
    h = h.wrapping_mul(0x7feb_352d);
    h ^= h >> 15;
    h = h.wrapping_mul(0x846c_a68b);
    h ^= h >> 16;
    h
}

#[inline]
fn lattice_hash(cell: IVec3) -> u32 {
    hash_u32(cell.x as u32 ^ hash_u32(cell.y as u32 ^ hash_u32(cell.z as u32)))
}

#[inline]
fn fade(t: f32) -> f32 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + t * (b - a)
}

#[inline]
fn corner_contribution(cell: IVec3, offset: IVec3, local: Vec3) -> f32 {
    let gradient = Vec3::from_array(GRADIENTS[(lattice_hash(cell + offset) % 12) as usize]);
    gradient.dot(local - offset.as_vec3())
}

/// Single-octave gradient noise, roughly in [-1, 1]
pub fn gradient_noise(p: Vec3) -> f32 {
    let floor = p.floor();
    let cell = floor.as_ivec3();
    let local = p - floor;

    let n000 = corner_contribution(cell, IVec3::new(0, 0, 0), local);
    let n100 = corner_contribution(cell, IVec3::new(1, 0, 0), local);
    let n010 = corner_contribution(cell, IVec3::new(0, 1, 0), local);
    let n110 = corner_contribution(cell, IVec3::new(1, 1, 0), local);
    let n001 = corner_contribution(cell, IVec3::new(0, 0, 1), local);
    let n101 = corner_contribution(cell, IVec3::new(1, 0, 1), local);
    let n011 = corner_contribution(cell, IVec3::new(0, 1, 1), local);
    let n111 = corner_contribution(cell, IVec3::new(1, 1, 1), local);

    let u = fade(local.x);
    let v = fade(local.y);
    let w = fade(local.z);

    let x00 = lerp(n000, n100, u);
    let x10 = lerp(n010, n110, u);
    let x01 = lerp(n001, n101, u);
    let x11 = lerp(n011, n111, u);
    let y0 = lerp(x00, x10, v);
    let y1 = lerp(x01, x11, v);
    lerp(y0, y1, w)
}

/// Fractal sum of `octaves` noise layers, normalised by total amplitude
pub fn fbm(p: Vec3, settings: &GenerationSettings) -> f32 {
    let mut amplitude = 1.0f32;
    let mut frequency = 1.0f32;
    let mut total = 0.0f32;
    let mut norm = 0.0f32;

    for _ in 0..settings.octaves {
        total += amplitude * gradient_noise(p * frequency);
        norm += amplitude;
        amplitude *= settings.persistence;
        frequency *= settings.lacunarity;
    }

    if norm > 0.0 {
        total / norm
    } else {
        0.0
    }
}

/// Density at a world-space lattice position
pub fn density_at(world: Vec3, settings: &GenerationSettings) -> f32 {
    BASE_DENSITY + fbm(world * settings.scale, settings)
}

/// Linear index of lattice point `(i, j, k)` in an `n`-per-axis grid
#[inline]
pub fn lattice_index(i: u32, j: u32, k: u32, n: u32) -> usize {
    ((i as usize * n as usize + j as usize) * n as usize) + k as usize
}

/// Inverse of [`lattice_index`]
#[inline]
pub fn lattice_coords(index: usize, n: u32) -> (u32, u32, u32) {
    let n = n as usize;
    ((index / (n * n)) as u32, ((index / n) % n) as u32, (index % n) as u32)
}

/// Evaluate the field for every lattice point of a chunk
pub fn sample_lattice(
    origin: IVec3,
    resolution: u32,
    settings: &GenerationSettings,
) -> Vec<GridPoint> {
    let total = (resolution as usize).pow(3);
    (0..total)
        .into_par_iter()
        .map(|index| {
            let (i, j, k) = lattice_coords(index, resolution);
            let world = origin.as_vec3() + Vec3::new(i as f32, j as f32, k as f32);
            GridPoint::new(world, density_at(world, settings))
        })
        .collect()
}
