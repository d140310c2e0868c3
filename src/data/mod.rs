//! Synthetic elemental-image generation for tests and demos.
//!
//! Real EI capture and image file I/O live upstream; these generators produce
//! normalized `[batch, channel, h, w]` tensors with values in `[0, 1]`.

use crate::utils::{gaussian_filter, gaussian_kernel_1d, seeded_rng};
use ndarray::Array4;
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;

/// Checkerboard pattern with `tile`-pixel squares, values 0.1 and 0.9.
pub fn checkerboard(batch: usize, channels: usize, h: usize, w: usize, tile: usize) -> Array4<f32> {
    let tile = tile.max(1);
    Array4::from_shape_fn((batch, channels, h, w), |(_, _, i, j)| {
        if ((i / tile) + (j / tile)) % 2 == 0 {
            0.9
        } else {
            0.1
        }
    })
}

/// Constant-valued field.
pub fn flat(batch: usize, channels: usize, h: usize, w: usize, value: f32) -> Array4<f32> {
    Array4::from_elem((batch, channels, h, w), value)
}

/// Uniform noise in `[0, 1]`, deterministic for a given seed.
pub fn noise(batch: usize, channels: usize, h: usize, w: usize, seed: u64) -> Array4<f32> {
    let mut rng = seeded_rng(seed);
    Array4::random_using((batch, channels, h, w), Uniform::new(0.0f32, 1.0), &mut rng)
}

/// Gaussian defocus blur, a crude stand-in for the upstream optical
/// aberration simulation. Same-size filtering, output stays in `[0, 1]`.
pub fn defocus(image: &Array4<f32>, sigma: f32) -> Array4<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let size = 2 * radius + 1;
    let kernel = gaussian_kernel_1d(size, sigma);
    gaussian_filter(image, &kernel, radius)
}
