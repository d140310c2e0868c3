//! Math utilities: Gaussian kernels and separable filtering, seeded RNG
//! construction, tensor summary statistics.

use ndarray::{Array1, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Normalized 1D Gaussian kernel of the given (odd) size.
pub fn gaussian_kernel_1d(size: usize, sigma: f32) -> Array1<f32> {
    let center = (size / 2) as f32;
    let mut kernel = Array1::zeros(size);
    for (i, k) in kernel.iter_mut().enumerate() {
        let d = i as f32 - center;
        *k = (-d * d / (2.0 * sigma * sigma)).exp();
    }
    let sum = kernel.sum();
    kernel / sum
}

/// Separable Gaussian filtering of a `[batch, channel, h, w]` tensor, one
/// 1D pass per spatial axis.
///
/// `pad` is the zero padding applied on each side of each axis:
/// - `0` — valid filtering, output shrinks by `k - 1` per axis
/// - `(k - 1) / 2` — same-size filtering
/// - `k - 1` — full filtering, which for a symmetric kernel is the adjoint
///   of valid filtering (used to push gradients back through the window)
pub fn gaussian_filter(x: &Array4<f32>, kernel: &Array1<f32>, pad: usize) -> Array4<f32> {
    filter_axis(&filter_axis(x, kernel, pad, false), kernel, pad, true)
}

/// One 1D correlation pass along the width (`vertical = false`) or height
/// (`vertical = true`) axis.
fn filter_axis(x: &Array4<f32>, kernel: &Array1<f32>, pad: usize, vertical: bool) -> Array4<f32> {
    let (batch, channels, h, w) = x.dim();
    let k = kernel.len();

    let span = if vertical { h } else { w };
    assert!(
        span + 2 * pad >= k,
        "filter kernel {} larger than padded extent {}",
        k,
        span + 2 * pad
    );

    let (h_out, w_out) = if vertical {
        (h + 2 * pad + 1 - k, w)
    } else {
        (h, w + 2 * pad + 1 - k)
    };
    let mut out = Array4::zeros((batch, channels, h_out, w_out));

    for b in 0..batch {
        for c in 0..channels {
            for i in 0..h_out {
                for j in 0..w_out {
                    let mut acc = 0.0f32;
                    for (t, &kv) in kernel.iter().enumerate() {
                        let (si, sj) = if vertical {
                            (i as isize + t as isize - pad as isize, j as isize)
                        } else {
                            (i as isize, j as isize + t as isize - pad as isize)
                        };
                        if si < 0 || si >= h as isize || sj < 0 || sj >= w as isize {
                            continue;
                        }
                        acc += kv * x[[b, c, si as usize, sj as usize]];
                    }
                    out[[b, c, i, j]] = acc;
                }
            }
        }
    }
    out
}

/// Deterministic RNG for reproducible runs and tests.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Summary statistics of a tensor, for progress banners.
#[derive(Debug, Clone, Copy)]
pub struct TensorStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

pub fn tensor_stats(x: &Array4<f32>) -> TensorStats {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f64;
    for &v in x.iter() {
        min = min.min(v);
        max = max.max(v);
        sum += f64::from(v);
    }
    let mean = if x.is_empty() {
        0.0
    } else {
        (sum / x.len() as f64) as f32
    };
    TensorStats { min, max, mean }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_gaussian_kernel_normalized_and_symmetric() {
        let k = gaussian_kernel_1d(11, 1.5);
        assert_abs_diff_eq!(k.sum(), 1.0, epsilon = 1e-5);
        for i in 0..5 {
            assert_abs_diff_eq!(k[i], k[10 - i], epsilon = 1e-6);
        }
        // Peak in the middle.
        assert!(k[5] > k[4]);
    }

    #[test]
    fn test_valid_filter_shrinks_and_preserves_constants() {
        let x = Array4::from_elem((1, 1, 8, 8), 0.7);
        let k = gaussian_kernel_1d(5, 1.0);
        let out = gaussian_filter(&x, &k, 0);
        assert_eq!(out.dim(), (1, 1, 4, 4));
        for &v in out.iter() {
            assert_abs_diff_eq!(v, 0.7, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_same_filter_keeps_shape() {
        let x = Array4::from_elem((1, 2, 6, 6), 1.0);
        let k = gaussian_kernel_1d(5, 1.0);
        let out = gaussian_filter(&x, &k, 2);
        assert_eq!(out.dim(), x.dim());
    }

    #[test]
    fn test_full_filter_is_adjoint_of_valid() {
        // <G x, g> on the valid grid must equal <x, Gᵀ g> on the input grid.
        let mut rng = seeded_rng(31);
        use ndarray_rand::RandomExt;
        use rand::distributions::Uniform;
        let dist = Uniform::new(-1.0f32, 1.0);
        let x = Array4::random_using((1, 1, 9, 9), dist, &mut rng);
        let k = gaussian_kernel_1d(5, 1.2);

        let gx = gaussian_filter(&x, &k, 0);
        let g = Array4::random_using(gx.raw_dim(), dist, &mut rng);
        let gt_g = gaussian_filter(&g, &k, 4);

        let lhs: f32 = gx.iter().zip(g.iter()).map(|(&a, &b)| a * b).sum();
        let rhs: f32 = x.iter().zip(gt_g.iter()).map(|(&a, &b)| a * b).sum();
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-3);
    }

    #[test]
    fn test_tensor_stats() {
        let mut x = Array4::zeros((1, 1, 2, 2));
        x[[0, 0, 0, 0]] = -1.0;
        x[[0, 0, 1, 1]] = 3.0;
        let stats = tensor_stats(&x);
        assert_abs_diff_eq!(stats.min, -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stats.max, 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stats.mean, 0.5, epsilon = 1e-6);
    }
}
