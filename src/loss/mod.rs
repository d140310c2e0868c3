//! Composite perceptual loss: windowed structural similarity plus mean
//! squared error over feature tensors.
//!
//! ```text
//! loss = ω · (1 − SSIM(pred, target)) + (1 − ω) · MSE(pred, target)
//! ```
//!
//! SSIM uses Gaussian-windowed local statistics computed with valid-mode
//! filtering, averaged over batch, channels, and valid positions. The
//! gradient with respect to `pred` is closed-form: the partials of the SSIM
//! map with respect to the local statistics are pushed back through the
//! window by adjoint Gaussian filtering (full-padding correlation, which for
//! a symmetric window is its own adjoint).

use crate::core::{CorrectionError, CorrectionResult};
use crate::utils::{gaussian_filter, gaussian_kernel_1d};
use ndarray::{Array1, Array4};
use serde::{Deserialize, Serialize};

/// Composite loss parameters. The defaults are the paper-validated values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// Weight of the structural term; the intensity term gets `1 - omega`.
    /// Default 0.8.
    pub omega: f32,
    /// Dynamic range of the compared tensors. Default 1.0.
    pub data_range: f32,
    /// Gaussian window edge, odd. Default 11.
    pub window_size: usize,
    /// Gaussian window standard deviation. Default 1.5.
    pub sigma: f32,
    /// SSIM luminance stabilizer. Default 0.01.
    pub k1: f32,
    /// SSIM contrast stabilizer. Default 0.03.
    pub k2: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            omega: 0.8,
            data_range: 1.0,
            window_size: 11,
            sigma: 1.5,
            k1: 0.01,
            k2: 0.03,
        }
    }
}

impl LossConfig {
    /// # Errors
    /// `InvalidConfig` if omega leaves `[0, 1]`, the window is even or zero,
    /// or a numeric parameter is non-positive.
    pub fn validate(&self) -> CorrectionResult<()> {
        if !(0.0..=1.0).contains(&self.omega) {
            return Err(CorrectionError::InvalidConfig(format!(
                "omega must be in [0, 1], got {}",
                self.omega
            )));
        }
        if self.data_range <= 0.0 {
            return Err(CorrectionError::InvalidConfig(
                "data_range must be positive".to_string(),
            ));
        }
        if self.window_size == 0 || self.window_size % 2 == 0 {
            return Err(CorrectionError::InvalidConfig(format!(
                "SSIM window must be odd and positive, got {}",
                self.window_size
            )));
        }
        if self.sigma <= 0.0 || self.k1 <= 0.0 || self.k2 <= 0.0 {
            return Err(CorrectionError::InvalidConfig(
                "sigma, k1 and k2 must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local statistics of a pred/target pair on the valid window grid.
struct WindowStats {
    mu_x: Array4<f32>,
    mu_y: Array4<f32>,
    vx: Array4<f32>,
    vy: Array4<f32>,
    cov: Array4<f32>,
}

/// Composite perceptual loss with a pre-computed Gaussian window.
#[derive(Debug, Clone)]
pub struct PerceptualLoss {
    config: LossConfig,
    window: Array1<f32>,
}

impl PerceptualLoss {
    /// # Errors
    /// `InvalidConfig` if the configuration fails [`LossConfig::validate`].
    pub fn new(config: LossConfig) -> CorrectionResult<Self> {
        config.validate()?;
        let window = gaussian_kernel_1d(config.window_size, config.sigma);
        Ok(Self { config, window })
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    fn check_shapes(&self, pred: &Array4<f32>, target: &Array4<f32>) -> CorrectionResult<()> {
        if pred.dim() != target.dim() {
            return Err(CorrectionError::ShapeMismatch(format!(
                "Prediction {:?} vs target {:?}",
                pred.dim(),
                target.dim()
            )));
        }
        let (_, _, h, w) = pred.dim();
        let win = self.config.window_size;
        if h < win || w < win {
            return Err(CorrectionError::ShapeMismatch(format!(
                "SSIM window {} exceeds spatial extent {}x{}",
                win, h, w
            )));
        }
        Ok(())
    }

    /// Valid-mode windowed means, variances, and covariance.
    fn window_stats(&self, pred: &Array4<f32>, target: &Array4<f32>) -> WindowStats {
        let w = &self.window;
        let mu_x = gaussian_filter(pred, w, 0);
        let mu_y = gaussian_filter(target, w, 0);
        let vx = gaussian_filter(&(pred * pred), w, 0) - &mu_x * &mu_x;
        let vy = gaussian_filter(&(target * target), w, 0) - &mu_y * &mu_y;
        let cov = gaussian_filter(&(pred * target), w, 0) - &mu_x * &mu_y;
        WindowStats {
            mu_x,
            mu_y,
            vx,
            vy,
            cov,
        }
    }

    fn stabilizers(&self) -> (f32, f32) {
        let c1 = (self.config.k1 * self.config.data_range).powi(2);
        let c2 = (self.config.k2 * self.config.data_range).powi(2);
        (c1, c2)
    }

    /// Compute the composite loss.
    ///
    /// # Errors
    /// `ShapeMismatch` if the tensors disagree or the window does not fit.
    pub fn evaluate(&self, pred: &Array4<f32>, target: &Array4<f32>) -> CorrectionResult<f32> {
        self.check_shapes(pred, target)?;
        let stats = self.window_stats(pred, target);
        let (c1, c2) = self.stabilizers();

        let a1 = 2.0 * (&stats.mu_x * &stats.mu_y) + c1;
        let a2 = 2.0 * &stats.cov + c2;
        let b1 = &stats.mu_x * &stats.mu_x + &stats.mu_y * &stats.mu_y + c1;
        let b2 = &stats.vx + &stats.vy + c2;
        let s = (&a1 * &a2) / (&b1 * &b2);
        let ssim = s.sum() / s.len() as f32;

        let diff = pred - target;
        let mse = diff.iter().map(|&d| d * d).sum::<f32>() / diff.len() as f32;

        Ok(self.config.omega * (1.0 - ssim) + (1.0 - self.config.omega) * mse)
    }

    /// Compute the composite loss and its gradient with respect to `pred`.
    ///
    /// # Errors
    /// `ShapeMismatch` if the tensors disagree or the window does not fit.
    pub fn evaluate_with_grad(
        &self,
        pred: &Array4<f32>,
        target: &Array4<f32>,
    ) -> CorrectionResult<(f32, Array4<f32>)> {
        self.check_shapes(pred, target)?;
        let stats = self.window_stats(pred, target);
        let (c1, c2) = self.stabilizers();
        let omega = self.config.omega;

        let a1 = 2.0 * (&stats.mu_x * &stats.mu_y) + c1;
        let a2 = 2.0 * &stats.cov + c2;
        let b1 = &stats.mu_x * &stats.mu_x + &stats.mu_y * &stats.mu_y + c1;
        let b2 = &stats.vx + &stats.vy + c2;
        let denom = &b1 * &b2;
        let s = (&a1 * &a2) / &denom;
        let n_valid = s.len() as f32;
        let ssim = s.sum() / n_valid;

        // Partials of the SSIM map with respect to the local statistics.
        let ds_dmu_x = 2.0 * (&stats.mu_y * &a2) / &denom - 2.0 * (&stats.mu_x * &s) / &b1;
        let ds_dvx = -(&s / &b2);
        let ds_dcov = 2.0 * &a1 / &denom;

        // Push back through μ = G·x, v = G·x² − μ², cov = G·xy − μxμy. The
        // products with the statistics maps happen on the valid grid, the
        // per-pixel factors after the adjoint filtering.
        let inner = &ds_dmu_x - 2.0 * (&stats.mu_x * &ds_dvx) - &stats.mu_y * &ds_dcov;
        let win = &self.window;
        let adj_pad = self.config.window_size - 1;
        let gx = gaussian_filter(&inner, win, adj_pad)
            + 2.0 * (pred * &gaussian_filter(&ds_dvx, win, adj_pad))
            + target * &gaussian_filter(&ds_dcov, win, adj_pad);

        let diff = pred - target;
        let n_total = diff.len() as f32;
        let mse = diff.iter().map(|&d| d * d).sum::<f32>() / n_total;

        let loss = omega * (1.0 - ssim) + (1.0 - omega) * mse;
        let grad = gx * (-omega / n_valid) + diff * (2.0 * (1.0 - omega) / n_total);
        Ok((loss, grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::seeded_rng;
    use approx::assert_abs_diff_eq;
    use ndarray::Array4;
    use ndarray_rand::RandomExt;
    use rand::distributions::Uniform;

    fn test_loss(omega: f32) -> PerceptualLoss {
        PerceptualLoss::new(LossConfig {
            omega,
            window_size: 7,
            ..LossConfig::default()
        })
        .expect("loss")
    }

    fn random_pair(seed: u64) -> (Array4<f32>, Array4<f32>) {
        let mut rng = seeded_rng(seed);
        let dist = Uniform::new(0.0f32, 1.0);
        let a = Array4::random_using((1, 2, 12, 12), dist, &mut rng);
        let b = Array4::random_using((1, 2, 12, 12), dist, &mut rng);
        (a, b)
    }

    #[test]
    fn test_identity_is_zero_for_all_omegas() {
        let (x, _) = random_pair(1);
        for &omega in &[0.0, 0.25, 0.5, 0.8, 1.0] {
            let loss = test_loss(omega).evaluate(&x, &x).expect("loss");
            assert_abs_diff_eq!(loss, 0.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_distinct_images_positive_loss() {
        let (a, b) = random_pair(2);
        let loss = test_loss(0.8).evaluate(&a, &b).expect("loss");
        assert!(loss > 0.0, "loss for distinct images should be positive");
    }

    #[test]
    fn test_shape_mismatch_fails() {
        let (a, _) = random_pair(3);
        let b = Array4::<f32>::zeros((1, 2, 10, 10));
        assert!(test_loss(0.8).evaluate(&a, &b).is_err());
        assert!(test_loss(0.8).evaluate_with_grad(&a, &b).is_err());
    }

    #[test]
    fn test_window_larger_than_image_fails() {
        let loss = PerceptualLoss::new(LossConfig {
            window_size: 11,
            ..LossConfig::default()
        })
        .expect("loss");
        let x = Array4::<f32>::zeros((1, 1, 8, 8));
        assert!(loss.evaluate(&x, &x).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(PerceptualLoss::new(LossConfig {
            omega: 1.5,
            ..LossConfig::default()
        })
        .is_err());
        assert!(PerceptualLoss::new(LossConfig {
            window_size: 8,
            ..LossConfig::default()
        })
        .is_err());
        assert!(PerceptualLoss::new(LossConfig {
            data_range: 0.0,
            ..LossConfig::default()
        })
        .is_err());
    }

    #[test]
    fn test_mse_term_symmetric() {
        let (a, b) = random_pair(4);
        let loss = test_loss(0.0);
        let fwd = loss.evaluate(&a, &b).expect("fwd");
        let rev = loss.evaluate(&b, &a).expect("rev");
        assert_abs_diff_eq!(fwd, rev, epsilon = 1e-6);
    }

    #[test]
    fn test_ssim_term_symmetric() {
        // The covariance formulation of SSIM is symmetric under swap.
        let (a, b) = random_pair(5);
        let loss = test_loss(1.0);
        let fwd = loss.evaluate(&a, &b).expect("fwd");
        let rev = loss.evaluate(&b, &a).expect("rev");
        assert_abs_diff_eq!(fwd, rev, epsilon = 1e-5);
    }

    #[test]
    fn test_forward_matches_with_grad_forward() {
        let (a, b) = random_pair(6);
        let loss = test_loss(0.8);
        let fwd = loss.evaluate(&a, &b).expect("fwd");
        let (fwd2, _) = loss.evaluate_with_grad(&a, &b).expect("with grad");
        assert_abs_diff_eq!(fwd, fwd2, epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let (pred, target) = random_pair(7);
        let loss = test_loss(0.8);
        let (_, grad) = loss.evaluate_with_grad(&pred, &target).expect("grad");

        let h = 1e-3f32;
        for &idx in &[(0, 0, 0, 0), (0, 0, 5, 7), (0, 1, 3, 3), (0, 1, 11, 11)] {
            let mut up = pred.clone();
            up[[idx.0, idx.1, idx.2, idx.3]] += h;
            let mut down = pred.clone();
            down[[idx.0, idx.1, idx.2, idx.3]] -= h;
            let fd = (loss.evaluate(&up, &target).expect("up")
                - loss.evaluate(&down, &target).expect("down"))
                / (2.0 * h);
            let an = grad[[idx.0, idx.1, idx.2, idx.3]];
            let tol = 1e-2 + 0.05 * fd.abs().max(an.abs());
            assert!(
                (fd - an).abs() <= tol,
                "{:?}: finite diff {} vs analytic {}",
                idx,
                fd,
                an
            );
        }
    }

    #[test]
    fn test_gradient_zero_at_identity() {
        let (x, _) = random_pair(8);
        let loss = test_loss(0.8);
        let (value, grad) = loss.evaluate_with_grad(&x, &x).expect("grad");
        assert_abs_diff_eq!(value, 0.0, epsilon = 1e-4);
        for &g in grad.iter() {
            assert_abs_diff_eq!(g, 0.0, epsilon = 1e-3);
        }
    }
}
