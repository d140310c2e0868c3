//! # eipc (Elemental-Image Pre-Correction)
//!
//! Pixel-domain aberration pre-correction for elemental images (EIs) captured
//! through a microlens array.
//!
//! ## Overview
//!
//! Instead of learning network weights, the corrector treats the **image
//! itself as the optimized variable**: it repeatedly compares a structural
//! feature map of the current EI against the feature map of an ideal,
//! aberration-free EI, and walks the EI's pixel values down the gradient of a
//! composite perceptual loss (windowed SSIM + MSE) until the loss drops below
//! a threshold or stops improving.
//!
//! ## Structure
//!
//! - [`core`] — convolution/batch-norm kernels and the [`FeatureExtractor`]
//!   with its closed-form input gradient
//! - [`loss`] — the composite perceptual loss and its analytic gradient
//! - [`correction`] — the correction loop: pixel-space momentum SGD,
//!   plateau learning-rate scheduling, patience-based early stopping
//! - [`data`] — synthetic EI generation for tests and demos
//! - [`checkpoint`] — extractor weight persistence
//! - [`gpu`] — burn-backed GPU mirror of the correction hot path
//! - [`utils`] — Gaussian kernels, seeded RNG, tensor statistics

pub mod checkpoint;
pub mod core;
pub mod correction;
pub mod data;
pub mod gpu;
pub mod loss;
pub mod utils;

pub use crate::core::{
    Activations, CorrectionError, CorrectionResult, ExtractorConfig, FeatureExtractor, StatsMode,
};
pub use crate::correction::{
    correct_batch, correct_batch_parallel, correct_single, Correction, CorrectionObserver,
    EpochRecord, MomentumSgd, PlateauScheduler, SilentObserver, StderrReporter, StopReason,
};
pub use crate::loss::{LossConfig, PerceptualLoss};

use serde::{Deserialize, Serialize};

/// Plateau learning-rate scheduler configuration.
///
/// The scheduler multiplies the learning rate by `factor` once the observed
/// loss has failed to improve significantly for more than `patience`
/// consecutive epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Multiplicative decay applied to the learning rate on a plateau. Default 0.8.
    pub factor: f32,
    /// Number of non-improving epochs tolerated before a decay. Default 3.
    pub patience: usize,
    /// Relative significance threshold: a loss counts as an improvement only
    /// if it is below `best * (1 - threshold)`. Default 1e-4.
    pub threshold: f32,
    /// Lower bound for the learning rate. Default 0.0.
    pub min_lr: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            factor: 0.8,
            patience: 3,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }
}

/// Correction loop configuration.
///
/// Every tunable of the loop lives here; there are no hidden globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// Initial pixel-update step size. Default 5e-3.
    pub learning_rate: f32,
    /// SGD momentum on the pixel buffer. Default 0.9.
    pub momentum: f32,
    /// Epoch budget. Default 120.
    pub epochs: usize,
    /// Convergence threshold on the best loss. Default 1e-4.
    pub threshold: f32,
    /// Early-stop patience: consecutive epochs without significant
    /// improvement before the loop gives up. Default 10.
    pub patience: usize,
    /// Significance margin for the improvement check — losses within this
    /// margin of the best are treated as numerical noise. Default 1e-6.
    pub improvement_epsilon: f32,
    /// Chunk size when many EIs are corrected in one run. Default 16.
    pub batch_size: usize,
    /// Whether the extractor's normalization statistics keep adapting during
    /// correction ([`StatsMode::Adapt`], the original behavior) or stay
    /// frozen ([`StatsMode::Frozen`]).
    pub stats_mode: StatsMode,
    /// Composite perceptual loss parameters.
    pub loss: LossConfig,
    /// Plateau scheduler parameters.
    pub scheduler: SchedulerConfig,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-3,
            momentum: 0.9,
            epochs: 120,
            threshold: 1e-4,
            patience: 10,
            improvement_epsilon: 1e-6,
            batch_size: 16,
            stats_mode: StatsMode::Adapt,
            loss: LossConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl CorrectionConfig {
    /// Check the configuration for values the loop cannot run with.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero epoch budget, zero patience or batch size,
    /// a non-positive learning rate, a negative threshold, momentum outside
    /// [0, 1), or a scheduler factor outside (0, 1).
    pub fn validate(&self) -> CorrectionResult<()> {
        if self.epochs == 0 {
            return Err(CorrectionError::InvalidConfig(
                "Epoch budget must be > 0".to_string(),
            ));
        }
        if self.patience == 0 {
            return Err(CorrectionError::InvalidConfig(
                "Patience must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(CorrectionError::InvalidConfig(
                "Batch size must be > 0".to_string(),
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(CorrectionError::InvalidConfig(
                "Learning rate must be positive".to_string(),
            ));
        }
        if self.threshold < 0.0 {
            return Err(CorrectionError::InvalidConfig(
                "Threshold must be non-negative".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(CorrectionError::InvalidConfig(format!(
                "Momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if self.scheduler.factor <= 0.0 || self.scheduler.factor >= 1.0 {
            return Err(CorrectionError::InvalidConfig(format!(
                "Scheduler factor must be in (0, 1), got {}",
                self.scheduler.factor
            )));
        }
        self.loss.validate()
    }
}
