//! The correction loop: pixel-space momentum SGD with plateau learning-rate
//! scheduling and patience-based early stopping.
//!
//! The distinguishing trait of this optimizer is its parameter set: **the
//! image itself**, not network weights. Each epoch extracts features from the
//! ideal EI (no gradient cache) and from the current subject EI (cached),
//! scores them with the composite perceptual loss, pushes the loss gradient
//! back into the subject's pixels, and takes one momentum-SGD step on them.
//!
//! Convergence bookkeeping:
//! - the best-so-far snapshot is only replaced on a strict improvement
//!   beyond a fixed significance margin, so it always holds the subject
//!   associated with the lowest loss seen to date;
//! - the plateau scheduler decays the step size after a run of non-improving
//!   epochs, using its own (relative) significance test;
//! - the loop stops early once the best loss is below the threshold or the
//!   stall counter reaches the outer patience, and otherwise terminates when
//!   the epoch budget runs out.

use crate::core::{Activations, CorrectionError, CorrectionResult, FeatureExtractor};
use crate::loss::PerceptualLoss;
use crate::{CorrectionConfig, SchedulerConfig};
use ndarray::Array4;
use rayon::prelude::*;
use serde::Serialize;

/// Per-epoch progress snapshot handed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    /// 1-based epoch index
    pub epoch: usize,
    /// Loss observed this epoch
    pub loss: f32,
    /// Best loss seen so far (including this epoch)
    pub best_loss: f32,
    /// Consecutive epochs without significant improvement
    pub stall: usize,
    /// Learning rate used this epoch
    pub learning_rate: f32,
}

/// Per-epoch progress callback. Purely observational — implementations must
/// not influence control flow.
pub trait CorrectionObserver {
    fn on_epoch(&mut self, record: &EpochRecord);
}

/// Observer that discards every record.
pub struct SilentObserver;

impl CorrectionObserver for SilentObserver {
    fn on_epoch(&mut self, _record: &EpochRecord) {}
}

/// Observer printing one status line per `every` epochs to stderr.
pub struct StderrReporter {
    pub every: usize,
}

impl Default for StderrReporter {
    fn default() -> Self {
        Self { every: 1 }
    }
}

impl CorrectionObserver for StderrReporter {
    fn on_epoch(&mut self, record: &EpochRecord) {
        if self.every != 0 && record.epoch % self.every == 0 {
            eprintln!(
                "Epoch {:>4} | Loss: {:.6} | Best: {:.6} | Stall: {} | LR: {:.8}",
                record.epoch, record.loss, record.best_loss, record.stall, record.learning_rate
            );
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Best loss fell below the threshold, or the stall counter reached the
    /// outer patience. Inspect [`Correction::best_loss`] against the
    /// threshold to tell the two apart.
    Converged,
    /// The epoch budget ran out first.
    EpochBudgetExhausted,
}

/// Result of one correction run.
#[derive(Debug, Clone)]
pub struct Correction {
    /// Preliminary pre-corrected EI: the best-so-far subject snapshot, not
    /// necessarily the last-computed one.
    pub preliminary: Array4<f32>,
    /// One loss value per completed epoch.
    pub loss_history: Vec<f32>,
    /// Lowest loss observed.
    pub best_loss: f32,
    /// Number of epochs actually run.
    pub epochs_run: usize,
    pub stop: StopReason,
}

// ============================================================================
// Optimizer and schedules
// ============================================================================

/// Momentum SGD over an opaque mutable tensor buffer.
///
/// The optimizer neither knows nor cares whether the buffer holds network
/// weights or raw pixel values: `v = μ·v + g`, `p -= lr·v`.
#[derive(Debug, Clone)]
pub struct MomentumSgd {
    momentum: f32,
    velocity: Option<Array4<f32>>,
}

impl MomentumSgd {
    pub fn new(momentum: f32) -> Self {
        Self {
            momentum,
            velocity: None,
        }
    }

    /// Apply one descent step to `param` in place. The velocity buffer is
    /// lazily sized from the first gradient seen.
    pub fn step(&mut self, param: &mut Array4<f32>, grad: &Array4<f32>, lr: f32) {
        let momentum = self.momentum;
        let v = self
            .velocity
            .get_or_insert_with(|| Array4::zeros(grad.raw_dim()));
        v.zip_mut_with(grad, |v, &g| *v = momentum * *v + g);
        param.zip_mut_with(v, |p, &v| *p -= lr * v);
    }
}

/// Plateau-sensitive learning-rate schedule.
///
/// Tracks its own best metric with a *relative* significance threshold and
/// decays the learning rate by `factor` once more than `patience`
/// consecutive observations failed to beat it.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    lr: f32,
    factor: f32,
    patience: usize,
    threshold: f32,
    min_lr: f32,
    best: f32,
    num_bad: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f32, config: &SchedulerConfig) -> Self {
        Self {
            lr: initial_lr,
            factor: config.factor,
            patience: config.patience,
            threshold: config.threshold,
            min_lr: config.min_lr,
            best: f32::INFINITY,
            num_bad: 0,
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    /// Feed one metric observation; returns the (possibly decayed) rate.
    pub fn step(&mut self, metric: f32) -> f32 {
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.num_bad = 0;
        } else {
            self.num_bad += 1;
            if self.num_bad > self.patience {
                self.lr = (self.lr * self.factor).max(self.min_lr);
                self.num_bad = 0;
            }
        }
        self.lr
    }
}

/// Best-loss bookkeeping with a fixed absolute significance margin.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    best: f32,
    stall: usize,
    epsilon: f32,
}

impl ConvergenceTracker {
    pub fn new(epsilon: f32) -> Self {
        Self {
            best: f32::INFINITY,
            stall: 0,
            epsilon,
        }
    }

    /// Record one loss; returns whether it significantly improved on the
    /// best so far. The first finite observation always improves.
    pub fn observe(&mut self, loss: f32) -> bool {
        if loss < self.best - self.epsilon {
            self.best = loss;
            self.stall = 0;
            true
        } else {
            self.stall += 1;
            false
        }
    }

    pub fn best_loss(&self) -> f32 {
        self.best
    }

    pub fn stall(&self) -> usize {
        self.stall
    }
}

// ============================================================================
// Correction loops
// ============================================================================

/// Correct a single (possibly batched) EI tensor against its aberration-free
/// counterpart.
///
/// `initial` is the uncorrected subject; `original` is the ideal reference.
/// Both must have identical shapes. The extractor's weights are fixed; its
/// normalization statistics follow `config.stats_mode`.
///
/// # Errors
/// - `InvalidConfig` from [`CorrectionConfig::validate`]
/// - `ShapeMismatch` if the tensors disagree, the extractor's channel count
///   does not match, or the SSIM window does not fit the feature maps
pub fn correct_single(
    extractor: &mut FeatureExtractor,
    initial: &Array4<f32>,
    original: &Array4<f32>,
    config: &CorrectionConfig,
    observer: &mut dyn CorrectionObserver,
) -> CorrectionResult<Correction> {
    config.validate()?;
    if initial.dim() != original.dim() {
        return Err(CorrectionError::ShapeMismatch(format!(
            "Initial EI {:?} vs original EI {:?}",
            initial.dim(),
            original.dim()
        )));
    }

    extractor.set_stats_mode(config.stats_mode);
    let loss_fn = PerceptualLoss::new(config.loss.clone())?;

    let mut subject = initial.clone();
    let mut best = subject.clone();
    let mut acts = Activations::default();
    let mut optimizer = MomentumSgd::new(config.momentum);
    let mut scheduler = PlateauScheduler::new(config.learning_rate, &config.scheduler);
    let mut tracker = ConvergenceTracker::new(config.improvement_epsilon);

    let mut history = Vec::with_capacity(config.epochs);
    let mut stop = StopReason::EpochBudgetExhausted;
    let mut epochs_run = 0;

    for epoch in 1..=config.epochs {
        // Reference features carry no gradient cache; the subject's do. Both
        // calls adapt the normalization statistics in `Adapt` mode.
        let target_features = extractor.extract(original)?;
        extractor.extract_cached(&subject, &mut acts)?;

        let (loss, dfeat) = loss_fn.evaluate_with_grad(acts.features(), &target_features)?;
        let dsubject = extractor.backward_input(&acts, &dfeat)?;
        optimizer.step(&mut subject, &dsubject, scheduler.lr());

        history.push(loss);
        if tracker.observe(loss) {
            best.assign(&subject);
        }

        observer.on_epoch(&EpochRecord {
            epoch,
            loss,
            best_loss: tracker.best_loss(),
            stall: tracker.stall(),
            learning_rate: scheduler.lr(),
        });

        // The scheduler runs after the improvement bookkeeping so its
        // decision uses the just-observed loss.
        scheduler.step(loss);

        epochs_run = epoch;
        if tracker.best_loss() < config.threshold || tracker.stall() >= config.patience {
            stop = StopReason::Converged;
            break;
        }
    }

    Ok(Correction {
        preliminary: best,
        loss_history: history,
        best_loss: tracker.best_loss(),
        epochs_run,
        stop,
    })
}

/// Correct a sequence of EI pairs sequentially.
///
/// Each pair gets its own extractor clone, so every loop exclusively owns its
/// normalization statistics and the outcomes match the parallel variant.
///
/// # Errors
/// Propagates the first failure from [`correct_single`].
pub fn correct_batch(
    extractor: &FeatureExtractor,
    pairs: &[(Array4<f32>, Array4<f32>)],
    config: &CorrectionConfig,
) -> CorrectionResult<Vec<Correction>> {
    pairs
        .iter()
        .map(|(initial, original)| {
            let mut ex = extractor.clone();
            correct_single(&mut ex, initial, original, config, &mut SilentObserver)
        })
        .collect()
}

/// Correct a sequence of EI pairs in parallel with Rayon.
///
/// Corrections are independent: each worker clones the extractor and owns
/// its statistics trajectory, so results are identical to [`correct_batch`].
///
/// # Errors
/// Propagates the first failure from [`correct_single`].
pub fn correct_batch_parallel(
    extractor: &FeatureExtractor,
    pairs: &[(Array4<f32>, Array4<f32>)],
    config: &CorrectionConfig,
) -> CorrectionResult<Vec<Correction>> {
    pairs
        .par_iter()
        .map(|(initial, original)| {
            let mut ex = extractor.clone();
            correct_single(&mut ex, initial, original, config, &mut SilentObserver)
        })
        .collect()
}
