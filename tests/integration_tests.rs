//! Integration tests for EI pre-correction.
//!
//! These tests verify end-to-end loop behavior:
//! - An already-ideal subject converges immediately
//! - Optimization strictly improves on the first-epoch loss
//! - The loop always terminates within the epoch budget
//! - The best-loss bookkeeping tracks the running minimum
//! - Parallel batch correction matches the sequential path

use eipc::correction::{
    correct_batch, correct_batch_parallel, correct_single, SilentObserver, StopReason,
};
use eipc::utils::seeded_rng;
use eipc::{data, CorrectionConfig, ExtractorConfig, FeatureExtractor, LossConfig, StatsMode};
use ndarray::Array4;

fn small_extractor(seed: u64) -> FeatureExtractor {
    let mut rng = seeded_rng(seed);
    FeatureExtractor::with_rng(
        ExtractorConfig {
            in_channels: 3,
            feature_channels: 6,
            ..ExtractorConfig::default()
        },
        &mut rng,
    )
    .expect("create extractor")
}

fn test_config() -> CorrectionConfig {
    CorrectionConfig {
        loss: LossConfig {
            window_size: 7,
            ..LossConfig::default()
        },
        ..CorrectionConfig::default()
    }
}

#[test]
fn test_identical_inputs_converge_on_first_epoch() {
    let mut extractor = small_extractor(101);
    let ei = data::checkerboard(1, 3, 16, 16, 4);
    let config = test_config();

    let result = correct_single(&mut extractor, &ei, &ei, &config, &mut SilentObserver)
        .expect("correction");

    // The loss of identical feature maps is ~0, below the threshold, so the
    // loop must stop after a single epoch regardless of the patience.
    assert_eq!(result.stop, StopReason::Converged);
    assert_eq!(result.epochs_run, 1);
    assert_eq!(result.loss_history.len(), 1);
    assert!(
        result.best_loss < config.threshold,
        "best loss {} should be below threshold {}",
        result.best_loss,
        config.threshold
    );

    // With a near-zero gradient the returned snapshot stays near the input.
    for (a, b) in result.preliminary.iter().zip(ei.iter()) {
        assert!(
            (a - b).abs() < 1e-3,
            "corrected EI drifted from the already-ideal input: {} vs {}",
            a,
            b
        );
    }
}

/// A gray field with a little sensor-noise jitter. A mathematically flat
/// image is a stationary point of the extractor (constant convolutions give
/// zero batch variance and all-zero ReLU pre-activations), so a realistic
/// "all-gray" subject carries jitter.
fn gray_subject(seed: u64) -> Array4<f32> {
    let jitter = data::noise(1, 3, 16, 16, seed);
    data::flat(1, 3, 16, 16, 0.49) + jitter * 0.02
}

#[test]
fn test_checkerboard_target_improves_over_gray_subject() {
    let mut extractor = small_extractor(102);
    let original = data::checkerboard(1, 3, 16, 16, 4);
    let initial = gray_subject(21);
    let config = test_config();

    let result = correct_single(&mut extractor, &initial, &original, &config, &mut SilentObserver)
        .expect("correction");

    assert!(result.loss_history.len() <= config.epochs);
    assert!(!result.loss_history.is_empty());
    for &loss in &result.loss_history {
        assert!(loss.is_finite());
        assert!(loss > -1e-4, "composite loss should be non-negative");
    }
    assert!(
        result.best_loss < result.loss_history[0],
        "optimization should strictly improve on the epoch-1 loss: best {} vs first {}",
        result.best_loss,
        result.loss_history[0]
    );
}

#[test]
fn test_unreachable_threshold_exhausts_budget() {
    let mut extractor = small_extractor(103);
    let original = data::checkerboard(1, 3, 16, 16, 4);
    let initial = data::noise(1, 3, 16, 16, 55);

    let config = CorrectionConfig {
        epochs: 15,
        threshold: 0.0,
        patience: 1000,
        ..test_config()
    };

    let result = correct_single(&mut extractor, &initial, &original, &config, &mut SilentObserver)
        .expect("correction");

    assert_eq!(result.stop, StopReason::EpochBudgetExhausted);
    assert_eq!(result.epochs_run, 15);
    assert_eq!(result.loss_history.len(), 15);
    assert!(result.best_loss > 0.0);
}

#[test]
fn test_best_loss_tracks_running_minimum() {
    let mut extractor = small_extractor(104);
    let original = data::checkerboard(1, 3, 16, 16, 4);
    let initial = gray_subject(22);
    let config = CorrectionConfig {
        epochs: 40,
        threshold: 0.0,
        patience: 1000,
        ..test_config()
    };

    let result = correct_single(&mut extractor, &initial, &original, &config, &mut SilentObserver)
        .expect("correction");

    let min = result
        .loss_history
        .iter()
        .cloned()
        .fold(f32::INFINITY, f32::min);

    // The snapshot ignores sub-epsilon improvements, so the best loss sits
    // within the significance margin of the true running minimum.
    assert!(result.best_loss >= min);
    assert!(
        result.best_loss <= min + config.improvement_epsilon + 1e-7,
        "best loss {} vs running minimum {}",
        result.best_loss,
        min
    );
}

#[test]
fn test_shape_mismatch_rejected() {
    let mut extractor = small_extractor(105);
    let a = Array4::<f32>::zeros((1, 3, 16, 16));
    let b = Array4::<f32>::zeros((1, 3, 18, 18));
    assert!(correct_single(&mut extractor, &a, &b, &test_config(), &mut SilentObserver).is_err());
}

#[test]
fn test_window_larger_than_ei_rejected() {
    let mut extractor = small_extractor(106);
    let ei = data::flat(1, 3, 8, 8, 0.5);
    let config = CorrectionConfig {
        loss: LossConfig {
            window_size: 11,
            ..LossConfig::default()
        },
        ..CorrectionConfig::default()
    };
    assert!(correct_single(&mut extractor, &ei, &ei, &config, &mut SilentObserver).is_err());
}

#[test]
fn test_parallel_matches_sequential() {
    let extractor = small_extractor(107);
    let config = CorrectionConfig {
        epochs: 10,
        threshold: 0.0,
        patience: 1000,
        ..test_config()
    };

    let pairs: Vec<(Array4<f32>, Array4<f32>)> = (0..2)
        .map(|i| {
            let original = data::checkerboard(1, 3, 16, 16, 3 + i);
            let initial = data::defocus(&original, 1.0);
            (initial, original)
        })
        .collect();

    let sequential = correct_batch(&extractor, &pairs, &config).expect("sequential");
    let parallel = correct_batch_parallel(&extractor, &pairs, &config).expect("parallel");

    assert_eq!(sequential.len(), parallel.len());
    for (seq, par) in sequential.iter().zip(parallel.iter()) {
        assert_eq!(seq.epochs_run, par.epochs_run);
        assert!(
            (seq.best_loss - par.best_loss).abs() < 1e-6,
            "sequential and parallel corrections should agree: {} vs {}",
            seq.best_loss,
            par.best_loss
        );
    }
}

#[test]
fn test_frozen_statistics_mode_runs() {
    let mut extractor = small_extractor(108);

    // Prime the running statistics with one adapting pass, then freeze.
    let warmup = data::noise(1, 3, 16, 16, 9);
    extractor.extract(&warmup).expect("warmup");

    let original = data::checkerboard(1, 3, 16, 16, 4);
    let initial = data::flat(1, 3, 16, 16, 0.5);
    let config = CorrectionConfig {
        epochs: 20,
        stats_mode: StatsMode::Frozen,
        ..test_config()
    };

    let before_mean = extractor.bn1.running_mean.clone();
    let result = correct_single(&mut extractor, &initial, &original, &config, &mut SilentObserver)
        .expect("correction");

    assert!(result.best_loss.is_finite());
    assert!(result.epochs_run <= config.epochs);
    // Frozen mode must leave the running statistics untouched.
    for (a, b) in before_mean.iter().zip(extractor.bn1.running_mean.iter()) {
        assert!((a - b).abs() < 1e-7);
    }
}

#[test]
fn test_batched_subject_tensor_supported() {
    // A batch of two EIs optimized jointly in one tensor.
    let mut extractor = small_extractor(109);
    let original = data::checkerboard(2, 3, 16, 16, 4);
    let initial = data::defocus(&original, 1.0);
    let config = CorrectionConfig {
        epochs: 5,
        ..test_config()
    };

    let result = correct_single(&mut extractor, &initial, &original, &config, &mut SilentObserver)
        .expect("correction");
    assert_eq!(result.preliminary.dim(), initial.dim());
    assert_eq!(result.loss_history.len(), result.epochs_run);
}
